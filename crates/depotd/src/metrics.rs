use prometheus::IntCounter;

lazy_static::lazy_static! {
    pub static ref MESSAGES_INJECTED: IntCounter = prometheus::register_int_counter!(
        "messages_injected",
        "total number of messages successfully injected"
    ).unwrap();
    pub static ref INJECTION_ERRORS: IntCounter = prometheus::register_int_counter!(
        "injection_errors",
        "total number of injections that failed"
    ).unwrap();
}
