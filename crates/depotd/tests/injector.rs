//! Injector behavior against a scripted backend: phase ordering, the
//! savepoint recovery loops, delivery spooling, announcement effects,
//! and failure isolation — all without a PostgreSQL server.

use dbpool::testing::{row, test_config, ScriptedBackend, ScriptedConnector};
use dbpool::{DbError, Pool, Value};
use depotd::inject::{Annotation, InjectError, Injector};
use depotd::mailbox::{Mailbox, Session};
use depotd::peers::PeerNotifier;
use depotd::vocab::Vocabularies;
use message::{Address, Message};
use std::sync::Arc;

const SIMPLE: &str = concat!(
    "Received: from relay.example by depot.example; Tue, 1 Jul 2003 10:52:37 +0200\r\n",
    "From: Ann <ann@example.com>\r\n",
    "To: bob@example.net\r\n",
    "Subject: greetings\r\n",
    "Date: Tue, 1 Jul 2003 10:52:00 +0200\r\n",
    "Content-Type: text/plain; charset=utf-8\r\n",
    "\r\n",
    "Hello\r\n",
);

fn conflict(constraint: &str) -> DbError {
    DbError::Query {
        message: format!("duplicate key value violates unique constraint \"{constraint}\""),
        constraint: Some(constraint.to_string()),
    }
}

/// A script that satisfies a single-target injection of SIMPLE.
fn simple_script() -> ScriptedBackend {
    ScriptedBackend::new()
        .on("select currval", vec![Ok(vec![row(&[("id", Value::Int(123))])])])
        .on(
            "select uidnext",
            vec![Ok(vec![row(&[
                ("uidnext", Value::Int(1)),
                ("nextmodseq", Value::BigInt(1)),
                ("first_recent", Value::Int(1)),
            ])])],
        )
        .on(
            "select id from bodyparts",
            vec![Ok(vec![row(&[("id", Value::Int(77))])])],
        )
        .on(
            "select id, name, localpart, domain from addresses",
            vec![Ok(vec![
                row(&[
                    ("id", Value::Int(41)),
                    ("name", Value::Text("Ann".to_string())),
                    ("localpart", Value::Text("ann".to_string())),
                    ("domain", Value::Text("example.com".to_string())),
                ]),
                row(&[
                    ("id", Value::Int(42)),
                    ("name", Value::Text("".to_string())),
                    ("localpart", Value::Text("bob".to_string())),
                    ("domain", Value::Text("example.net".to_string())),
                ]),
            ])],
        )
}

fn pool_with(backend: ScriptedBackend) -> Pool {
    Pool::new(test_config(1, 1), ScriptedConnector::new(vec![backend])).unwrap()
}

fn injector_for(message: Message, mailbox: &Arc<Mailbox>) -> Injector {
    let mut injector = Injector::new(message, vec![mailbox.clone()]);
    injector.with_vocabularies(Arc::new(Vocabularies::new()));
    injector
}

#[tokio::test]
async fn single_message_single_mailbox() {
    let backend = simple_script();
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 1, 1);
    let session = Session::new();
    mailbox.attach_session(session.clone());

    let (peers, mut peer_rx) = PeerNotifier::new();
    let mut injector = injector_for(Message::parse(SIMPLE.as_bytes()), &mailbox);
    injector.with_peers(peers);

    let report = injector.run(&pool).await.unwrap();
    assert_eq!(report.message_id, 123);
    assert_eq!(report.uid(5), Some(1));
    assert_eq!(report.modseq(5), Some(1));

    // The mailbox was at uidnext == first_recent with a live session, so
    // the with-recent increment ran and the session saw the new UID as
    // both unannounced and recent.
    let sql = log.lock().join("\n");
    assert!(sql.contains("first_recent=first_recent+1"), "{sql}");
    assert!(sql.contains("copy mailbox_messages"));
    assert!(sql.contains("copy part_numbers"));
    assert!(sql.contains("copy header_fields"));
    assert!(sql.contains("copy address_fields"));
    assert!(sql.contains("insert into date_fields"));
    assert!(sql.contains("commit"));
    assert!(!sql.contains("insert into deliveries"));

    assert!(session.unannounced().contains(&1));
    assert!(session.recent().contains(&1));

    // Announce advanced the cached counters and told the peers.
    assert_eq!(mailbox.uidnext(), 2);
    assert_eq!(mailbox.nextmodseq(), 2);
    assert_eq!(
        peer_rx.try_recv().unwrap(),
        "mailbox \"inbox\" uidnext=2 nextmodseq=2"
    );
}

#[tokio::test]
async fn duplicate_bodypart_is_recovered_via_savepoint() {
    let backend = simple_script().on(
        "insert into bodyparts",
        vec![Err(conflict("bodyparts_hash_key"))],
    );
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 1, 1);
    let injector = injector_for(Message::parse(SIMPLE.as_bytes()), &mailbox);
    injector.run(&pool).await.unwrap();

    let sql = log.lock().join("\n");
    assert!(sql.contains("savepoint a0"), "{sql}");
    assert!(sql.contains("rollback to a0"), "{sql}");
    assert!(sql.contains("select id from bodyparts"));
    assert!(sql.contains("commit"));
}

#[tokio::test]
async fn new_flag_and_annotation_names_are_created() {
    let backend = simple_script()
        .on(
            "select id, name from flag_names",
            vec![
                Ok(vec![]),
                Ok(vec![row(&[
                    ("id", Value::Int(7)),
                    ("name", Value::Text("NewFlag".to_string())),
                ])]),
            ],
        )
        .on("copy flag_names", vec![Err(conflict("fn_uname"))])
        .on(
            "select id, name from annotation_names",
            vec![
                Ok(vec![]),
                Ok(vec![row(&[
                    ("id", Value::Int(3)),
                    ("name", Value::Text("/comment".to_string())),
                ])]),
            ],
        );
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 1, 1);
    let vocab = Arc::new(Vocabularies::new());
    let mut injector = Injector::new(Message::parse(SIMPLE.as_bytes()), vec![mailbox.clone()]);
    injector.with_vocabularies(vocab.clone());
    injector.set_flags(["NewFlag", "newflag", "NEWFLAG"]);
    injector.set_annotations([Annotation {
        entry_name: "/comment".to_string(),
        value: "interesting".to_string(),
        owner: None,
    }]);

    injector.run(&pool).await.unwrap();

    // A concurrent injector created the flag first; ours rolled back to
    // the savepoint and learned the id from the next select.
    let sql = log.lock().join("\n");
    assert!(sql.contains("savepoint c0"), "{sql}");
    assert!(sql.contains("rollback to c0"), "{sql}");
    assert_eq!(vocab.flags.lookup("NewFlag"), Some(7));
    assert_eq!(vocab.flags.lookup("NEWFLAG"), Some(7));
    assert_eq!(vocab.annotations.lookup("/comment"), Some(3));

    // The flag was set once despite three case-variant spellings, and
    // the annotation row was created once.
    let entries = log.lock();
    assert_eq!(
        entries
            .iter()
            .filter(|sql| sql.contains("insert into flags"))
            .count(),
        1
    );
    assert_eq!(
        entries
            .iter()
            .filter(|sql| sql.contains("insert into annotations"))
            .count(),
        1
    );
}

#[tokio::test]
async fn invalid_message_fails_before_any_database_work() {
    let backend = ScriptedBackend::new();
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 1, 1);
    let injector = injector_for(Message::parse(b"garbage without a colon\r\n\r\nbody"), &mailbox);
    let err = injector.run(&pool).await.unwrap_err();

    assert!(matches!(err, InjectError::InvalidMessage(_)));
    assert!(log.lock().is_empty(), "no transaction should have opened");
}

#[tokio::test]
async fn failure_rolls_back_and_publishes_nothing() {
    let backend = simple_script().on(
        "select uidnext",
        vec![Err(DbError::query("deliberate mailbox lock failure"))],
    );
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 4, 9);
    let session = Session::new();
    mailbox.attach_session(session.clone());

    let injector = injector_for(Message::parse(SIMPLE.as_bytes()), &mailbox);
    let err = injector.run(&pool).await.unwrap_err();
    assert!(err.to_string().contains("deliberate"));

    let sql = log.lock().join("\n");
    assert!(sql.contains("rollback"), "{sql}");
    assert!(!sql.contains("commit"));

    // No session notifications, no counter movement.
    assert!(session.unannounced().is_empty());
    assert_eq!(mailbox.uidnext(), 4);
    assert_eq!(mailbox.nextmodseq(), 9);
}

#[tokio::test]
async fn remote_recipients_are_spooled_and_unified() {
    let backend = simple_script().on(
        "select id, name, localpart, domain from addresses",
        vec![Ok(vec![
            row(&[
                ("id", Value::Int(41)),
                ("name", Value::Text("Ann".to_string())),
                ("localpart", Value::Text("ann".to_string())),
                ("domain", Value::Text("example.com".to_string())),
            ]),
            row(&[
                ("id", Value::Int(42)),
                ("name", Value::Text("".to_string())),
                ("localpart", Value::Text("bob".to_string())),
                ("domain", Value::Text("example.net".to_string())),
            ]),
            row(&[
                ("id", Value::Int(43)),
                ("name", Value::Text("".to_string())),
                ("localpart", Value::Text("carol".to_string())),
                ("domain", Value::Text("x.example".to_string())),
            ]),
            row(&[
                ("id", Value::Int(44)),
                ("name", Value::Text("".to_string())),
                ("localpart", Value::Text("sam".to_string())),
                ("domain", Value::Text("z.example".to_string())),
            ]),
        ])],
    );
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(5, "inbox", 1, 1);
    let mut injector = injector_for(Message::parse(SIMPLE.as_bytes()), &mailbox);

    // bob is also a To: recipient; the resolver must unify them so both
    // rows share one address id.
    let bob = Arc::new(Address::parse_envelope("bob@example.net").unwrap());
    let carol = Arc::new(Address::parse_envelope("carol@x.example").unwrap());
    injector.set_remote_recipients(vec![bob, carol]);
    injector.set_sender(Arc::new(Address::parse_envelope("sam@z.example").unwrap()));

    injector.run(&pool).await.unwrap();

    let sql_log = log.lock();
    assert_eq!(
        sql_log
            .iter()
            .filter(|sql| sql.contains("insert into deliveries"))
            .count(),
        1
    );
    assert_eq!(
        sql_log
            .iter()
            .filter(|sql| sql.contains("insert into delivery_recipients"))
            .count(),
        2
    );
}

#[tokio::test]
async fn wrapped_message_records_the_unparsed_blob() {
    let raw = concat!(
        "From: postmaster@depot.example\r\n",
        "Content-Type: multipart/mixed; boundary=wrap\r\n",
        "\r\n",
        "--wrap\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "The attached message could not be parsed.\r\n",
        "--wrap\r\n",
        "Content-Type: application/octet-stream\r\n",
        "\r\n",
        "original unparsable bytes\r\n",
        "--wrap--\r\n",
    );
    let backend = ScriptedBackend::new()
        .on("select currval", vec![Ok(vec![row(&[("id", Value::Int(9))])])])
        .on(
            "select uidnext",
            vec![Ok(vec![row(&[
                ("uidnext", Value::Int(12)),
                ("nextmodseq", Value::BigInt(30)),
                ("first_recent", Value::Int(1)),
            ])])],
        )
        .on(
            "select id from bodyparts",
            vec![
                Ok(vec![row(&[("id", Value::Int(77))])]),
                Ok(vec![row(&[("id", Value::Int(78))])]),
            ],
        )
        .on(
            "select id, name, localpart, domain from addresses",
            vec![Ok(vec![row(&[
                ("id", Value::Int(50)),
                ("name", Value::Text("".to_string())),
                ("localpart", Value::Text("postmaster".to_string())),
                ("domain", Value::Text("depot.example".to_string())),
            ])])],
        );
    let log = backend.log();
    let pool = pool_with(backend);

    let mailbox = Mailbox::new(2, "inbox", 12, 30);
    let mut injector = injector_for(Message::parse(raw.as_bytes()), &mailbox);
    injector.set_wrapped();

    let report = injector.run(&pool).await.unwrap();
    assert_eq!(report.uid(2), Some(12));

    let sql = log.lock().join("\n");
    assert!(sql.contains("insert into unparsed_messages"), "{sql}");
}
