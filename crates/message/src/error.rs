use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MailParseError {
    #[error("invalid header: {0}")]
    HeaderParse(String),

    #[error("parsing body: {0}")]
    BodyParse(String),

    #[error("invalid address: {0}")]
    AddressParse(String),
}

pub type Result<T> = std::result::Result<T, MailParseError>;
