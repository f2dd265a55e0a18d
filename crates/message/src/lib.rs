//! The parsed internet-mail message model consumed by the injector.
//!
//! A [`Message`] is immutable once parsed: a header of positioned fields,
//! a tree of MIME bodyparts with their part numbers, and the canonical
//! RFC 822 byte length. Parse failures do not panic and do not abort
//! construction; they mark the message invalid, and the injector refuses
//! invalid messages before it opens a transaction.

pub mod address;
mod content;
mod error;
mod header;
mod html;
mod message;
mod part;
mod rfc2047;

pub use address::Address;
pub use content::{ContentType, TransferEncoding};
pub use error::{MailParseError, Result};
pub use header::{FieldKind, Header, HeaderField};
pub use html::html_to_text;
pub use message::Message;
pub use part::{Bodypart, Storage};
pub use rfc2047::decode_encoded_words;
