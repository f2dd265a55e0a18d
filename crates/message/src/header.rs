use crate::address::{parse_address_list, Address};
use crate::content::{ContentType, TransferEncoding};
use crate::error::{MailParseError, Result};
use crate::rfc2047::decode_encoded_words;
use chrono::{DateTime, FixedOffset};
use std::sync::Arc;

/// Well-known header fields carry stable integer ids, matching the rows
/// the schema seeds into `field_names`. Everything else goes through the
/// field-name vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    From,
    ResentFrom,
    Sender,
    ResentSender,
    ReturnPath,
    ReplyTo,
    To,
    Cc,
    Bcc,
    ResentTo,
    ResentCc,
    ResentBcc,
    Date,
    Subject,
    MessageId,
    InReplyTo,
    References,
    Comments,
    Keywords,
    ContentType,
    ContentTransferEncoding,
    ContentDisposition,
    ContentDescription,
    ContentId,
    MimeVersion,
    Received,
    ContentLanguage,
    ContentLocation,
    ContentMd5,
    Other,
}

impl FieldKind {
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "from" => Self::From,
            "resent-from" => Self::ResentFrom,
            "sender" => Self::Sender,
            "resent-sender" => Self::ResentSender,
            "return-path" => Self::ReturnPath,
            "reply-to" => Self::ReplyTo,
            "to" => Self::To,
            "cc" => Self::Cc,
            "bcc" => Self::Bcc,
            "resent-to" => Self::ResentTo,
            "resent-cc" => Self::ResentCc,
            "resent-bcc" => Self::ResentBcc,
            "date" => Self::Date,
            "subject" => Self::Subject,
            "message-id" => Self::MessageId,
            "in-reply-to" => Self::InReplyTo,
            "references" => Self::References,
            "comments" => Self::Comments,
            "keywords" => Self::Keywords,
            "content-type" => Self::ContentType,
            "content-transfer-encoding" => Self::ContentTransferEncoding,
            "content-disposition" => Self::ContentDisposition,
            "content-description" => Self::ContentDescription,
            "content-id" => Self::ContentId,
            "mime-version" => Self::MimeVersion,
            "received" => Self::Received,
            "content-language" => Self::ContentLanguage,
            "content-location" => Self::ContentLocation,
            "content-md5" => Self::ContentMd5,
            _ => Self::Other,
        }
    }

    /// The seeded `field_names` id for well-known fields.
    pub fn well_known_id(&self) -> Option<u32> {
        let id = match self {
            Self::From => 1,
            Self::ResentFrom => 2,
            Self::Sender => 3,
            Self::ResentSender => 4,
            Self::ReturnPath => 5,
            Self::ReplyTo => 6,
            Self::To => 7,
            Self::Cc => 8,
            Self::Bcc => 9,
            Self::ResentTo => 10,
            Self::ResentCc => 11,
            Self::ResentBcc => 12,
            Self::Date => 13,
            Self::Subject => 14,
            Self::MessageId => 15,
            Self::InReplyTo => 16,
            Self::References => 17,
            Self::Comments => 18,
            Self::Keywords => 19,
            Self::ContentType => 20,
            Self::ContentTransferEncoding => 21,
            Self::ContentDisposition => 22,
            Self::ContentDescription => 23,
            Self::ContentId => 24,
            Self::MimeVersion => 25,
            Self::Received => 26,
            Self::ContentLanguage => 27,
            Self::ContentLocation => 28,
            Self::ContentMd5 => 29,
            Self::Other => return None,
        };
        Some(id)
    }

    /// From, Sender, To, … — the fields whose content lives in
    /// `address_fields` rather than `header_fields`.
    pub fn is_address(&self) -> bool {
        matches!(
            self,
            Self::From
                | Self::ResentFrom
                | Self::Sender
                | Self::ResentSender
                | Self::ReturnPath
                | Self::ReplyTo
                | Self::To
                | Self::Cc
                | Self::Bcc
                | Self::ResentTo
                | Self::ResentCc
                | Self::ResentBcc
        )
    }
}

/// One header field: its name, kind, 1-based position within its header,
/// decoded value, and parsed content for address and date fields.
#[derive(Debug, Clone)]
pub struct HeaderField {
    name: String,
    kind: FieldKind,
    position: u32,
    value: String,
    addresses: Vec<Arc<Address>>,
    date: Option<DateTime<FixedOffset>>,
}

impl HeaderField {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn addresses(&self) -> &[Arc<Address>] {
        &self.addresses
    }

    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.date
    }
}

#[derive(Debug, Clone, Default)]
pub struct Header {
    fields: Vec<HeaderField>,
}

impl Header {
    /// Parse an unfolded header block (everything before the first blank
    /// line). Field positions are assigned in physical order, 1-based.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let mut fields = Vec::new();
        let mut position = 0u32;
        for logical in unfold(&text) {
            if logical.trim().is_empty() {
                continue;
            }
            let (name, value) = logical.split_once(':').ok_or_else(|| {
                MailParseError::HeaderParse(format!("missing ':' in {logical:?}"))
            })?;
            let name = name.trim();
            if name.is_empty() || name.contains(char::is_whitespace) {
                return Err(MailParseError::HeaderParse(format!(
                    "malformed field name in {logical:?}"
                )));
            }
            let kind = FieldKind::parse(name);
            let raw_value = value.trim();
            position += 1;

            let mut addresses = Vec::new();
            let mut date = None;
            let value = if kind.is_address() {
                addresses = parse_address_list(raw_value)?
                    .into_iter()
                    .map(Arc::new)
                    .collect();
                raw_value.to_string()
            } else if kind == FieldKind::Date {
                date = DateTime::parse_from_rfc2822(raw_value).ok();
                raw_value.to_string()
            } else {
                decode_encoded_words(raw_value)
            };

            fields.push(HeaderField {
                name: name.to_string(),
                kind,
                position,
                value,
                addresses,
                date,
            });
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, kind: FieldKind) -> Option<&HeaderField> {
        self.fields.iter().find(|f| f.kind == kind)
    }

    pub fn content_type(&self) -> Result<Option<ContentType>> {
        match self.field(FieldKind::ContentType) {
            Some(f) => ContentType::parse(f.value()).map(Some),
            None => Ok(None),
        }
    }

    pub fn transfer_encoding(&self) -> Result<TransferEncoding> {
        match self.field(FieldKind::ContentTransferEncoding) {
            Some(f) => f.value().parse(),
            None => Ok(TransferEncoding::SevenBit),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.field(FieldKind::MessageId).map(|f| f.value())
    }

    pub fn date(&self) -> Option<DateTime<FixedOffset>> {
        self.field(FieldKind::Date).and_then(|f| f.date())
    }
}

/// Join folded continuation lines. The CRLF before leading whitespace is
/// removed; the whitespace itself is kept.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if (line.starts_with(' ') || line.starts_with('\t')) && !lines.is_empty() {
            lines.last_mut().unwrap().push_str(line);
        } else {
            lines.push(line.to_string());
        }
    }
    lines
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn positions_and_kinds() {
        let header = Header::parse(
            concat!(
                "Received: from a by b; Mon, 2 Feb 2009 15:21:00 +0100\r\n",
                "From: Ann <ann@example.com>\r\n",
                "To: bob@example.net,\r\n",
                "  carol@example.org\r\n",
                "Subject: hello\r\n",
                "X-Loop: zig\r\n",
            )
            .as_bytes(),
        )
        .unwrap();

        let kinds: Vec<FieldKind> = header.fields().iter().map(|f| f.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                FieldKind::Received,
                FieldKind::From,
                FieldKind::To,
                FieldKind::Subject,
                FieldKind::Other,
            ]
        );
        let positions: Vec<u32> = header.fields().iter().map(|f| f.position()).collect();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);

        // Folded To: yields both addresses.
        let to = header.field(FieldKind::To).unwrap();
        assert_eq!(to.addresses().len(), 2);
        assert_eq!(to.addresses()[1].localpart(), "carol");
    }

    #[test]
    fn subject_is_decoded() {
        let header =
            Header::parse(b"Subject: =?ISO-8859-1?Q?Hej_d=E5?=\r\n").unwrap();
        assert_eq!(header.field(FieldKind::Subject).unwrap().value(), "Hej då");
    }

    #[test]
    fn date_parses() {
        let header = Header::parse(b"Date: Tue, 1 Jul 2003 10:52:37 +0200\r\n").unwrap();
        let date = header.date().unwrap();
        assert_eq!(date.timestamp(), 1057049557);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(Header::parse(b"this line has no colon\r\n").is_err());
        assert!(Header::parse(b"Bad Name: value\r\n").is_err());
    }

    #[test]
    fn well_known_ids_are_stable() {
        assert_eq!(FieldKind::From.well_known_id(), Some(1));
        assert_eq!(FieldKind::ResentBcc.well_known_id(), Some(12));
        assert_eq!(FieldKind::Date.well_known_id(), Some(13));
        assert_eq!(FieldKind::Other.well_known_id(), None);
        assert!(FieldKind::ResentBcc.is_address());
        assert!(!FieldKind::Date.is_address());
    }
}
