use crate::content::ContentType;
use crate::error::{MailParseError, Result};
use crate::header::{FieldKind, Header};
use crate::part::Bodypart;
use chrono::{DateTime, Utc};

/// An immutable parsed internet-mail message.
///
/// Parsing never panics and never refuses to construct: a message that
/// fails to parse carries its error and reports `valid() == false`.
///
/// The single bodypart of a non-multipart message shares the message's
/// header, so its MIME fields are physically collocated with the RFC 822
/// header; consumers that record header fields per part skip that first
/// part to avoid recording them twice.
#[derive(Debug, Clone, Default)]
pub struct Message {
    header: Header,
    parts: Vec<Bodypart>,
    rfc822_size: u32,
    internal_date: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl Message {
    pub fn parse(bytes: &[u8]) -> Message {
        let size = bytes.len() as u32;
        match Self::parse_inner(bytes) {
            Ok(mut message) => {
                message.rfc822_size = size;
                message
            }
            Err(err) => Message {
                header: Header::default(),
                parts: Vec::new(),
                rfc822_size: size,
                internal_date: None,
                error: Some(err.to_string()),
            },
        }
    }

    fn parse_inner(bytes: &[u8]) -> Result<Message> {
        let (header_raw, body) = split_header_body(bytes);
        let header = Header::parse(header_raw)?;
        let parts = build_parts(&header, body)?;
        Ok(Message {
            header,
            parts,
            rfc822_size: 0,
            internal_date: None,
            error: None,
        })
    }

    pub fn valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The canonical RFC 822 length of the message as received.
    pub fn rfc822_size(&self) -> u32 {
        self.rfc822_size
    }

    pub fn set_internal_date(&mut self, date: DateTime<Utc>) {
        self.internal_date = Some(date);
    }

    pub fn internal_date(&self) -> Option<DateTime<Utc>> {
        self.internal_date
    }

    /// A sensible internaldate: the explicit one if set; otherwise the
    /// date stamped by the most recent Received hop; otherwise the Date
    /// field; otherwise now.
    pub fn effective_internal_date(&self) -> DateTime<Utc> {
        if let Some(date) = self.internal_date {
            return date;
        }
        for field in self.header.fields() {
            if field.kind() == FieldKind::Received {
                if let Some(semi) = field.value().rfind(';') {
                    let tail = field.value()[semi + 1..].trim();
                    if let Ok(date) = DateTime::parse_from_rfc2822(tail) {
                        return date.with_timezone(&Utc);
                    }
                }
            }
        }
        if let Some(date) = self.header.date() {
            return date.with_timezone(&Utc);
        }
        Utc::now()
    }

    /// True when the message's own content type is multipart.
    pub fn is_multipart(&self) -> bool {
        self.header
            .content_type()
            .ok()
            .flatten()
            .map(|ct| ct.is_multipart())
            .unwrap_or(false)
    }

    pub fn parts(&self) -> &[Bodypart] {
        &self.parts
    }

    /// Every bodypart in tree order with its IMAP part number: "1",
    /// "1.1", "2", … The parts of an embedded `message/rfc822` continue
    /// the numbering below their wrapper.
    pub fn all_parts(&self) -> Vec<(String, &Bodypart)> {
        let mut out = Vec::new();
        collect_parts(&self.parts, "", &mut out);
        out
    }

    pub fn part(&self, number: &str) -> Option<&Bodypart> {
        self.all_parts()
            .into_iter()
            .find(|(pn, _)| pn == number)
            .map(|(_, part)| part)
    }
}

fn collect_parts<'a>(parts: &'a [Bodypart], prefix: &str, out: &mut Vec<(String, &'a Bodypart)>) {
    for (i, part) in parts.iter().enumerate() {
        let number = if prefix.is_empty() {
            format!("{}", i + 1)
        } else {
            format!("{prefix}.{}", i + 1)
        };
        out.push((number.clone(), part));
        if let Some(embedded) = part.embedded() {
            collect_parts(embedded.parts(), &number, out);
        }
        collect_parts(part.children(), &number, out);
    }
}

/// Find the blank line separating header from body, tolerating both CRLF
/// and bare LF conventions.
fn split_header_body(bytes: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = memchr::memmem::find(bytes, b"\r\n\r\n") {
        (&bytes[..pos + 2], &bytes[pos + 4..])
    } else if let Some(pos) = memchr::memmem::find(bytes, b"\n\n") {
        (&bytes[..pos + 1], &bytes[pos + 2..])
    } else {
        (bytes, &[][..])
    }
}

fn build_parts(header: &Header, body: &[u8]) -> Result<Vec<Bodypart>> {
    let content_type = header.content_type()?;
    match &content_type {
        // A multipart message's children are its top-level parts; the
        // message itself is the container.
        Some(ct) if ct.is_multipart() => split_multipart(ct, body),
        Some(ct) if ct.is_message_rfc822() => {
            Ok(vec![Bodypart::rfc822(header.clone(), ct.clone(), body)])
        }
        _ => Ok(vec![Bodypart::leaf(header.clone(), content_type, body)?]),
    }
}

fn parse_part(raw: &[u8]) -> Result<Bodypart> {
    let (header_raw, body) = split_header_body(raw);
    let header = Header::parse(header_raw)?;
    let content_type = header.content_type()?;
    match &content_type {
        Some(ct) if ct.is_multipart() => {
            let children = split_multipart(ct, body)?;
            Ok(Bodypart::multipart(header, ct.clone(), body, children))
        }
        Some(ct) if ct.is_message_rfc822() => Ok(Bodypart::rfc822(header, ct.clone(), body)),
        _ => Bodypart::leaf(header, content_type, body),
    }
}

/// Split a multipart body on its boundary into child parts. The preamble
/// and epilogue are discarded. A missing terminal delimiter is tolerated.
fn split_multipart(ct: &ContentType, body: &[u8]) -> Result<Vec<Bodypart>> {
    let boundary = ct.get("boundary").ok_or_else(|| {
        MailParseError::BodyParse("multipart without boundary parameter".to_string())
    })?;
    let delimiter = format!("--{boundary}");
    let terminal = format!("{delimiter}--");

    let mut chunks: Vec<&[u8]> = Vec::new();
    let mut cursor: Option<usize> = None;

    for line_start in line_starts(body) {
        let line_end = memchr::memchr(b'\n', &body[line_start..])
            .map(|p| line_start + p + 1)
            .unwrap_or(body.len());
        let line = trim_line_end(&body[line_start..line_end]);
        if line == delimiter.as_bytes() || line == terminal.as_bytes() {
            if let Some(start) = cursor.take() {
                chunks.push(&body[start..line_start]);
            }
            if line == terminal.as_bytes() {
                break;
            }
            cursor = Some(line_end);
        }
    }
    if let Some(start) = cursor {
        chunks.push(&body[start..]);
    }

    chunks.into_iter().map(parse_part).collect()
}

fn line_starts(body: &[u8]) -> Vec<usize> {
    let mut starts = vec![0usize];
    for pos in memchr::memchr_iter(b'\n', body) {
        if pos + 1 < body.len() {
            starts.push(pos + 1);
        }
    }
    starts
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut line = line;
    while let Some((last, rest)) = line.split_last() {
        if matches!(*last, b'\n' | b'\r' | b' ' | b'\t') {
            line = rest;
        } else {
            break;
        }
    }
    line
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::header::FieldKind;

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

    #[test]
    fn simple_message() {
        let m = Message::parse(SIMPLE.as_bytes());
        assert!(m.valid(), "{:?}", m.error());
        assert_eq!(m.rfc822_size() as usize, SIMPLE.len());
        assert!(!m.is_multipart());

        let parts = m.all_parts();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0, "1");
        assert_eq!(parts[0].1.text(), Some("Hello\r\n"));

        // The single part shares the message header.
        assert!(parts[0].1.header().field(FieldKind::Subject).is_some());
    }

    #[test]
    fn invalid_message_reports_error() {
        let m = Message::parse(b"no colon here\r\n\r\nbody\r\n");
        assert!(!m.valid());
        assert!(m.error().unwrap().contains("invalid header"));
    }

    #[test]
    fn multipart_numbering() {
        let raw = concat!(
            "From: a@b.c\r\n",
            "Content-Type: multipart/mixed; boundary=xyz\r\n",
            "\r\n",
            "preamble\r\n",
            "--xyz\r\n",
            "Content-Type: text/plain; charset=us-ascii\r\n",
            "\r\n",
            "part one\r\n",
            "--xyz\r\n",
            "Content-Type: multipart/alternative; boundary=inner\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html</p>\r\n",
            "--inner--\r\n",
            "--xyz--\r\n",
            "epilogue\r\n",
        );
        let m = Message::parse(raw.as_bytes());
        assert!(m.valid(), "{:?}", m.error());
        assert!(m.is_multipart());

        let numbers: Vec<String> = m.all_parts().into_iter().map(|(pn, _)| pn).collect();
        assert_eq!(numbers, vec!["1", "2", "2.1", "2.2"]);

        let html = m.part("2.2").unwrap();
        assert_eq!(html.content_type().unwrap().subtype(), "html");
        // The nested container stores nothing.
        assert!(m.part("2").unwrap().storage().is_none());
    }

    #[test]
    fn embedded_rfc822() {
        let raw = concat!(
            "From: outer@example.com\r\n",
            "Content-Type: multipart/mixed; boundary=bb\r\n",
            "\r\n",
            "--bb\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see attached\r\n",
            "--bb\r\n",
            "Content-Type: message/rfc822\r\n",
            "\r\n",
            "From: inner@example.org\r\n",
            "Subject: the original\r\n",
            "\r\n",
            "inner body\r\n",
            "--bb--\r\n",
        );
        let m = Message::parse(raw.as_bytes());
        assert!(m.valid(), "{:?}", m.error());

        let numbers: Vec<String> = m.all_parts().into_iter().map(|(pn, _)| pn).collect();
        assert_eq!(numbers, vec!["1", "2", "2.1"]);

        let wrapper = m.part("2").unwrap();
        let inner = wrapper.embedded().unwrap();
        assert_eq!(inner.header().message_id(), None);
        assert_eq!(
            inner.header().field(FieldKind::Subject).unwrap().value(),
            "the original"
        );
        // The wrapper itself stores nothing; its child does.
        assert!(wrapper.storage().is_none());
        assert!(m.part("2.1").unwrap().storage().is_some());
    }

    #[test]
    fn internal_date_prefers_received() {
        let m = Message::parse(SIMPLE.as_bytes());
        assert_eq!(m.effective_internal_date().timestamp(), 1057049557);
    }

    #[test]
    fn internal_date_falls_back_to_date() {
        let raw = concat!(
            "From: a@b.c\r\n",
            "Date: Tue, 1 Jul 2003 10:52:00 +0200\r\n",
            "\r\n",
            "body\r\n",
        );
        let m = Message::parse(raw.as_bytes());
        assert_eq!(m.effective_internal_date().timestamp(), 1057049520);
    }

    #[test]
    fn explicit_internal_date_wins() {
        let mut m = Message::parse(SIMPLE.as_bytes());
        let explicit = chrono::DateTime::from_timestamp(1_000_000, 0).unwrap();
        m.set_internal_date(explicit);
        assert_eq!(m.effective_internal_date(), explicit);
    }
}
