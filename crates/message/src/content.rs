use crate::error::{MailParseError, Result};
use std::str::FromStr;

/// A parsed Content-Type: type, subtype and parameters, all with the
/// case conventions of RFC 2045 (type/subtype and parameter names are
/// matched case-insensitively and stored lowercased).
#[derive(Debug, Clone, PartialEq)]
pub struct ContentType {
    ctype: String,
    subtype: String,
    params: Vec<(String, String)>,
}

impl ContentType {
    pub fn parse(value: &str) -> Result<Self> {
        let mut segments = split_params(value);
        let head = segments
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MailParseError::HeaderParse("empty Content-Type".to_string()))?;
        let (ctype, subtype) = head.split_once('/').ok_or_else(|| {
            MailParseError::HeaderParse(format!("Content-Type without subtype: {head:?}"))
        })?;
        let mut params = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            if let Some((name, raw)) = segment.split_once('=') {
                params.push((name.trim().to_lowercase(), unquote_param(raw.trim())));
            }
        }
        Ok(Self {
            ctype: ctype.trim().to_lowercase(),
            subtype: subtype.trim().to_lowercase(),
            params,
        })
    }

    pub fn ctype(&self) -> &str {
        &self.ctype
    }

    pub fn subtype(&self) -> &str {
        &self.subtype
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.params
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_text(&self) -> bool {
        self.ctype == "text"
    }

    pub fn is_multipart(&self) -> bool {
        self.ctype == "multipart"
    }

    pub fn is_message_rfc822(&self) -> bool {
        self.ctype == "message" && self.subtype == "rfc822"
    }
}

/// Split a structured header value on `;` outside quoted strings.
fn split_params(value: &str) -> impl Iterator<Item = &str> {
    let mut items = Vec::new();
    let mut in_quote = false;
    let mut start = 0usize;
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if in_quote => {
                chars.next();
            }
            '"' => in_quote = !in_quote,
            ';' if !in_quote => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(&value[start..]);
    items.into_iter()
}

fn unquote_param(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let mut out = String::with_capacity(raw.len());
        let mut chars = raw[1..raw.len() - 1].chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferEncoding {
    #[default]
    SevenBit,
    EightBit,
    Binary,
    QuotedPrintable,
    Base64,
}

impl FromStr for TransferEncoding {
    type Err = MailParseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "7bit" => Ok(Self::SevenBit),
            "8bit" => Ok(Self::EightBit),
            "binary" => Ok(Self::Binary),
            "quoted-printable" => Ok(Self::QuotedPrintable),
            "base64" => Ok(Self::Base64),
            other => Err(MailParseError::HeaderParse(format!(
                "Invalid Content-Transfer-Encoding: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn basic_type() {
        let ct = ContentType::parse("text/plain; charset=utf-8").unwrap();
        assert_eq!(ct.ctype(), "text");
        assert_eq!(ct.subtype(), "plain");
        assert_eq!(ct.get("charset"), Some("utf-8"));
        assert!(ct.is_text());
    }

    #[test]
    fn quoted_boundary_with_semicolon() {
        let ct = ContentType::parse("multipart/mixed; boundary=\"a;b c\"").unwrap();
        assert!(ct.is_multipart());
        assert_eq!(ct.get("boundary"), Some("a;b c"));
    }

    #[test]
    fn case_normalization() {
        let ct = ContentType::parse("Message/RFC822").unwrap();
        assert!(ct.is_message_rfc822());
        let ct = ContentType::parse("TEXT/Html; Charset=ISO-8859-1").unwrap();
        assert_eq!(ct.subtype(), "html");
        assert_eq!(ct.get("CHARSET"), Some("ISO-8859-1"));
    }

    #[test]
    fn transfer_encodings() {
        assert_eq!(
            "Quoted-Printable".parse::<TransferEncoding>().unwrap(),
            TransferEncoding::QuotedPrintable
        );
        assert!("uuencode".parse::<TransferEncoding>().is_err());
    }
}
