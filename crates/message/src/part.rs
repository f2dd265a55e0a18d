use crate::content::{ContentType, TransferEncoding};
use crate::error::{MailParseError, Result};
use crate::header::Header;
use crate::html::html_to_text;
use crate::message::Message;
use charset::Charset;
use md5::{Digest, Md5};

/// RFC 2045 base64: the stock BASE64_MIME alphabet but ignoring the
/// whitespace that mail transports scatter through encoded bodies.
const BASE64_RFC2045: data_encoding::Encoding = data_encoding_macro::new_encoding! {
    symbols: "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/",
    padding: '=',
    ignore: " \r\n\t",
    wrap_width: 76,
    wrap_separator: "\r\n",
};

/// One node of the MIME tree.
#[derive(Debug, Clone, Default)]
pub struct Bodypart {
    header: Header,
    content_type: Option<ContentType>,
    text: Option<String>,
    data: Vec<u8>,
    encoded_bytes: u32,
    encoded_lines: u32,
    children: Vec<Bodypart>,
    embedded: Option<Box<Message>>,
}

/// What the store keeps for one bodypart: the content-addressing hash,
/// the decoded size, and the text/data column payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Storage {
    pub hash: String,
    pub bytes: u32,
    pub text: Option<String>,
    pub data: Option<Vec<u8>>,
}

impl Bodypart {
    /// A leaf part: transfer-decode the raw body, and charset-decode it
    /// into text when the content type is textual (or absent).
    pub(crate) fn leaf(
        header: Header,
        content_type: Option<ContentType>,
        raw_body: &[u8],
    ) -> Result<Self> {
        let encoding = header.transfer_encoding()?;
        let decoded = decode_transfer(raw_body, encoding)?;

        let is_text = content_type.as_ref().map(|ct| ct.is_text()).unwrap_or(true);
        let (text, data) = if is_text {
            let label = content_type
                .as_ref()
                .and_then(|ct| ct.get("charset"))
                .unwrap_or("us-ascii");
            let charset = Charset::for_label_no_replacement(label.as_bytes())
                .ok_or_else(|| MailParseError::BodyParse(format!("unsupported charset {label}")))?;
            let (cow, _malformed) = charset.decode_without_bom_handling(&decoded);
            (Some(cow.into_owned()), Vec::new())
        } else {
            (None, decoded)
        };

        Ok(Self {
            header,
            content_type,
            text,
            data,
            encoded_bytes: raw_body.len() as u32,
            encoded_lines: count_lines(raw_body),
            children: Vec::new(),
            embedded: None,
        })
    }

    /// A multipart container. `multipart/signed` keeps its raw body so
    /// the signature still verifies.
    pub(crate) fn multipart(
        header: Header,
        content_type: ContentType,
        raw_body: &[u8],
        children: Vec<Bodypart>,
    ) -> Self {
        let signed = content_type.subtype() == "signed";
        Self {
            header,
            content_type: Some(content_type),
            text: None,
            data: if signed { raw_body.to_vec() } else { Vec::new() },
            encoded_bytes: raw_body.len() as u32,
            encoded_lines: count_lines(raw_body),
            children,
            embedded: None,
        }
    }

    /// A `message/rfc822` part wrapping an embedded message.
    pub(crate) fn rfc822(header: Header, content_type: ContentType, raw_body: &[u8]) -> Self {
        let embedded = Message::parse(raw_body);
        Self {
            header,
            content_type: Some(content_type),
            text: None,
            data: Vec::new(),
            encoded_bytes: raw_body.len() as u32,
            encoded_lines: count_lines(raw_body),
            children: Vec::new(),
            embedded: Some(Box::new(embedded)),
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn encoded_bytes(&self) -> u32 {
        self.encoded_bytes
    }

    pub fn encoded_lines(&self) -> u32 {
        self.encoded_lines
    }

    pub fn children(&self) -> &[Bodypart] {
        &self.children
    }

    /// The embedded message for `message/rfc822` parts.
    pub fn embedded(&self) -> Option<&Message> {
        self.embedded.as_deref()
    }

    /// Decide what to store for this part, if anything, and compute the
    /// canonical payload and its hash.
    ///
    /// An absent content type is treated as `text/plain`. `text/html`
    /// stores both a text rendering and the HTML source; other `text/*`
    /// store text only; `multipart/signed` stores its raw data; other
    /// multiparts and `message/rfc822` store nothing; everything else
    /// stores its decoded bytes.
    pub fn storage(&self) -> Option<Storage> {
        let mut store_text = false;
        let mut store_data = false;
        let mut is_html = false;

        match &self.content_type {
            Some(ct) if ct.is_text() => {
                store_text = true;
                if ct.subtype() == "html" {
                    store_data = true;
                    is_html = true;
                }
            }
            Some(ct) if ct.is_multipart() => {
                store_data = ct.subtype() == "signed";
            }
            Some(ct) if ct.is_message_rfc822() => {}
            Some(_) => {
                store_data = true;
            }
            None => {
                store_text = true;
            }
        }

        if !store_text && !store_data {
            return None;
        }

        let payload: Vec<u8> = if store_text {
            self.text.as_deref().unwrap_or("").as_bytes().to_vec()
        } else {
            self.data.clone()
        };
        let hash = data_encoding::HEXLOWER.encode(&Md5::digest(&payload));

        let text = if store_text {
            if is_html {
                Some(html_to_text(self.text.as_deref().unwrap_or("")))
            } else {
                self.text.clone()
            }
        } else {
            None
        };
        let data = if store_data {
            if is_html {
                Some(payload.clone())
            } else {
                Some(self.data.clone())
            }
        } else {
            None
        };

        Some(Storage {
            hash,
            bytes: payload.len() as u32,
            text,
            data,
        })
    }
}

fn decode_transfer(raw: &[u8], encoding: TransferEncoding) -> Result<Vec<u8>> {
    match encoding {
        TransferEncoding::SevenBit | TransferEncoding::EightBit | TransferEncoding::Binary => {
            Ok(raw.to_vec())
        }
        TransferEncoding::QuotedPrintable => {
            quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
                .map_err(|err| MailParseError::BodyParse(format!("quoted printable decode: {err}")))
        }
        TransferEncoding::Base64 => BASE64_RFC2045
            .decode(raw)
            .map_err(|err| MailParseError::BodyParse(format!("base64 decode: {err}"))),
    }
}

fn count_lines(raw: &[u8]) -> u32 {
    if raw.is_empty() {
        return 0;
    }
    let newlines = memchr::memchr_iter(b'\n', raw).count() as u32;
    if raw.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}
