//! RFC 2047 encoded-word decoding.
//!
//! Tolerant by design: words longer than the 75-character limit are
//! accepted, `*lang` suffixes on the charset are ignored, and anything
//! that fails to decode is passed through literally.

use charset::Charset;

/// Decode every encoded word in `input`. Whitespace between two adjacent
/// encoded words is dropped, per the RFC; all other text is preserved.
pub fn decode_encoded_words(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_ws = String::new();
    let mut last_was_encoded = false;
    let mut rest = input;

    while !rest.is_empty() {
        if rest.starts_with("=?") {
            if let Some((decoded, consumed)) = decode_one(rest) {
                if !last_was_encoded {
                    out.push_str(&pending_ws);
                }
                pending_ws.clear();
                out.push_str(&decoded);
                rest = &rest[consumed..];
                last_was_encoded = true;
                continue;
            }
        }
        let c = rest.chars().next().unwrap();
        if c.is_whitespace() {
            pending_ws.push(c);
        } else {
            out.push_str(&pending_ws);
            pending_ws.clear();
            out.push(c);
            last_was_encoded = false;
        }
        rest = &rest[c.len_utf8()..];
    }
    out.push_str(&pending_ws);
    out
}

/// Try to decode one `=?charset?enc?text?=` token at the start of `s`.
/// Returns the decoded text and the number of bytes consumed.
fn decode_one(s: &str) -> Option<(String, usize)> {
    let inner = &s[2..];
    let q1 = inner.find('?')?;
    let charset_label = &inner[..q1];
    let after_charset = &inner[q1 + 1..];
    let q2 = after_charset.find('?')?;
    let encoding = &after_charset[..q2];
    let after_encoding = &after_charset[q2 + 1..];
    let end = after_encoding.find("?=")?;
    let text = &after_encoding[..end];
    let consumed = 2 + q1 + 1 + q2 + 1 + end + 2;

    // RFC 2231 language suffix: =?utf-8*en?…
    let charset_label = charset_label
        .split_once('*')
        .map(|(cs, _lang)| cs)
        .unwrap_or(charset_label);

    let bytes = match encoding {
        "B" | "b" => data_encoding::BASE64_MIME.decode(text.as_bytes()).ok()?,
        "Q" | "q" => quoted_printable::decode(
            text.replace('_', " "),
            quoted_printable::ParseMode::Robust,
        )
        .ok()?,
        _ => return None,
    };

    let charset = Charset::for_label_no_replacement(charset_label.as_bytes())?;
    let (decoded, _malformed) = charset.decode_without_bom_handling(&bytes);
    Some((decoded.into_owned(), consumed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_text_is_untouched() {
        assert_eq!(decode_encoded_words("plain subject"), "plain subject");
    }

    #[test]
    fn q_encoding() {
        assert_eq!(
            decode_encoded_words("=?US-ASCII?Q?Keith_Moore?="),
            "Keith Moore"
        );
        assert_eq!(
            decode_encoded_words("=?ISO-8859-1?Q?Keld_J=F8rn_Simonsen?="),
            "Keld Jørn Simonsen"
        );
    }

    #[test]
    fn b_encoding_and_adjacent_word_whitespace() {
        // Whitespace between two encoded words vanishes; the words
        // themselves carry the spacing.
        assert_eq!(
            decode_encoded_words(
                "=?ISO-8859-1?B?SWYgeW91IGNhbiByZWFkIHRoaXMgeW8=?= =?ISO-8859-2?B?dSB1bmRlcnN0YW5kIHRoZSBleGFtcGxlLg==?="
            ),
            "If you can read this you understand the example."
        );
    }

    #[test]
    fn whitespace_before_plain_text_is_kept() {
        assert_eq!(
            decode_encoded_words("=?ISO-8859-1?Q?Andr=E9?= Pirard"),
            "André Pirard"
        );
    }

    #[test]
    fn language_suffix_is_ignored() {
        assert_eq!(
            decode_encoded_words("=?US-ASCII*EN?Q?Keith_Moore?="),
            "Keith Moore"
        );
    }

    #[test]
    fn malformed_words_pass_through() {
        assert_eq!(decode_encoded_words("=?bogus"), "=?bogus");
        assert_eq!(
            decode_encoded_words("=?nosuchcharset?Q?xx?="),
            "=?nosuchcharset?Q?xx?="
        );
    }
}
