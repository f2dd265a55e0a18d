use crate::error::{MailParseError, Result};
use crate::rfc2047::decode_encoded_words;
use std::fmt;
use std::sync::OnceLock;

/// One mail address: display name, localpart and domain. The domain
/// compares case-insensitively; localpart and display name compare
/// bytewise.
///
/// An address learns its database id at most once, when the address
/// resolver sees (or creates) its row.
#[derive(Debug, Default)]
pub struct Address {
    name: String,
    localpart: String,
    domain: String,
    id: OnceLock<u32>,
}

impl Address {
    pub fn new(
        name: impl Into<String>,
        localpart: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            localpart: localpart.into(),
            domain: domain.into(),
            id: OnceLock::new(),
        }
    }

    /// Parse a bare `localpart@domain` envelope address, as handed over
    /// by the SMTP layer for senders and remote recipients.
    pub fn parse_envelope(text: &str) -> Result<Self> {
        let at = text
            .rfind('@')
            .ok_or_else(|| MailParseError::AddressParse(format!("expected user@domain: {text}")))?;
        let (localpart, domain) = (&text[..at], &text[at + 1..]);
        if localpart.is_empty() || domain.is_empty() {
            return Err(MailParseError::AddressParse(format!(
                "expected user@domain: {text}"
            )));
        }
        Ok(Self::new("", localpart, domain))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn localpart(&self) -> &str {
        &self.localpart
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The canonical uniqueness key: `name NUL localpart NUL lower(domain)`.
    pub fn key(&self) -> String {
        format!(
            "{}\0{}\0{}",
            self.name,
            self.localpart,
            self.domain.to_lowercase()
        )
    }

    /// The bare `localpart@domain` key used to unify header addresses
    /// with envelope sender and recipients.
    pub fn naked_key(&self) -> String {
        format!("{}@{}", self.localpart, self.domain.to_lowercase())
    }

    pub fn id(&self) -> Option<u32> {
        self.id.get().copied()
    }

    /// Attach the database id. Setting the same id twice is a no-op;
    /// entries are never re-pointed.
    pub fn set_id(&self, id: u32) {
        let _ = self.id.set(id);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}@{}", self.localpart, self.domain)
        } else {
            write!(f, "{} <{}@{}>", self.name, self.localpart, self.domain)
        }
    }
}

/// Parse an address-list header value (From, To, Cc, …) into its
/// mailboxes. Groups are flattened; comments are dropped; display names
/// have their encoded words decoded.
pub fn parse_address_list(value: &str) -> Result<Vec<Address>> {
    let mut out = Vec::new();
    for item in split_top_level(value)? {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if let Some((_display, inner)) = split_group(item) {
            for sub in split_top_level(inner)? {
                let sub = sub.trim();
                if !sub.is_empty() {
                    out.extend(parse_mailbox(sub)?);
                }
            }
        } else {
            // A group's members split across top-level commas; the last
            // one drags the terminating ';' along.
            let item = item.trim_end_matches(';').trim_end();
            if !item.is_empty() {
                out.extend(parse_mailbox(item)?);
            }
        }
    }
    Ok(out)
}

/// Split on commas that sit outside quotes, comments and angle brackets.
fn split_top_level(value: &str) -> Result<Vec<&str>> {
    let mut items = Vec::new();
    let mut depth_comment = 0usize;
    let mut in_quote = false;
    let mut in_angle = false;
    let mut start = 0usize;
    let mut chars = value.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if in_quote => {
                chars.next();
            }
            '"' if depth_comment == 0 => in_quote = !in_quote,
            '(' if !in_quote => depth_comment += 1,
            ')' if !in_quote && depth_comment > 0 => depth_comment -= 1,
            '<' if !in_quote && depth_comment == 0 => in_angle = true,
            '>' if !in_quote && depth_comment == 0 => in_angle = false,
            ',' if !in_quote && depth_comment == 0 && !in_angle => {
                items.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if in_quote || depth_comment > 0 {
        return Err(MailParseError::AddressParse(format!(
            "unterminated quote or comment in {value:?}"
        )));
    }
    items.push(&value[start..]);
    Ok(items)
}

/// Recognize `display-name : mailbox-list ;` group syntax at the top
/// level and return the inner list.
fn split_group(item: &str) -> Option<(&str, &str)> {
    let mut in_quote = false;
    let mut depth = 0usize;
    let mut chars = item.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if in_quote => {
                chars.next();
            }
            '"' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote && depth > 0 => depth -= 1,
            '<' if !in_quote && depth == 0 => return None,
            ':' if !in_quote && depth == 0 => {
                let rest = &item[i + 1..];
                let rest = rest.strip_suffix(';').unwrap_or(rest);
                return Some((&item[..i], rest));
            }
            _ => {}
        }
    }
    None
}

fn parse_mailbox(item: &str) -> Result<Option<Address>> {
    if let Some(open) = find_unquoted(item, '<') {
        let close = item[open..]
            .find('>')
            .map(|p| p + open)
            .ok_or_else(|| MailParseError::AddressParse(format!("missing '>' in {item:?}")))?;
        let display = clean_display(&item[..open]);
        let spec = &item[open + 1..close];
        // Source routes (`<@relay,@relay:user@host>`) contribute nothing
        // to identity; keep only the final addr-spec.
        let spec = match spec.rfind(':') {
            Some(colon) if spec.starts_with('@') => &spec[colon + 1..],
            _ => spec,
        };
        if spec.trim().is_empty() {
            // The null path, Return-Path: <>
            return Ok(None);
        }
        let (localpart, domain) = split_spec(spec.trim())?;
        Ok(Some(Address::new(display, localpart, domain)))
    } else {
        let stripped = strip_comments(item);
        let (localpart, domain) = split_spec(stripped.trim())?;
        Ok(Some(Address::new("", localpart, domain)))
    }
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quote = false;
    let mut chars = s.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' if in_quote => {
                chars.next();
            }
            '"' => in_quote = !in_quote,
            c if c == needle && !in_quote => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_spec(spec: &str) -> Result<(String, String)> {
    let at = find_unquoted(spec, '@')
        .ok_or_else(|| MailParseError::AddressParse(format!("no '@' in {spec:?}")))?;
    let localpart = unquote(spec[..at].trim());
    let domain = spec[at + 1..].trim().to_string();
    if localpart.is_empty() || domain.is_empty() {
        return Err(MailParseError::AddressParse(format!(
            "empty localpart or domain in {spec:?}"
        )));
    }
    Ok((localpart, domain))
}

fn unquote(s: &str) -> String {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        let mut out = String::with_capacity(s.len());
        let mut chars = s[1..s.len() - 1].chars();
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
        s.to_string()
    }
}

fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quote => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '"' if depth == 0 => {
                in_quote = !in_quote;
                out.push(c);
            }
            '(' if !in_quote => depth += 1,
            ')' if !in_quote && depth > 0 => depth -= 1,
            c if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Display-name cleanup: drop comments, unquote, decode encoded words,
/// collapse whitespace.
fn clean_display(s: &str) -> String {
    let stripped = strip_comments(s);
    let trimmed = stripped.trim();
    let mut words = Vec::new();
    let mut rest = trimmed;
    // A display name may mix quoted strings and plain words.
    while !rest.is_empty() {
        rest = rest.trim_start();
        if rest.starts_with('"') {
            if let Some(close) = find_closing_quote(rest) {
                words.push(unquote(&rest[..=close]));
                rest = &rest[close + 1..];
                continue;
            }
        }
        match rest.find(char::is_whitespace) {
            Some(pos) => {
                words.push(rest[..pos].to_string());
                rest = &rest[pos..];
            }
            None => {
                words.push(rest.to_string());
                break;
            }
        }
    }
    decode_encoded_words(&words.join(" "))
}

fn find_closing_quote(s: &str) -> Option<usize> {
    let mut chars = s.char_indices().skip(1).peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_parse() {
        let a = Address::parse_envelope("nn@example.com").unwrap();
        assert_eq!(a.localpart(), "nn");
        assert_eq!(a.domain(), "example.com");
        assert!(Address::parse_envelope("nodomain").is_err());
        assert!(Address::parse_envelope("@example.com").is_err());
    }

    #[test]
    fn canonical_key_lowers_domain_only() {
        let a = Address::new("Ann", "Ann", "Example.COM");
        assert_eq!(a.key(), "Ann\0Ann\0example.com");
        assert_eq!(a.naked_key(), "Ann@example.com");
    }

    #[test]
    fn id_sets_once() {
        let a = Address::new("", "x", "y.z");
        assert_eq!(a.id(), None);
        a.set_id(4);
        a.set_id(9);
        assert_eq!(a.id(), Some(4));
    }

    #[test]
    fn plain_and_named_mailboxes() {
        let list =
            parse_address_list("Someone (hello) <someone@example.com>, other@example.com").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name(), "Someone");
        assert_eq!(list[0].localpart(), "someone");
        assert_eq!(list[0].domain(), "example.com");
        assert_eq!(list[1].name(), "");
        assert_eq!(list[1].localpart(), "other");
    }

    #[test]
    fn quoted_display_and_quoted_localpart() {
        let list = parse_address_list(
            "\"John \\\"Smith\\\"\" <\"john smith\"@example.com>, x@y.example",
        )
        .unwrap();
        assert_eq!(list[0].name(), "John \"Smith\"");
        assert_eq!(list[0].localpart(), "john smith");
    }

    #[test]
    fn groups_flatten() {
        let list = parse_address_list("crew: a@x.example, b@y.example;, c@z.example").unwrap();
        let locals: Vec<&str> = list.iter().map(|a| a.localpart()).collect();
        assert_eq!(locals, vec!["a", "b", "c"]);
    }

    #[test]
    fn source_route_is_discarded() {
        let list = parse_address_list("<@relay1.example,@relay2.example:user@final.example>")
            .unwrap();
        assert_eq!(list[0].localpart(), "user");
        assert_eq!(list[0].domain(), "final.example");
    }

    #[test]
    fn encoded_word_display_name() {
        let list = parse_address_list("=?ISO-8859-1?Q?Andr=E9?= Pirard <pirard@example.be>").unwrap();
        assert_eq!(list[0].name(), "André Pirard");
    }

    #[test]
    fn domain_literal() {
        let list = parse_address_list("someone@[127.0.0.1]").unwrap();
        assert_eq!(list[0].domain(), "[127.0.0.1]");
    }
}

#[cfg(test)]
mod null_path_test {
    use super::parse_address_list;

    #[test]
    fn null_return_path_yields_no_address() {
        assert!(parse_address_list("<>").unwrap().is_empty());
    }
}
