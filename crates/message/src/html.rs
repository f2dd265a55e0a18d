//! A plain-text rendering of HTML bodies, good enough for search and for
//! the text column of deduplicated `text/html` bodyparts. This is not a
//! browser: tags vanish, block boundaries become newlines, entities are
//! decoded, script and style content is dropped.

pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut skip_until: Option<&'static str> = None;

    while let Some(lt) = rest.find('<') {
        let (before, after) = rest.split_at(lt);
        if skip_until.is_none() {
            push_entities(&mut out, before);
        }
        let Some(gt) = after.find('>') else {
            rest = "";
            break;
        };
        let tag_body = &after[1..gt];
        let tag_name = tag_body
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/' || c == '>')
            .next()
            .unwrap_or("")
            .to_lowercase();
        let closing = tag_body.starts_with('/');

        match &skip_until {
            Some(until) => {
                if closing && tag_name == *until {
                    skip_until = None;
                }
            }
            None => match tag_name.as_str() {
                "script" | "style" if !closing => {
                    skip_until = Some(if tag_name == "script" { "script" } else { "style" });
                }
                "br" | "p" | "div" | "tr" | "li" | "table" | "h1" | "h2" | "h3" | "h4" | "h5"
                | "h6" => {
                    if !out.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
        }
        rest = &after[gt + 1..];
    }
    if skip_until.is_none() {
        push_entities(&mut out, rest);
    }
    collapse_blank_runs(&out)
}

fn push_entities(out: &mut String, text: &str) {
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        match after.find(';') {
            Some(semi) if semi <= 10 => {
                let entity = &after[1..semi];
                match decode_entity(entity) {
                    Some(c) => out.push(c),
                    None => out.push_str(&after[..=semi]),
                }
                rest = &after[semi + 1..];
            }
            _ => {
                out.push('&');
                rest = &after[1..];
            }
        }
    }
    out.push_str(rest);
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_pending = false;
    for line in text.lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if blank_pending {
            out.push('\n');
            blank_pending = false;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_tags_and_decodes_entities() {
        assert_eq!(
            html_to_text("<p>Fish &amp; chips &#233;</p>"),
            "Fish & chips é"
        );
    }

    #[test]
    fn block_tags_break_lines() {
        assert_eq!(
            html_to_text("<div>one</div><div>two<br>three</div>"),
            "one\ntwo\nthree"
        );
    }

    #[test]
    fn script_and_style_content_is_dropped() {
        assert_eq!(
            html_to_text("<style>p { color: red }</style><p>text</p><script>alert(1)</script>"),
            "text"
        );
    }

    #[test]
    fn inline_tags_keep_spacing() {
        assert_eq!(html_to_text("Hi <b>there</b>"), "Hi there");
    }
}
