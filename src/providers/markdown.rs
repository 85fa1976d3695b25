//! HTML to markdown conversion for message bodies.
//!
//! Parsing and rendering are left to `html2text`. Before that, 1x1 and 0x0
//! tracking images are cut from the markup so they never reach the text.

/// Column width passed to the renderer.
const RENDER_WIDTH: usize = 120;

/// Converts an HTML body to markdown-flavoured text.
pub fn html_to_markdown(html: &str) -> String {
    let cleaned = strip_tracking_pixels(html);
    match html2text::from_read(cleaned.as_bytes(), RENDER_WIDTH) {
        Ok(text) => tidy(&text),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to render HTML body, keeping markup");
            cleaned
        }
    }
}

/// Removes `<img>` tags whose width or height is 0 or 1.
fn strip_tracking_pixels(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(start) = find_img(rest) {
        let (before, tag_and_after) = rest.split_at(start);
        out.push_str(before);
        let end = tag_end(tag_and_after);
        let tag = &tag_and_after[..end];
        if !is_tracking_pixel(tag) {
            out.push_str(tag);
        }
        rest = &tag_and_after[end..];
    }
    out.push_str(rest);
    out
}

/// Byte offset of the next `<img` tag opener.
fn find_img(html: &str) -> Option<usize> {
    let bytes = html.as_bytes();
    let mut from = 0;
    while let Some(pos) = html[from..].find('<') {
        let at = from + pos;
        let name = bytes.get(at + 1..at + 4);
        let boundary = bytes
            .get(at + 4)
            .map_or(true, |b| b.is_ascii_whitespace() || *b == b'/' || *b == b'>');
        if name.is_some_and(|n| n.eq_ignore_ascii_case(b"img")) && boundary {
            return Some(at);
        }
        from = at + 1;
    }
    None
}

/// Length of the tag at the start of `html`, through its closing `>`.
/// Quoted attribute values may contain `>`.
fn tag_end(html: &str) -> usize {
    let mut quote = None;
    for (i, b) in html.bytes().enumerate() {
        match (quote, b) {
            (None, b'"' | b'\'') => quote = Some(b),
            (Some(q), _) if q == b => quote = None,
            (None, b'>') => return i + 1,
            _ => {}
        }
    }
    html.len()
}

fn is_tracking_pixel(tag: &str) -> bool {
    let tiny = |value: &str| matches!(value.trim().trim_end_matches("px"), "0" | "1");
    attributes(tag)
        .into_iter()
        .any(|(name, value)| (name == "width" || name == "height") && tiny(&value))
}

/// Attribute names (lowercased) and values of one tag.
fn attributes(tag: &str) -> Vec<(String, String)> {
    let body = tag
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim_end_matches('/');
    let mut chars = body.char_indices().peekable();
    let mut attrs = Vec::new();

    // Tag name.
    while chars.next_if(|(_, c)| !c.is_whitespace()).is_some() {}

    loop {
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        let Some(&(name_start, _)) = chars.peek() else {
            break;
        };
        let mut name_end = body.len();
        while let Some(&(i, c)) = chars.peek() {
            if c.is_whitespace() || c == '=' {
                name_end = i;
                break;
            }
            chars.next();
        }
        let name = body[name_start..name_end].to_ascii_lowercase();

        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}
        if chars.next_if(|(_, c)| *c == '=').is_none() {
            attrs.push((name, String::new()));
            continue;
        }
        while chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        match chars.next_if(|(_, c)| *c == '"' || *c == '\'') {
            Some((_, q)) => {
                for (_, c) in chars.by_ref() {
                    if c == q {
                        break;
                    }
                    value.push(c);
                }
            }
            None => {
                while let Some((_, c)) = chars.next_if(|(_, c)| !c.is_whitespace()) {
                    value.push(c);
                }
            }
        }
        attrs.push((name, value));
    }
    attrs
}

/// Trims trailing spaces per line and collapses runs of blank lines.
fn tidy(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        result.push_str(line);
        result.push('\n');
    }
    result.trim().to_string()
}
