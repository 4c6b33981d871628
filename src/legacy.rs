//! The legacy markup subset.
//!
//! Everything the emitter writes must be drawn from [`ALLOWED_TAGS`] and the
//! per-tag attribute lists below. [`validate`] scans finished output
//! against those lists; it runs over every rendered page in debug builds
//! and in the test suite.

use std::fmt;

/// Elements a 1990s browser renders without surprises.
pub const ALLOWED_TAGS: &[&str] = &[
    "html", "head", "title", "meta", "body", "center", "h1", "h2", "h3", "h4", "p", "ul", "ol",
    "li", "table", "caption", "tr", "th", "td", "b", "i", "a", "img", "br", "hr", "small", "pre",
];

/// Attributes permitted on `tag`. Anything not listed is a violation.
pub fn allowed_attributes(tag: &str) -> &'static [&'static str] {
    match tag {
        "meta" => &["http-equiv", "content"],
        "body" => &["bgcolor", "text", "link", "vlink"],
        "a" => &["href"],
        "img" => &["src", "alt", "width", "height", "border"],
        "table" => &["border", "cellpadding"],
        _ => &[],
    }
}

pub fn is_allowed_tag(tag: &str) -> bool {
    ALLOWED_TAGS.contains(&tag)
}

/// A construct in rendered output that the legacy subset does not permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyViolation {
    Element { tag: String },
    Attribute { tag: String, attribute: String },
    ScriptUrl { tag: String },
    Malformed { offset: usize },
}

impl fmt::Display for LegacyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegacyViolation::Element { tag } => write!(f, "element <{tag}> is not allowed"),
            LegacyViolation::Attribute { tag, attribute } => {
                write!(f, "attribute '{attribute}' is not allowed on <{tag}>")
            }
            LegacyViolation::ScriptUrl { tag } => write!(f, "script URL on <{tag}>"),
            LegacyViolation::Malformed { offset } => write!(f, "malformed tag at byte {offset}"),
        }
    }
}

impl std::error::Error for LegacyViolation {}

/// Check `html` against the legacy subset.
///
/// The emitter escapes every `<` in text, so each `<` in its output opens a
/// tag, a closing tag, the doctype, or a comment. Returns the first
/// violation found.
pub fn validate(html: &str) -> Result<(), LegacyViolation> {
    let mut i = 0;
    while let Some(rel) = html[i..].find('<') {
        let start = i + rel;
        let rest = &html[start..];
        if rest.starts_with("<!--") {
            i = match rest.find("-->") {
                Some(end) => start + end + 3,
                None => return Err(LegacyViolation::Malformed { offset: start }),
            };
            continue;
        }
        let Some(close) = rest.find('>') else {
            return Err(LegacyViolation::Malformed { offset: start });
        };
        let inner = &rest[1..close];
        i = start + close + 1;

        if inner.starts_with('!') {
            // Only the doctype declaration is expected here.
            if !inner[1..].to_ascii_lowercase().starts_with("doctype") {
                return Err(LegacyViolation::Malformed { offset: start });
            }
            continue;
        }
        let (closing, inner) = match inner.strip_prefix('/') {
            Some(s) => (true, s),
            None => (false, inner),
        };
        let name_end = inner
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(inner.len());
        let tag = inner[..name_end].to_ascii_lowercase();
        if tag.is_empty() {
            return Err(LegacyViolation::Malformed { offset: start });
        }
        if !is_allowed_tag(&tag) {
            return Err(LegacyViolation::Element { tag });
        }
        if closing {
            continue;
        }
        for (name, value) in parse_attributes(&inner[name_end..])
            .ok_or(LegacyViolation::Malformed { offset: start })?
        {
            if !allowed_attributes(&tag).contains(&name.as_str()) {
                return Err(LegacyViolation::Attribute {
                    tag,
                    attribute: name,
                });
            }
            if matches!(name.as_str(), "href" | "src")
                && value
                    .trim_start()
                    .to_ascii_lowercase()
                    .starts_with("javascript:")
            {
                return Err(LegacyViolation::ScriptUrl { tag });
            }
        }
    }
    Ok(())
}

/// Split `name="value" name2=value2 name3` into lowercase names and values.
fn parse_attributes(mut s: &str) -> Option<Vec<(String, String)>> {
    let mut attrs = Vec::new();
    loop {
        s = s.trim_start();
        if s.is_empty() || s == "/" {
            return Some(attrs);
        }
        let name_end = s
            .find(|c: char| c.is_whitespace() || c == '=')
            .unwrap_or(s.len());
        let name = s[..name_end].to_ascii_lowercase();
        if name.is_empty() {
            return None;
        }
        s = s[name_end..].trim_start();
        let value = if let Some(after_eq) = s.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            match after_eq.chars().next() {
                Some(q @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    let end = body.find(q)?;
                    s = &body[end + 1..];
                    body[..end].to_string()
                }
                Some(_) => {
                    let end = after_eq.find(char::is_whitespace).unwrap_or(after_eq.len());
                    s = &after_eq[end..];
                    after_eq[..end].to_string()
                }
                None => return None,
            }
        } else {
            String::new()
        };
        attrs.push((name, value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_subset_document() {
        let html = "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">\n\
            <html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=utf-8\">\
            <title>T</title></head><body bgcolor=\"#FFFFFF\" text=\"#000000\">\
            <!-- note --><h2>T</h2><p>a &lt;script&gt; b<br>\
            <a href=\"/wiki/X?theme=dark&amp;images=none\">x</a></p>\
            <table border=\"1\" cellpadding=\"2\"><tr><th>k</th><td>v</td></tr></table>\
            <img src=\"/image/abc\" width=\"10\" height=\"10\" alt=\"a\"></body></html>";
        assert_eq!(validate(html), Ok(()));
    }

    #[test]
    fn rejects_script_and_style() {
        assert_eq!(
            validate("<p>x</p><script>alert(1)</script>"),
            Err(LegacyViolation::Element {
                tag: "script".into()
            })
        );
        assert!(matches!(
            validate("<div>x</div>"),
            Err(LegacyViolation::Element { .. })
        ));
    }

    #[test]
    fn rejects_disallowed_attributes() {
        assert_eq!(
            validate("<p style=\"color:red\">x</p>"),
            Err(LegacyViolation::Attribute {
                tag: "p".into(),
                attribute: "style".into()
            })
        );
        assert!(matches!(
            validate("<a href=\"/x\" onclick=\"go()\">x</a>"),
            Err(LegacyViolation::Attribute { .. })
        ));
    }

    #[test]
    fn rejects_script_urls() {
        assert_eq!(
            validate("<a href=\"JavaScript:alert(1)\">x</a>"),
            Err(LegacyViolation::ScriptUrl { tag: "a".into() })
        );
    }

    #[test]
    fn rejects_unterminated_tag() {
        assert!(matches!(
            validate("<p>ok</p><b"),
            Err(LegacyViolation::Malformed { .. })
        ));
    }
}
