//! The simplified document tree.
//!
//! Every article is reduced to this small, closed set of node variants
//! before any output is produced. The emitter in [`crate::pipeline::emit`]
//! matches on these enums exhaustively, so a node kind that the legacy
//! output cannot express simply does not exist past the simplifier.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Article markup as retrieved from the upstream source.
#[derive(Debug, Clone)]
pub struct RawArticle {
    pub title: String,
    pub raw_markup: String,
    pub fetched_at: SystemTime,
}

/// An article reduced to legacy-renderable blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifiedDocument {
    /// Display title (from the article's first heading when present).
    pub title: String,
    pub blocks: Vec<Block>,
}

impl SimplifiedDocument {
    /// All image references in document order.
    pub fn image_refs(&self) -> Vec<&ImageRef> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::Image(r) => Some(r),
                _ => None,
            })
            .collect()
    }
}

/// Block-level node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Block {
    /// Section heading, level 2–4.
    Heading { level: u8, content: Vec<Inline> },
    Paragraph { content: Vec<Inline> },
    List(List),
    Table(Table),
    Image(ImageRef),
    Preformatted { text: String },
    Rule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub ordered: bool,
    pub items: Vec<ListItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub content: Vec<Inline>,
    pub sublists: Vec<List>,
}

impl ListItem {
    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.sublists.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub caption: Vec<Inline>,
    pub rows: Vec<Vec<TableCell>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCell {
    pub header: bool,
    pub content: Vec<Inline>,
}

/// Inline node. Links only ever carry proxy-relative targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Inline {
    Text { text: String },
    Bold { content: Vec<Inline> },
    Italic { content: Vec<Inline> },
    Link { href: String, content: Vec<Inline> },
    LineBreak,
}

impl Inline {
    pub fn text(s: impl Into<String>) -> Self {
        Inline::Text { text: s.into() }
    }

    /// Concatenated text content.
    pub fn plain_text(nodes: &[Inline]) -> String {
        let mut out = String::new();
        for n in nodes {
            match n {
                Inline::Text { text } => out.push_str(text),
                Inline::Bold { content }
                | Inline::Italic { content }
                | Inline::Link { content, .. } => out.push_str(&Inline::plain_text(content)),
                Inline::LineBreak => out.push(' '),
            }
        }
        out
    }
}

/// Reference to an upstream image at a position in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Absolute upstream URL.
    pub original_url: String,
    pub alt_text: String,
    pub caption: String,
    /// 0-based index among all images of the article, in document order.
    pub position: usize,
}

// ── Inline normalisation ─────────────────────────────────────────────────

static RE_MARKERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(?:\d+|edit|citation needed|note \d+)\]").unwrap());

/// Clean one text run: drop citation/edit markers.
pub fn strip_markers(text: &str) -> String {
    RE_MARKERS.replace_all(text, "").into_owned()
}

/// Normalise an inline sequence in place:
///
/// 1. strip citation markers from text runs
/// 2. collapse whitespace runs to one space, across node boundaries
/// 3. trim the start and end of the sequence
/// 4. merge adjacent text runs and drop empty nodes
pub fn normalize_inlines(mut nodes: Vec<Inline>) -> Vec<Inline> {
    let mut prev_space = true;
    collapse_whitespace(&mut nodes, &mut prev_space);
    trim_end(&mut nodes);
    prune(nodes)
}

fn collapse_whitespace(nodes: &mut [Inline], prev_space: &mut bool) {
    for node in nodes.iter_mut() {
        match node {
            Inline::Text { text } => {
                let cleaned = strip_markers(text);
                let mut out = String::with_capacity(cleaned.len());
                for ch in cleaned.chars() {
                    if ch.is_whitespace() {
                        if !*prev_space {
                            out.push(' ');
                            *prev_space = true;
                        }
                    } else {
                        out.push(ch);
                        *prev_space = false;
                    }
                }
                *text = out;
            }
            Inline::Bold { content }
            | Inline::Italic { content }
            | Inline::Link { content, .. } => collapse_whitespace(content, prev_space),
            Inline::LineBreak => *prev_space = true,
        }
    }
}

/// Trim trailing spaces of the last text run. Returns true once non-space
/// content has been reached.
fn trim_end(nodes: &mut [Inline]) -> bool {
    for node in nodes.iter_mut().rev() {
        match node {
            Inline::Text { text } => {
                let trimmed = text.trim_end_matches(' ').len();
                text.truncate(trimmed);
                if !text.is_empty() {
                    return true;
                }
            }
            Inline::Bold { content }
            | Inline::Italic { content }
            | Inline::Link { content, .. } => {
                if trim_end(content) {
                    return true;
                }
            }
            Inline::LineBreak => {}
        }
    }
    false
}

fn prune(nodes: Vec<Inline>) -> Vec<Inline> {
    let mut out: Vec<Inline> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node = match node {
            Inline::Text { text } if text.is_empty() => continue,
            Inline::Bold { content } => Inline::Bold {
                content: prune(content),
            },
            Inline::Italic { content } => Inline::Italic {
                content: prune(content),
            },
            Inline::Link { href, content } => Inline::Link {
                href,
                content: prune(content),
            },
            other => other,
        };
        // A container holding only spaces gives its space to the surrounding text.
        let node = match node {
            Inline::Bold { content } | Inline::Italic { content } | Inline::Link { content, .. }
                if !has_visible(&content) =>
            {
                if content.is_empty() {
                    continue;
                }
                Inline::text(" ")
            }
            other => other,
        };
        if let (Some(Inline::Text { text: prev }), Inline::Text { text }) = (out.last_mut(), &node) {
            prev.push_str(text);
            continue;
        }
        out.push(node);
    }
    // Leading or trailing line breaks carry nothing.
    while matches!(out.first(), Some(Inline::LineBreak)) {
        out.remove(0);
    }
    while matches!(out.last(), Some(Inline::LineBreak)) {
        out.pop();
    }
    out
}

/// True when `nodes` holds a line break or a non-space character.
fn has_visible(nodes: &[Inline]) -> bool {
    nodes.iter().any(|n| match n {
        Inline::Text { text } => text.chars().any(|c| !c.is_whitespace()),
        Inline::Bold { content } | Inline::Italic { content } | Inline::Link { content, .. } => {
            has_visible(content)
        }
        Inline::LineBreak => true,
    })
}

/// Normalise every inline sequence of a list, dropping empty items.
pub fn normalize_list(list: List) -> List {
    List {
        ordered: list.ordered,
        items: list
            .items
            .into_iter()
            .map(|item| ListItem {
                content: normalize_inlines(item.content),
                sublists: item
                    .sublists
                    .into_iter()
                    .map(normalize_list)
                    .filter(|l| !l.items.is_empty())
                    .collect(),
            })
            .filter(|item| !item.is_empty())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Inline {
        Inline::text(s)
    }

    #[test]
    fn collapses_whitespace_across_nodes() {
        let nodes = vec![
            t("  Hello \n"),
            Inline::Bold {
                content: vec![t("  big  ")],
            },
            t("  world  "),
        ];
        let out = normalize_inlines(nodes);
        assert_eq!(Inline::plain_text(&out), "Hello big world");
        assert_eq!(
            out,
            vec![
                t("Hello "),
                Inline::Bold {
                    content: vec![t("big ")]
                },
                t("world"),
            ]
        );
    }

    #[test]
    fn strips_citation_markers() {
        let out = normalize_inlines(vec![t("Fact.[1][citation needed] More[edit]")]);
        assert_eq!(out, vec![t("Fact. More")]);
    }

    #[test]
    fn bracketed_letters_are_content() {
        let out = normalize_inlines(vec![t("Sum of a[i] over i.[2][edit]")]);
        assert_eq!(out, vec![t("Sum of a[i] over i.")]);
    }

    #[test]
    fn drops_empty_containers_and_merges_text() {
        let out = normalize_inlines(vec![
            t("a"),
            Inline::Italic {
                content: vec![t("   ")],
            },
            t("b"),
            Inline::LineBreak,
        ]);
        assert_eq!(out, vec![t("a b")]);
    }

    #[test]
    fn blank_bold_inside_link_keeps_one_space() {
        let out = normalize_inlines(vec![Inline::Link {
            href: "/wiki/X".into(),
            content: vec![
                t("x"),
                Inline::Bold {
                    content: vec![t(" ")],
                },
                t(" y"),
            ],
        }]);
        assert_eq!(
            out,
            vec![Inline::Link {
                href: "/wiki/X".into(),
                content: vec![t("x y")],
            }]
        );
    }

    #[test]
    fn no_space_after_line_break() {
        let out = normalize_inlines(vec![t("one"), Inline::LineBreak, t(" two")]);
        assert_eq!(out, vec![t("one"), Inline::LineBreak, t("two")]);
    }

    #[test]
    fn list_normalisation_removes_blank_items() {
        let list = List {
            ordered: false,
            items: vec![
                ListItem {
                    content: vec![t(" x ")],
                    sublists: vec![],
                },
                ListItem {
                    content: vec![t("  ")],
                    sublists: vec![List {
                        ordered: true,
                        items: vec![],
                    }],
                },
            ],
        };
        let out = normalize_list(list);
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].content, vec![t("x")]);
    }
}
