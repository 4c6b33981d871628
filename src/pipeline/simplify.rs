//! Markup simplification: upstream article HTML → [`SimplifiedDocument`].
//!
//! ## Approach
//!
//! The upstream markup is parsed with a tolerant HTML5 parser (scraper /
//! html5ever), so broken markup never aborts a render. The content root is
//! then walked once, top-down, and every element is classified into an
//! [`ElementKind`]. Each kind has exactly one handling rule:
//!
//! | Kind | Rule |
//! |------|------|
//! | container (`div`, `section`, …) | transparent; children become sequential blocks |
//! | block (`p`, `h2`, `ul`, `table`, …) | becomes one [`Block`] |
//! | inline (`b`, `i`, `a`, `span`, …) | becomes [`Inline`] nodes or is flattened |
//! | figure / image | becomes an [`ImageRef`] block, hoisted out of inline context |
//! | stripped | subtree discarded |
//! | unknown | subtree discarded, logged at `trace` |
//!
//! Layout that legacy browsers cannot express is collapsed rather than
//! approximated: stray inline text inside a container is wrapped in an
//! implicit paragraph, a table nested inside a cell is flattened to text,
//! and images found inside tables or list items are emitted as image
//! blocks just before the enclosing block.
//!
//! `scraper::Html` is `!Send`, so the whole walk runs synchronously inside
//! one `spawn_blocking` call and returns a fully owned tree.

use crate::config::{ProxyConfig, RenderOptions};
use crate::document::{
    normalize_inlines, normalize_list, Block, ImageRef, Inline, List, ListItem,
    SimplifiedDocument, Table, TableCell,
};
use crate::error::ProxyError;
use crate::pipeline::emit::article_href;
use once_cell::sync::Lazy;
use scraper::node::{Element, Node};
use scraper::{ElementRef, Html, Selector};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

static SEL_CONTENT: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.mw-parser-output").unwrap());
static SEL_CONTENT_TEXT: Lazy<Selector> = Lazy::new(|| Selector::parse("#mw-content-text").unwrap());
static SEL_BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").unwrap());
static SEL_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("h1#firstHeading").unwrap());

/// Class names whose elements are page furniture, not article content.
const BOILERPLATE_CLASSES: &[&str] = &[
    "mw-editsection",
    "reference",
    "reflist",
    "references",
    "mw-references-wrap",
    "navbox",
    "vertical-navbox",
    "sidebar",
    "toc",
    "hatnote",
    "shortdescription",
    "noprint",
    "mw-jump-link",
    "mw-empty-elt",
    "mbox-small",
    "ambox",
    "metadata",
    "mw-cite-backlink",
    "navigation-not-searchable",
];

const BOILERPLATE_IDS: &[&str] = &["toc", "coordinates", "siteSub", "contentSub", "jump-to-nav"];

/// Images narrower than this inside running text are icons and are dropped.
const MIN_INLINE_IMAGE_WIDTH: u32 = 40;

/// How one element is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Section heading, already mapped to level 2–4.
    Heading(u8),
    Paragraph,
    List { ordered: bool },
    ListItem,
    DefinitionList,
    DefinitionTerm,
    DefinitionDetails,
    Table,
    Caption,
    TableSection,
    TableRow,
    TableCell { header: bool },
    Bold,
    Italic,
    Anchor,
    Image,
    Figure,
    FigureCaption,
    LineBreak,
    Rule,
    Preformatted,
    Math,
    Container,
    InlineWrapper,
    Stripped,
    Unknown,
}

/// Classify an element. Boilerplate classes and ids win over the tag name.
pub fn classify(el: &Element) -> ElementKind {
    if is_boilerplate(el) {
        return ElementKind::Stripped;
    }
    let name = el.name();
    if name == "div" && has_class(el, "thumb") {
        return ElementKind::Figure;
    }
    if name == "span" && el.attr("typeof").is_some_and(|t| t.starts_with("mw:File")) {
        return ElementKind::Figure;
    }
    match name {
        "h1" | "h2" => ElementKind::Heading(2),
        "h3" => ElementKind::Heading(3),
        "h4" | "h5" | "h6" => ElementKind::Heading(4),
        "p" => ElementKind::Paragraph,
        "ul" => ElementKind::List { ordered: false },
        "ol" => ElementKind::List { ordered: true },
        "li" => ElementKind::ListItem,
        "dl" => ElementKind::DefinitionList,
        "dt" => ElementKind::DefinitionTerm,
        "dd" => ElementKind::DefinitionDetails,
        "table" => ElementKind::Table,
        "caption" => ElementKind::Caption,
        "thead" | "tbody" | "tfoot" => ElementKind::TableSection,
        "tr" => ElementKind::TableRow,
        "th" => ElementKind::TableCell { header: true },
        "td" => ElementKind::TableCell { header: false },
        "b" | "strong" => ElementKind::Bold,
        "i" | "em" | "cite" | "var" | "dfn" => ElementKind::Italic,
        "a" => ElementKind::Anchor,
        "img" => ElementKind::Image,
        "figure" => ElementKind::Figure,
        "figcaption" => ElementKind::FigureCaption,
        "br" => ElementKind::LineBreak,
        "hr" => ElementKind::Rule,
        "pre" => ElementKind::Preformatted,
        "math" => ElementKind::Math,
        "html" | "body" | "div" | "section" | "article" | "main" | "blockquote" | "center"
        | "address" | "details" | "summary" => ElementKind::Container,
        "span" | "abbr" | "small" | "big" | "sub" | "sup" | "code" | "kbd" | "samp" | "tt"
        | "u" | "s" | "del" | "ins" | "q" | "bdi" | "bdo" | "font" | "mark" | "time"
        | "data" | "label" | "wbr" | "nobr" | "strike" | "rt" | "ruby" => {
            ElementKind::InlineWrapper
        }
        "script" | "style" | "noscript" | "link" | "meta" | "iframe" | "object" | "embed"
        | "video" | "audio" | "source" | "track" | "svg" | "canvas" | "map" | "area"
        | "form" | "input" | "button" | "select" | "option" | "textarea" | "nav" | "header"
        | "footer" | "aside" | "template" | "colgroup" | "col" | "rp" | "head" | "title" => {
            ElementKind::Stripped
        }
        _ => ElementKind::Unknown,
    }
}

fn has_class(el: &Element, class: &str) -> bool {
    el.classes().any(|c| c == class)
}

fn is_boilerplate(el: &Element) -> bool {
    if el.classes().any(|c| BOILERPLATE_CLASSES.contains(&c)) {
        return true;
    }
    if el.id().is_some_and(|id| BOILERPLATE_IDS.contains(&id)) {
        return true;
    }
    el.attr("style").is_some_and(|s| {
        let s = s.to_ascii_lowercase().replace(' ', "");
        s.contains("display:none")
    })
}

// ── Parameters ──────────────────────────────────────────────────────────

/// Everything besides the markup that determines the simplified output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimplifyParams {
    pub language: String,
    pub default_language: String,
    /// Host whose absolute `/wiki/` links count as internal.
    pub upstream_host: Option<String>,
    /// Scheme used to absolutise protocol-relative and root-relative image URLs.
    pub upstream_scheme: String,
    pub options: RenderOptions,
}

impl SimplifyParams {
    pub fn new(config: &ProxyConfig, language: &str, options: RenderOptions) -> Self {
        let base = config.upstream_base_for(language);
        let upstream_scheme = reqwest::Url::parse(&base)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        Self {
            language: language.to_string(),
            default_language: config.default_language.clone(),
            upstream_host: config.upstream_host_for(language),
            upstream_scheme,
            options,
        }
    }

    /// Language to carry in rewritten links; `None` for the default language.
    pub fn link_language(&self) -> Option<&str> {
        (self.language != self.default_language).then_some(self.language.as_str())
    }

    /// Rewrite an upstream link to a proxy-relative article link.
    ///
    /// Returns `None` for anything that is not a plain article link
    /// (namespaced pages, external sites, edit links, in-page anchors); the
    /// caller keeps only the link text.
    pub fn rewrite_link(&self, href: &str) -> Option<String> {
        let href = href.trim();
        let path = if let Some(rest) = href.strip_prefix("//") {
            self.same_host_path(&format!("{}://{rest}", self.upstream_scheme))?
        } else if href.starts_with("http://") || href.starts_with("https://") {
            self.same_host_path(href)?
        } else if href.starts_with('/') {
            href.split(['?', '#']).next().unwrap_or_default().to_string()
        } else {
            return None;
        };

        let title = path.strip_prefix("/wiki/")?;
        if title.is_empty() || title.contains(':') || title.to_ascii_lowercase().contains("%3a") {
            return None;
        }
        Some(article_href(title, self.link_language(), self.options))
    }

    fn same_host_path(&self, absolute: &str) -> Option<String> {
        let url = reqwest::Url::parse(absolute).ok()?;
        let host = url.host_str()?;
        if self.upstream_host.as_deref() != Some(host) {
            return None;
        }
        Some(url.path().to_string())
    }

    /// Absolute upstream URL for an `<img src>`; `None` for inline data.
    pub fn absolute_image_url(&self, src: &str) -> Option<String> {
        let src = src.trim();
        if let Some(rest) = src.strip_prefix("//") {
            Some(format!("{}://{rest}", self.upstream_scheme))
        } else if src.starts_with("http://") || src.starts_with("https://") {
            Some(src.to_string())
        } else if src.starts_with('/') {
            let host = self.upstream_host.as_deref()?;
            Some(format!("{}://{host}{src}", self.upstream_scheme))
        } else {
            None
        }
    }
}

// ── Entry points ────────────────────────────────────────────────────────

/// Simplify `raw_markup` synchronously.
///
/// `requested_title` is used when the markup carries no first heading.
pub fn simplify(raw_markup: &str, requested_title: &str, params: &SimplifyParams) -> SimplifiedDocument {
    let start = Instant::now();
    let html = Html::parse_document(raw_markup);

    let title = html
        .select(&SEL_TITLE)
        .next()
        .map(|h| collapse_text(h.text()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| requested_title.replace('_', " ").trim().to_string());

    let root = html
        .select(&SEL_CONTENT)
        .next()
        .or_else(|| html.select(&SEL_CONTENT_TEXT).next())
        .or_else(|| html.select(&SEL_BODY).next())
        .unwrap_or_else(|| html.root_element());

    let mut builder = Builder::new(params);
    builder.walk_blocks(root);
    builder.flush_paragraph();
    let blocks = finish(builder.blocks, params.options);

    debug!(
        "Simplified '{}' into {} blocks in {:?}",
        title,
        blocks.len(),
        start.elapsed()
    );
    SimplifiedDocument { title, blocks }
}

/// Simplify on the blocking pool under `budget`.
pub async fn simplify_async(
    raw_markup: String,
    requested_title: String,
    params: SimplifyParams,
    budget: Duration,
) -> Result<SimplifiedDocument, ProxyError> {
    let task = tokio::task::spawn_blocking(move || simplify(&raw_markup, &requested_title, &params));
    match tokio::time::timeout(budget, task).await {
        Ok(Ok(doc)) => Ok(doc),
        Ok(Err(e)) => Err(ProxyError::Internal(format!("simplify task failed: {e}"))),
        Err(_) => Err(ProxyError::Internal(format!(
            "simplification exceeded {}ms",
            budget.as_millis()
        ))),
    }
}

fn collapse_text<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text below `el`, skipping stripped and unrecognised subtrees. Block-level
/// children are separated by a space; inline children are joined as-is.
fn visible_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    push_visible_text(el, &mut out);
    out
}

fn push_visible_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(&t.text),
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                match classify(child_el.value()) {
                    ElementKind::Stripped | ElementKind::Unknown => {}
                    ElementKind::Bold
                    | ElementKind::Italic
                    | ElementKind::Anchor
                    | ElementKind::Math
                    | ElementKind::InlineWrapper => push_visible_text(child_el, out),
                    ElementKind::LineBreak => out.push('\n'),
                    _ => {
                        out.push(' ');
                        push_visible_text(child_el, out);
                        out.push(' ');
                    }
                }
            }
            _ => {}
        }
    }
}

// ── Tree walk ───────────────────────────────────────────────────────────

struct Builder<'p> {
    params: &'p SimplifyParams,
    blocks: Vec<Block>,
    /// Inline content not yet wrapped in a block.
    pending_inline: Vec<Inline>,
    /// Images found in inline context, emitted before the next block.
    hoisted: Vec<ImageRef>,
}

impl<'p> Builder<'p> {
    fn new(params: &'p SimplifyParams) -> Self {
        Self {
            params,
            blocks: Vec::new(),
            pending_inline: Vec::new(),
            hoisted: Vec::new(),
        }
    }

    fn push_block(&mut self, block: Block) {
        for image in self.hoisted.drain(..) {
            self.blocks.push(Block::Image(image));
        }
        self.blocks.push(block);
    }

    /// Wrap pending inline content in an implicit paragraph.
    fn flush_paragraph(&mut self) {
        let content = std::mem::take(&mut self.pending_inline);
        if content.iter().any(has_visible_content) {
            self.push_block(Block::Paragraph { content });
        } else {
            for image in self.hoisted.drain(..) {
                self.blocks.push(Block::Image(image));
            }
        }
    }

    fn walk_blocks(&mut self, el: ElementRef<'_>) {
        for child in el.children() {
            match child.value() {
                Node::Text(t) => self.pending_inline.push(Inline::text(t.text.to_string())),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.block_element(child_el);
                    }
                }
                _ => {}
            }
        }
    }

    fn block_element(&mut self, el: ElementRef<'_>) {
        match classify(el.value()) {
            ElementKind::Heading(level) => {
                self.flush_paragraph();
                let content = self.inlines(el);
                self.push_block(Block::Heading { level, content });
            }
            ElementKind::Paragraph => {
                self.flush_paragraph();
                let content = self.inlines(el);
                self.pending_inline = content;
                self.flush_paragraph();
            }
            ElementKind::List { ordered } => {
                self.flush_paragraph();
                let list = self.list(el, ordered);
                self.push_block(Block::List(list));
            }
            ElementKind::DefinitionList => {
                self.flush_paragraph();
                self.definition_list(el);
            }
            ElementKind::Table => {
                self.flush_paragraph();
                if let Some(table) = self.table(el) {
                    self.push_block(Block::Table(table));
                } else {
                    self.flush_paragraph();
                }
            }
            ElementKind::Figure | ElementKind::Image => {
                self.flush_paragraph();
                if let Some(image) = self.figure(el) {
                    self.blocks.push(Block::Image(image));
                }
            }
            ElementKind::Preformatted => {
                self.flush_paragraph();
                let text = visible_text(el);
                let text = text.trim_matches('\n').to_string();
                if !text.trim().is_empty() {
                    self.push_block(Block::Preformatted { text });
                }
            }
            ElementKind::Rule => {
                self.flush_paragraph();
                self.push_block(Block::Rule);
            }
            ElementKind::Container
            | ElementKind::ListItem
            | ElementKind::DefinitionTerm
            | ElementKind::DefinitionDetails
            | ElementKind::Caption
            | ElementKind::TableSection
            | ElementKind::TableRow
            | ElementKind::TableCell { .. }
            | ElementKind::FigureCaption => {
                self.flush_paragraph();
                self.walk_blocks(el);
                self.flush_paragraph();
            }
            ElementKind::Bold
            | ElementKind::Italic
            | ElementKind::Anchor
            | ElementKind::LineBreak
            | ElementKind::Math
            | ElementKind::InlineWrapper => {
                let mut out = std::mem::take(&mut self.pending_inline);
                self.inline_element(el, &mut out);
                self.pending_inline = out;
            }
            ElementKind::Stripped => {}
            ElementKind::Unknown => {
                trace!("dropping unrecognised <{}>", el.value().name());
            }
        }
    }

    /// Inline content of `el`'s children.
    fn inlines(&mut self, el: ElementRef<'_>) -> Vec<Inline> {
        let mut out = Vec::new();
        self.inline_children(el, &mut out);
        out
    }

    fn inline_children(&mut self, el: ElementRef<'_>, out: &mut Vec<Inline>) {
        for child in el.children() {
            match child.value() {
                Node::Text(t) => out.push(Inline::text(t.text.to_string())),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.inline_element(child_el, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn inline_element(&mut self, el: ElementRef<'_>, out: &mut Vec<Inline>) {
        match classify(el.value()) {
            ElementKind::Bold => out.push(Inline::Bold {
                content: self.inlines(el),
            }),
            ElementKind::Italic => out.push(Inline::Italic {
                content: self.inlines(el),
            }),
            ElementKind::Anchor => {
                let content = self.inlines(el);
                match el.value().attr("href").and_then(|h| self.params.rewrite_link(h)) {
                    Some(href) => out.push(Inline::Link { href, content }),
                    None => out.extend(content),
                }
            }
            ElementKind::LineBreak => out.push(Inline::LineBreak),
            ElementKind::Math => {
                let alt = el
                    .value()
                    .attr("alttext")
                    .map(str::to_string)
                    .unwrap_or_else(|| collapse_text(std::iter::once(visible_text(el).as_str())));
                out.push(Inline::text(format!(" {alt} ")));
            }
            ElementKind::Image => {
                if let Some(image) = self.image_ref(el, String::new()) {
                    let small = el
                        .value()
                        .attr("width")
                        .and_then(|w| w.trim().parse::<u32>().ok())
                        .is_some_and(|w| w < MIN_INLINE_IMAGE_WIDTH);
                    if !small {
                        self.hoisted.push(image);
                    }
                }
            }
            ElementKind::Figure => {
                if let Some(image) = self.figure(el) {
                    self.hoisted.push(image);
                }
            }
            ElementKind::Table => {
                // Nested table: flatten to its text.
                out.push(Inline::text(format!(" {} ", visible_text(el))));
            }
            ElementKind::Heading(_)
            | ElementKind::Paragraph
            | ElementKind::List { .. }
            | ElementKind::ListItem
            | ElementKind::DefinitionList
            | ElementKind::DefinitionTerm
            | ElementKind::DefinitionDetails
            | ElementKind::Caption
            | ElementKind::TableSection
            | ElementKind::TableRow
            | ElementKind::TableCell { .. }
            | ElementKind::FigureCaption
            | ElementKind::Preformatted
            | ElementKind::Container => {
                out.push(Inline::text(" "));
                self.inline_children(el, out);
                out.push(Inline::text(" "));
            }
            ElementKind::InlineWrapper => self.inline_children(el, out),
            ElementKind::Rule | ElementKind::Stripped => {}
            ElementKind::Unknown => {
                trace!("dropping unrecognised inline <{}>", el.value().name());
            }
        }
    }

    fn list(&mut self, el: ElementRef<'_>, ordered: bool) -> List {
        let mut items = Vec::new();
        for child in el.children().filter_map(ElementRef::wrap) {
            match classify(child.value()) {
                ElementKind::ListItem => items.push(self.list_item(child)),
                ElementKind::List { ordered } => {
                    // Malformed nesting: a list directly inside a list.
                    let sub = self.list(child, ordered);
                    match items.last_mut() {
                        Some(ListItem { sublists, .. }) => sublists.push(sub),
                        None => items.push(ListItem {
                            content: Vec::new(),
                            sublists: vec![sub],
                        }),
                    }
                }
                _ => {}
            }
        }
        List { ordered, items }
    }

    fn list_item(&mut self, li: ElementRef<'_>) -> ListItem {
        let mut content = Vec::new();
        let mut sublists = Vec::new();
        for child in li.children() {
            match child.value() {
                Node::Text(t) => content.push(Inline::text(t.text.to_string())),
                Node::Element(_) => {
                    let Some(child_el) = ElementRef::wrap(child) else {
                        continue;
                    };
                    match classify(child_el.value()) {
                        ElementKind::List { ordered } => {
                            sublists.push(self.list(child_el, ordered))
                        }
                        _ => self.inline_element(child_el, &mut content),
                    }
                }
                _ => {}
            }
        }
        ListItem { content, sublists }
    }

    fn definition_list(&mut self, el: ElementRef<'_>) {
        for child in el.children().filter_map(ElementRef::wrap) {
            match classify(child.value()) {
                ElementKind::DefinitionTerm => {
                    let content = self.inlines(child);
                    self.push_block(Block::Paragraph {
                        content: vec![Inline::Bold { content }],
                    });
                }
                ElementKind::DefinitionDetails => {
                    let content = self.inlines(child);
                    self.push_block(Block::Paragraph { content });
                }
                _ => {}
            }
        }
    }

    fn table(&mut self, el: ElementRef<'_>) -> Option<Table> {
        let mut caption = Vec::new();
        let mut rows = Vec::new();
        for child in el.children().filter_map(ElementRef::wrap) {
            match classify(child.value()) {
                ElementKind::Caption => caption = self.inlines(child),
                ElementKind::TableSection => {
                    for row in child.children().filter_map(ElementRef::wrap) {
                        if classify(row.value()) == ElementKind::TableRow {
                            rows.push(self.table_row(row));
                        }
                    }
                }
                ElementKind::TableRow => rows.push(self.table_row(child)),
                _ => {}
            }
        }
        rows.retain(|r: &Vec<TableCell>| !r.is_empty());
        (!rows.is_empty()).then_some(Table { caption, rows })
    }

    fn table_row(&mut self, tr: ElementRef<'_>) -> Vec<TableCell> {
        tr.children()
            .filter_map(ElementRef::wrap)
            .filter_map(|cell| match classify(cell.value()) {
                ElementKind::TableCell { header } => Some(TableCell {
                    header,
                    content: self.inlines(cell),
                }),
                _ => None,
            })
            .collect()
    }

    /// First usable image below `el`, captioned from a `figcaption` or
    /// `.thumbcaption` when present.
    fn figure(&mut self, el: ElementRef<'_>) -> Option<ImageRef> {
        let caption = el
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|d| {
                d.value().name() == "figcaption" || has_class(d.value(), "thumbcaption")
            })
            .map(|c| crate::document::strip_markers(&collapse_text(std::iter::once(visible_text(c).as_str()))))
            .unwrap_or_default();

        if el.value().name() == "img" {
            return self.image_ref(el, caption);
        }
        let img = el
            .descendants()
            .filter_map(ElementRef::wrap)
            .find(|d| d.value().name() == "img")?;
        self.image_ref(img, caption)
    }

    fn image_ref(&self, img: ElementRef<'_>, caption: String) -> Option<ImageRef> {
        let src = img.value().attr("src")?;
        let original_url = self.params.absolute_image_url(src)?;
        let alt_text = img
            .value()
            .attr("alt")
            .map(|a| a.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| caption.clone());
        Some(ImageRef {
            original_url,
            alt_text,
            caption,
            position: 0,
        })
    }
}

fn has_visible_content(node: &Inline) -> bool {
    match node {
        Inline::Text { text } => !text.trim().is_empty(),
        Inline::Bold { content } | Inline::Italic { content } | Inline::Link { content, .. } => {
            content.iter().any(has_visible_content)
        }
        Inline::LineBreak => false,
    }
}

/// Normalise text, drop empty blocks, number images, apply the image mode.
fn finish(blocks: Vec<Block>, options: RenderOptions) -> Vec<Block> {
    let mut out = Vec::with_capacity(blocks.len());
    let mut next_position = 0;
    for block in blocks {
        let block = match block {
            Block::Heading { level, content } => {
                let content = normalize_inlines(content);
                if content.is_empty() {
                    continue;
                }
                Block::Heading { level, content }
            }
            Block::Paragraph { content } => {
                let content = normalize_inlines(content);
                if content.is_empty() {
                    continue;
                }
                Block::Paragraph { content }
            }
            Block::List(list) => {
                let list = normalize_list(list);
                if list.items.is_empty() {
                    continue;
                }
                Block::List(list)
            }
            Block::Table(table) => {
                let rows: Vec<Vec<TableCell>> = table
                    .rows
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|c| TableCell {
                                header: c.header,
                                content: normalize_inlines(c.content),
                            })
                            .collect::<Vec<_>>()
                    })
                    .filter(|row| row.iter().any(|c| !c.content.is_empty()))
                    .collect();
                if rows.is_empty() {
                    continue;
                }
                Block::Table(Table {
                    caption: normalize_inlines(table.caption),
                    rows,
                })
            }
            Block::Image(mut image) => {
                image.position = next_position;
                next_position += 1;
                if !options.image_mode.keeps(image.position) {
                    continue;
                }
                Block::Image(image)
            }
            other @ (Block::Preformatted { .. } | Block::Rule) => other,
        };
        out.push(block);
    }
    // A rule with nothing before it carries nothing.
    while matches!(out.first(), Some(Block::Rule)) {
        out.remove(0);
    }
    out
}
