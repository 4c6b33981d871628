//! Legacy HTML emission: [`SimplifiedDocument`] → HTML 3.2 page.
//!
//! Output is a pure function of its inputs: the same document, image
//! resolutions and context always produce byte-identical pages. Every tag
//! and attribute written here is on the [`crate::legacy`] allow-list.

use crate::config::{ImageMode, RenderOptions, Theme};
use crate::document::{Block, ImageRef, Inline, List, SimplifiedDocument, Table};
use crate::pipeline::transcode::{PLACEHOLDER_HEIGHT, PLACEHOLDER_WIDTH};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Site name shown in the header and window title.
pub const SITE_NAME: &str = "Vintagepedia";

/// Route serving the static placeholder image.
pub const PLACEHOLDER_SRC: &str = "/image/placeholder";

const DOCTYPE: &str = "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 3.2 Final//EN\">";

/// What an [`ImageRef`] turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResolution {
    /// Transcoded successfully; served from `/image/{key}`.
    Ready { key: String, width: u32, height: u32 },
    /// Fetch or transcode failed; the placeholder is shown instead.
    Placeholder,
}

/// Request-derived values the page shell needs.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    /// Normalised article title (`Lynx_(web_browser)`), unescaped.
    pub title_path: &'a str,
    /// Language to carry in links; `None` for the default language.
    pub language: Option<&'a str>,
    pub options: RenderOptions,
}

// ── URLs ────────────────────────────────────────────────────────────────

/// Percent-encode a title for use as a path segment.
pub fn encode_title(title: &str) -> String {
    url::form_urlencoded::byte_serialize(title.as_bytes()).collect()
}

/// Proxy-relative article link. `encoded_title` must already be escaped.
pub fn article_href(encoded_title: &str, language: Option<&str>, options: RenderOptions) -> String {
    let mut href = format!("/wiki/{encoded_title}");
    let query = query_string(language, options);
    if !query.is_empty() {
        href.push('?');
        href.push_str(&query);
    }
    href
}

/// Proxy-relative link to a transcoded image.
///
/// Only the theme affects image bytes (alpha matte), so only it is carried.
pub fn image_href(key: &str, theme: Theme) -> String {
    if theme == Theme::default() {
        format!("/image/{key}")
    } else {
        format!("/image/{key}?theme={}", theme.as_str())
    }
}

fn query_string(language: Option<&str>, options: RenderOptions) -> String {
    let mut parts = Vec::with_capacity(2);
    if let Some(lang) = language {
        parts.push(format!("lang={lang}"));
    }
    let opts = options.to_query();
    if !opts.is_empty() {
        parts.push(opts);
    }
    parts.join("&")
}

// ── Escaping ────────────────────────────────────────────────────────────

/// Escape text content.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Escape a double-quoted attribute value.
pub fn escape_attr(s: &str) -> String {
    escape_text(s).replace('"', "&quot;")
}

// ── Pages ───────────────────────────────────────────────────────────────

/// Render an article page.
///
/// Images without an entry in `images` are shown as the placeholder.
pub fn render_page(
    doc: &SimplifiedDocument,
    images: &BTreeMap<usize, ImageResolution>,
    ctx: &PageContext<'_>,
) -> String {
    let mut out = String::with_capacity(8 * 1024);
    open_shell(&mut out, &doc.title, ctx.options, ctx.language);
    let _ = writeln!(out, "<center><h2>{}</h2></center>", escape_text(&doc.title));

    for block in &doc.blocks {
        write_block(&mut out, block, images, ctx.options.theme);
    }

    out.push_str("<hr>\n");
    write_option_footer(&mut out, ctx);
    close_shell(&mut out);
    out
}

/// Render an error page carrying `message`.
pub fn error_page(message: &str, options: RenderOptions) -> String {
    let mut out = String::with_capacity(1024);
    open_shell(&mut out, "Error", options, None);
    out.push_str("<center><h2>Error</h2></center>\n");
    let _ = writeln!(out, "<p>{}</p>", escape_text(message));
    let _ = writeln!(
        out,
        "<p><a href=\"{}\">Return to the main page</a></p>",
        escape_attr(&home_href(None, options))
    );
    close_shell(&mut out);
    out
}

fn home_href(language: Option<&str>, options: RenderOptions) -> String {
    let query = query_string(language, options);
    if query.is_empty() {
        "/".to_string()
    } else {
        format!("/?{query}")
    }
}

fn open_shell(out: &mut String, title: &str, options: RenderOptions, language: Option<&str>) {
    let (bg, text, link, vlink) = options.theme.body_colors();
    out.push_str(DOCTYPE);
    out.push('\n');
    out.push_str("<html>\n<head>\n");
    out.push_str("<meta http-equiv=\"Content-Type\" content=\"text/html; charset=utf-8\">\n");
    let _ = writeln!(out, "<title>{} - {SITE_NAME}</title>", escape_text(title));
    out.push_str("</head>\n");
    let _ = writeln!(
        out,
        "<body bgcolor=\"{bg}\" text=\"{text}\" link=\"{link}\" vlink=\"{vlink}\">"
    );
    let _ = writeln!(
        out,
        "<center><h1><a href=\"{}\">{SITE_NAME}</a></h1></center>",
        escape_attr(&home_href(language, options))
    );
    out.push_str("<hr>\n");
}

fn close_shell(out: &mut String) {
    out.push_str("</body>\n</html>\n");
}

fn write_option_footer(out: &mut String, ctx: &PageContext<'_>) {
    let title = encode_title(ctx.title_path);
    let current = ctx.options;

    out.push_str("<p><small>Theme: ");
    for (i, theme) in [Theme::Light, Theme::Dark].into_iter().enumerate() {
        if i > 0 {
            out.push_str(" | ");
        }
        let opts = RenderOptions::new(theme, current.image_mode);
        write_toggle(out, theme.as_str(), opts == current, &title, ctx.language, opts);
    }
    out.push_str("<br>Images: ");
    for (i, mode) in [ImageMode::All, ImageMode::First, ImageMode::None]
        .into_iter()
        .enumerate()
    {
        if i > 0 {
            out.push_str(" | ");
        }
        let opts = RenderOptions::new(current.theme, mode);
        write_toggle(out, mode.as_str(), opts == current, &title, ctx.language, opts);
    }
    out.push_str("</small></p>\n");
}

fn write_toggle(
    out: &mut String,
    label: &str,
    selected: bool,
    encoded_title: &str,
    language: Option<&str>,
    options: RenderOptions,
) {
    if selected {
        let _ = write!(out, "<b>{label}</b>");
    } else {
        let href = article_href(encoded_title, language, options);
        let _ = write!(out, "<a href=\"{}\">{label}</a>", escape_attr(&href));
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────

fn write_block(
    out: &mut String,
    block: &Block,
    images: &BTreeMap<usize, ImageResolution>,
    theme: Theme,
) {
    match block {
        Block::Heading { level, content } => {
            let level = (*level).clamp(2, 4);
            let _ = write!(out, "<h{level}>");
            write_inlines(out, content);
            let _ = writeln!(out, "</h{level}>");
        }
        Block::Paragraph { content } => {
            out.push_str("<p>");
            write_inlines(out, content);
            out.push_str("</p>\n");
        }
        Block::List(list) => write_list(out, list),
        Block::Table(table) => write_table(out, table),
        Block::Image(image) => write_image(out, image, images.get(&image.position), theme),
        Block::Preformatted { text } => {
            let _ = writeln!(out, "<pre>{}</pre>", escape_text(text));
        }
        Block::Rule => out.push_str("<hr>\n"),
    }
}

fn write_list(out: &mut String, list: &List) {
    let tag = if list.ordered { "ol" } else { "ul" };
    let _ = writeln!(out, "<{tag}>");
    for item in &list.items {
        out.push_str("<li>");
        write_inlines(out, &item.content);
        if !item.sublists.is_empty() {
            out.push('\n');
            for sub in &item.sublists {
                write_list(out, sub);
            }
        }
        out.push_str("</li>\n");
    }
    let _ = writeln!(out, "</{tag}>");
}

fn write_table(out: &mut String, table: &Table) {
    out.push_str("<table border=\"1\" cellpadding=\"2\">\n");
    if !table.caption.is_empty() {
        out.push_str("<caption>");
        write_inlines(out, &table.caption);
        out.push_str("</caption>\n");
    }
    for row in &table.rows {
        out.push_str("<tr>");
        for cell in row {
            let tag = if cell.header { "th" } else { "td" };
            let _ = write!(out, "<{tag}>");
            write_inlines(out, &cell.content);
            let _ = write!(out, "</{tag}>");
        }
        out.push_str("</tr>\n");
    }
    out.push_str("</table>\n");
}

fn write_image(
    out: &mut String,
    image: &ImageRef,
    resolution: Option<&ImageResolution>,
    theme: Theme,
) {
    out.push_str("<p>");
    match resolution {
        Some(ImageResolution::Ready { key, width, height }) => {
            let _ = write!(
                out,
                "<img src=\"{}\" width=\"{width}\" height=\"{height}\" alt=\"{}\">",
                escape_attr(&image_href(key, theme)),
                escape_attr(&image.alt_text)
            );
        }
        Some(ImageResolution::Placeholder) | None => {
            let alt = if image.alt_text.is_empty() {
                "[image unavailable]".to_string()
            } else {
                format!("[{}]", image.alt_text)
            };
            let _ = write!(
                out,
                "<img src=\"{PLACEHOLDER_SRC}\" width=\"{PLACEHOLDER_WIDTH}\" height=\"{PLACEHOLDER_HEIGHT}\" alt=\"{}\">",
                escape_attr(&alt)
            );
        }
    }
    if !image.caption.is_empty() {
        let _ = write!(out, "<br><small>{}</small>", escape_text(&image.caption));
    }
    out.push_str("</p>\n");
}

fn write_inlines(out: &mut String, nodes: &[Inline]) {
    for node in nodes {
        match node {
            Inline::Text { text } => out.push_str(&escape_text(text)),
            Inline::Bold { content } => {
                out.push_str("<b>");
                write_inlines(out, content);
                out.push_str("</b>");
            }
            Inline::Italic { content } => {
                out.push_str("<i>");
                write_inlines(out, content);
                out.push_str("</i>");
            }
            Inline::Link { href, content } => {
                let _ = write!(out, "<a href=\"{}\">", escape_attr(href));
                write_inlines(out, content);
                out.push_str("</a>");
            }
            Inline::LineBreak => out.push_str("<br>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{ListItem, TableCell};
    use crate::legacy;

    fn doc() -> SimplifiedDocument {
        SimplifiedDocument {
            title: "Lynx <browser>".into(),
            blocks: vec![
                Block::Paragraph {
                    content: vec![
                        Inline::text("A & B "),
                        Inline::Link {
                            href: "/wiki/Mosaic?theme=dark&images=none".into(),
                            content: vec![Inline::text("Mosaic")],
                        },
                    ],
                },
                Block::Image(ImageRef {
                    original_url: "https://upload.wikimedia.org/a.png".into(),
                    alt_text: "Logo \"L\"".into(),
                    caption: "The logo".into(),
                    position: 0,
                }),
                Block::Image(ImageRef {
                    original_url: "https://upload.wikimedia.org/b.png".into(),
                    alt_text: "Screen".into(),
                    caption: String::new(),
                    position: 1,
                }),
                Block::List(List {
                    ordered: true,
                    items: vec![ListItem {
                        content: vec![Inline::text("one")],
                        sublists: vec![List {
                            ordered: false,
                            items: vec![ListItem {
                                content: vec![Inline::text("nested")],
                                sublists: vec![],
                            }],
                        }],
                    }],
                }),
                Block::Table(Table {
                    caption: vec![Inline::text("Facts")],
                    rows: vec![vec![
                        TableCell {
                            header: true,
                            content: vec![Inline::text("Key")],
                        },
                        TableCell {
                            header: false,
                            content: vec![Inline::text("Value")],
                        },
                    ]],
                }),
                Block::Preformatted {
                    text: "if a < b {}".into(),
                },
                Block::Rule,
            ],
        }
    }

    fn images() -> BTreeMap<usize, ImageResolution> {
        BTreeMap::from([
            (
                0,
                ImageResolution::Ready {
                    key: "aHR0cHM".into(),
                    width: 120,
                    height: 80,
                },
            ),
            (1, ImageResolution::Placeholder),
        ])
    }

    fn ctx(options: RenderOptions) -> PageContext<'static> {
        PageContext {
            title_path: "Lynx_(web_browser)",
            language: None,
            options,
        }
    }

    #[test]
    fn page_passes_legacy_validation() {
        let html = render_page(&doc(), &images(), &ctx(RenderOptions::default()));
        assert_eq!(legacy::validate(&html), Ok(()));
        assert!(html.starts_with("<!DOCTYPE HTML PUBLIC"));
        assert!(html.contains("<title>Lynx &lt;browser&gt; - Vintagepedia</title>"));
        assert!(html.contains("A &amp; B"));
        assert!(html.contains("href=\"/wiki/Mosaic?theme=dark&amp;images=none\""));
        assert!(html.contains("<pre>if a &lt; b {}</pre>"));
    }

    #[test]
    fn images_render_ready_and_placeholder() {
        let html = render_page(&doc(), &images(), &ctx(RenderOptions::default()));
        assert!(html.contains(
            "<img src=\"/image/aHR0cHM\" width=\"120\" height=\"80\" alt=\"Logo &quot;L&quot;\">"
        ));
        assert!(html.contains("<br><small>The logo</small>"));
        assert!(html.contains("src=\"/image/placeholder\""));
        assert!(html.contains("alt=\"[Screen]\""));
    }

    #[test]
    fn dark_theme_sets_body_and_image_query() {
        let opts = RenderOptions::new(Theme::Dark, ImageMode::All);
        let html = render_page(&doc(), &images(), &ctx(opts));
        assert!(html.contains("<body bgcolor=\"#000000\""));
        assert!(html.contains("src=\"/image/aHR0cHM?theme=dark\""));
        assert!(html.contains("<a href=\"/?theme=dark\">Vintagepedia</a>"));
    }

    #[test]
    fn footer_links_toggle_one_option_each() {
        let html = render_page(&doc(), &images(), &ctx(RenderOptions::default()));
        assert!(html.contains("<b>light</b>"));
        assert!(html.contains("<a href=\"/wiki/Lynx_%28web_browser%29?theme=dark\">dark</a>"));
        assert!(html.contains("<b>all</b>"));
        assert!(html.contains("<a href=\"/wiki/Lynx_%28web_browser%29?images=none\">none</a>"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = render_page(&doc(), &images(), &ctx(RenderOptions::default()));
        let b = render_page(&doc(), &images(), &ctx(RenderOptions::default()));
        assert_eq!(a, b);
    }

    #[test]
    fn language_is_carried_in_links() {
        assert_eq!(
            article_href("Berlin", Some("de"), RenderOptions::new(Theme::Dark, ImageMode::None)),
            "/wiki/Berlin?lang=de&theme=dark&images=none"
        );
        assert_eq!(article_href("Berlin", None, RenderOptions::default()), "/wiki/Berlin");
    }

    #[test]
    fn error_page_is_legacy_safe() {
        let html = error_page("Article '<x>' was not found", RenderOptions::default());
        assert_eq!(legacy::validate(&html), Ok(()));
        assert!(html.contains("Article '&lt;x&gt;' was not found"));
    }

    #[test]
    fn title_encoding() {
        assert_eq!(encode_title("Café_(x)"), "Caf%C3%A9_%28x%29");
        assert_eq!(encode_title("AC/DC"), "AC%2FDC");
    }
}
