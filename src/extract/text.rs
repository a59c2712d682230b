//! Paragraph-preserving text flattening.
//!
//! `ElementRef::text()` concatenates every text node, losing the paragraph
//! structure chapter bodies depend on. [`block_text`] walks the subtree
//! instead, turning `<br>` and block-level elements into line breaks and
//! skipping script-like elements entirely.

use scraper::ElementRef;

use crate::rule::collapse_whitespace;

const SKIPPED: &[&str] = &[
    "script", "style", "noscript", "iframe", "template", "button", "select", "form",
];

const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "blockquote", "pre", "li", "ul", "ol", "dl", "dd", "dt",
    "tr", "table", "h1", "h2", "h3", "h4", "h5", "h6", "header", "footer", "center",
];

/// Text of `element` with one paragraph per line.
///
/// Elements in `excluded` (and their subtrees) are skipped. Every line is
/// whitespace-collapsed, full-width indentation included, and empty lines
/// are dropped.
#[must_use]
pub fn block_text(element: ElementRef<'_>, excluded: &[ElementRef<'_>]) -> String {
    let mut raw = String::new();
    walk(element, excluded, &mut raw);
    normalize_lines(&raw)
}

/// Collapses each line and drops the empty ones.
#[must_use]
pub fn normalize_lines(raw: &str) -> String {
    raw.lines()
        .map(collapse_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn walk(element: ElementRef<'_>, excluded: &[ElementRef<'_>], out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child) = ElementRef::wrap(child) else {
            continue;
        };
        if excluded.iter().any(|skip| skip.id() == child.id()) {
            continue;
        }
        let name = child.value().name();
        if SKIPPED.contains(&name) {
            continue;
        }
        if name == "br" {
            out.push('\n');
        } else if BLOCKS.contains(&name) {
            out.push('\n');
            walk(child, excluded, out);
            out.push('\n');
        } else {
            walk(child, excluded, out);
        }
    }
}

/// Characters of text sitting directly in `element`: its own text nodes and
/// the text of its direct `<p>` children.
#[must_use]
pub fn direct_paragraph_chars(element: ElementRef<'_>) -> usize {
    element
        .children()
        .map(|child| {
            if let Some(text) = child.value().as_text() {
                count_visible(text)
            } else if let Some(child) = ElementRef::wrap(child)
                && child.value().name() == "p"
            {
                child.text().map(count_visible).sum()
            } else {
                0
            }
        })
        .sum()
}

/// Drops a short leading label: `作者：张三` becomes `张三`.
#[must_use]
pub fn strip_label(raw: &str) -> String {
    let stripped = raw
        .split_once(['：', ':'])
        .filter(|(label, _)| label.chars().count() <= 6)
        .map_or(raw, |(_, rest)| rest);
    stripped.trim().to_string()
}

fn count_visible(text: &str) -> usize {
    text.chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{3000}')
        .count()
}
