//! Book detail page extraction.

use std::collections::HashMap;

use scraper::{ElementRef, Html};

use super::builtin;
use super::error::{StrategyAttempt, StrategyKind};
use super::strategy::{PageContext, StrategyFn, run_chain};
use super::text::{block_text, strip_label};
use crate::model::BookDetail;
use crate::rule::{SelectorList, collapse_whitespace};
use crate::validate::{RejectReason, Verdict, is_garbled};

const CHAIN: &[(StrategyKind, StrategyFn<BookDetail>)] = &[
    (StrategyKind::PrimarySelectors, from_rule),
    (StrategyKind::AlternateSelectors, from_meta),
    (StrategyKind::PatternExtraction, from_patterns),
];

/// Site-name suffixes and decorations trimmed from `<title>` text.
const TITLE_NOISE: &[&str] = &["最新章节列表", "最新章节", "全文阅读", "无弹窗", "全文免费阅读"];

/// Parses a detail page.
///
/// Optional fields missing from the winning strategy are filled from `og:`
/// meta tags and labelled text.
pub fn parse_detail(ctx: &PageContext<'_>, body: &str) -> Result<BookDetail, Vec<StrategyAttempt>> {
    let html = Html::parse_document(body);
    parse_document(ctx, &html)
}

pub(super) fn parse_document(ctx: &PageContext<'_>, html: &Html) -> Result<BookDetail, Vec<StrategyAttempt>> {
    let (mut detail, _) = run_chain(ctx, html, CHAIN, |detail| check_title(ctx, &detail.title))?;
    fill_missing(&mut detail, &meta_fields(ctx, html));
    if detail.author.is_none() {
        detail.author = labelled_author(html);
    }
    Ok(detail)
}

/// Whether the page looks like a single book's detail page.
pub(super) fn is_detail_page(html: &Html) -> bool {
    let meta = meta_map(html);
    meta.contains_key("og:novel:book_name")
        || meta
            .get("og:type")
            .is_some_and(|kind| kind.to_ascii_lowercase().contains("novel"))
}

fn check_title(ctx: &PageContext<'_>, title: &str) -> Verdict {
    if title.trim().is_empty() {
        Verdict::Reject(RejectReason::Empty)
    } else if ctx.validator.validate_title(title) {
        Verdict::Accept
    } else {
        Verdict::Reject(RejectReason::Garbled)
    }
}

fn value(list: Option<&SelectorList>, root: ElementRef<'_>) -> Option<String> {
    list?.first_value(root)
}

fn link(ctx: &PageContext<'_>, list: Option<&SelectorList>, root: ElementRef<'_>) -> Option<String> {
    value(list, root).and_then(|href| ctx.resolve(&href))
}

fn empty_detail(ctx: &PageContext<'_>, title: String) -> BookDetail {
    BookDetail {
        title,
        url: ctx.page_url.to_string(),
        author: None,
        intro: None,
        category: None,
        cover_url: None,
        status: None,
        word_count: None,
        update_time: None,
        latest_chapter: None,
        toc_url: ctx.page_url.to_string(),
        source_id: ctx.rule.id.clone(),
    }
}

fn from_rule(ctx: &PageContext<'_>, html: &Html) -> Option<BookDetail> {
    let rule = &ctx.rule.detail;
    let root = html.root_element();
    let title = value(rule.title.as_ref(), root)?;
    let mut detail = empty_detail(ctx, title);
    detail.author = value(rule.author.as_ref(), root).map(|a| strip_label(&a));
    detail.intro = value(rule.intro.as_ref(), root);
    detail.category = value(rule.category.as_ref(), root);
    detail.cover_url = link(ctx, rule.cover.as_ref(), root);
    detail.status = value(rule.status.as_ref(), root);
    detail.word_count = value(rule.word_count.as_ref(), root);
    detail.update_time = value(rule.update_time.as_ref(), root);
    detail.latest_chapter = value(rule.latest_chapter.as_ref(), root);
    if let Some(toc) = link(ctx, rule.toc_url.as_ref(), root) {
        detail.toc_url = toc;
    }
    Some(detail)
}

/// Values read from `og:` meta tags.
#[derive(Debug, Default)]
struct MetaFields {
    title: Option<String>,
    author: Option<String>,
    intro: Option<String>,
    category: Option<String>,
    cover_url: Option<String>,
    status: Option<String>,
    update_time: Option<String>,
    latest_chapter: Option<String>,
    toc_url: Option<String>,
}

fn meta_map(html: &Html) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(meta) = builtin::META.as_ref() else {
        return map;
    };
    for element in meta.select_all(html.root_element()) {
        let attrs = element.value();
        let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
            continue;
        };
        let Some(content) = attrs.attr("content").map(collapse_whitespace) else {
            continue;
        };
        if !content.is_empty() {
            map.entry(key.trim().to_ascii_lowercase()).or_insert(content);
        }
    }
    map
}

fn meta_fields(ctx: &PageContext<'_>, html: &Html) -> MetaFields {
    let mut meta = meta_map(html);
    let mut take = |keys: &[&str]| keys.iter().find_map(|key| meta.remove(*key));
    MetaFields {
        title: take(&["og:novel:book_name", "og:title"]),
        author: take(&["og:novel:author", "author"]),
        intro: take(&["og:description", "description"]),
        category: take(&["og:novel:category"]),
        cover_url: take(&["og:image"]).and_then(|href| ctx.resolve(&href)),
        status: take(&["og:novel:status"]),
        update_time: take(&["og:novel:update_time"]),
        latest_chapter: take(&["og:novel:latest_chapter_name", "og:novel:lastest_chapter_name"]),
        toc_url: take(&["og:novel:read_url", "og:url"]).and_then(|href| ctx.resolve(&href)),
    }
}

fn from_meta(ctx: &PageContext<'_>, html: &Html) -> Option<BookDetail> {
    let meta = meta_fields(ctx, html);
    let title = meta.title.clone()?;
    let mut detail = empty_detail(ctx, title);
    fill_missing(&mut detail, &meta);
    Some(detail)
}

fn from_patterns(ctx: &PageContext<'_>, html: &Html) -> Option<BookDetail> {
    let root = html.root_element();
    let title = builtin::PAGE_TITLE
        .as_ref()?
        .first_value(root)
        .map(|raw| clean_page_title(&raw))
        .filter(|title| !title.is_empty())?;
    let mut detail = empty_detail(ctx, title);
    detail.author = labelled_author(html);
    detail.intro = builtin::DETAIL_INTRO
        .as_ref()
        .and_then(|list| list.select_first(root))
        .map(|(element, _)| block_text(element, &[]))
        .filter(|intro| !intro.is_empty() && !is_garbled(intro));
    detail.cover_url = builtin::DETAIL_COVER
        .as_ref()
        .and_then(|list| list.first_value(root))
        .and_then(|href| ctx.resolve(&href));
    Some(detail)
}

fn fill_missing(detail: &mut BookDetail, meta: &MetaFields) {
    fn fill(slot: &mut Option<String>, value: Option<&String>) {
        if slot.is_none() {
            *slot = value.cloned();
        }
    }
    fill(&mut detail.author, meta.author.as_ref());
    fill(&mut detail.intro, meta.intro.as_ref());
    fill(&mut detail.category, meta.category.as_ref());
    fill(&mut detail.cover_url, meta.cover_url.as_ref());
    fill(&mut detail.status, meta.status.as_ref());
    fill(&mut detail.update_time, meta.update_time.as_ref());
    fill(&mut detail.latest_chapter, meta.latest_chapter.as_ref());
    if detail.toc_url == detail.url
        && let Some(toc) = &meta.toc_url
    {
        detail.toc_url.clone_from(toc);
    }
}

fn labelled_author(html: &Html) -> Option<String> {
    let pattern = builtin::AUTHOR_LABEL.as_ref()?;
    let body = builtin::BODY.as_ref()?.select_first(html.root_element())?.0;
    let text = block_text(body, &[]);
    pattern
        .captures(&text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|author| !author.is_empty())
}

/// `斗破苍穹最新章节列表_某某小说网` → `斗破苍穹`.
fn clean_page_title(raw: &str) -> String {
    let mut title = raw
        .split(['_', '|', '-', '–'])
        .map(str::trim)
        .find(|part| !part.is_empty())
        .unwrap_or_default()
        .to_string();
    for noise in TITLE_NOISE {
        if let Some(stripped) = title.strip_suffix(noise) {
            title = stripped.trim().to_string();
        }
    }
    title
}
