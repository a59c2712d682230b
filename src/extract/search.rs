//! Search result extraction.

use std::collections::HashSet;

use scraper::{ElementRef, Html};

use super::builtin;
use super::detail;
use super::error::{StrategyAttempt, StrategyKind};
use super::strategy::{PageContext, StrategyFn, run_chain};
use super::text::strip_label;
use crate::fetch::charset::encode_query;
use crate::model::SearchResult;
use crate::rule::{HttpMethod, SearchRule, SelectorList, SourceRule, Target, read_target};
use crate::validate::{RejectReason, Verdict};

const CHAIN: &[(StrategyKind, StrategyFn<Vec<SearchResult>>)] = &[
    (StrategyKind::PrimarySelectors, from_rule),
    (StrategyKind::AlternateSelectors, from_builtin),
    (StrategyKind::PatternExtraction, from_detail_redirect),
];

/// A search request ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub body: Option<String>,
}

/// Fills the `{keyword}` and `{page}` placeholders of a search rule.
///
/// The keyword is percent-encoded in the rule's charset (UTF-8 when none is
/// set). Relative templates resolve against the source's base URL.
#[must_use]
pub fn build_request(rule: &SourceRule, search: &SearchRule, keyword: &str, page: u32) -> Option<SearchRequest> {
    let encoded = encode_query(keyword.trim(), search.charset);
    let fill = |template: &str| {
        template
            .replace("{keyword}", &encoded)
            .replace("{page}", &page.to_string())
    };
    let url = rule.resolve_url(&fill(&search.url_template), None)?;
    let body = match search.method {
        HttpMethod::Get => None,
        HttpMethod::Post => Some(search.body_template.as_deref().map(fill).unwrap_or_default()),
    };
    Some(SearchRequest {
        method: search.method,
        url,
        body,
    })
}

/// Parses a search results page.
pub fn parse_search(ctx: &PageContext<'_>, body: &str) -> Result<Vec<SearchResult>, Vec<StrategyAttempt>> {
    let html = Html::parse_document(body);
    run_chain(ctx, &html, CHAIN, |results| {
        if results.is_empty() {
            Verdict::Reject(RejectReason::Empty)
        } else {
            Verdict::Accept
        }
    })
    .map(|(results, _)| results)
}

/// Title, URL and metadata selectors used to read one result item.
struct ItemFields<'r> {
    title: Option<&'r SelectorList>,
    url: Option<&'r SelectorList>,
    author: Option<&'r SelectorList>,
}

fn from_rule(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<SearchResult>> {
    let search = ctx.rule.search.as_ref()?;
    let items = search.list.as_ref()?.select_all(html.root_element());
    if items.is_empty() {
        return None;
    }
    let fields = ItemFields {
        title: search.fields.title.as_ref(),
        url: search.fields.url.as_ref(),
        author: search.fields.author.as_ref(),
    };
    let mut results = collect(ctx, &items, &fields);
    for (result, item) in results.iter_mut() {
        let read = |list: Option<&SelectorList>| list.and_then(|l| l.first_value(*item));
        result.intro = read(search.fields.intro.as_ref());
        result.category = read(search.fields.category.as_ref());
        result.latest_chapter = read(search.fields.latest_chapter.as_ref());
        result.word_count = read(search.fields.word_count.as_ref());
        result.update_time = read(search.fields.update_time.as_ref());
        result.cover_url = read(search.fields.cover.as_ref()).and_then(|href| ctx.resolve(&href));
    }
    Some(results.into_iter().map(|(result, _)| result).collect())
}

fn from_builtin(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<SearchResult>> {
    let items = builtin::SEARCH_ITEMS.as_ref()?.select_all(html.root_element());
    if items.is_empty() {
        return None;
    }
    let fields = ItemFields {
        title: builtin::SEARCH_ITEM_TITLE.as_ref(),
        url: None,
        author: builtin::SEARCH_ITEM_AUTHOR.as_ref(),
    };
    Some(collect(ctx, &items, &fields).into_iter().map(|(result, _)| result).collect())
}

/// Sites that redirect a unique match straight to its detail page.
fn from_detail_redirect(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<SearchResult>> {
    if !detail::is_detail_page(html) {
        return None;
    }
    let detail = detail::parse_document(ctx, html).ok()?;
    Some(vec![SearchResult {
        title: detail.title,
        url: detail.url,
        author: detail.author,
        intro: detail.intro,
        category: detail.category,
        latest_chapter: detail.latest_chapter,
        word_count: detail.word_count,
        update_time: detail.update_time,
        cover_url: detail.cover_url,
        source_id: ctx.rule.id.clone(),
        source_name: ctx.rule.name.clone(),
    }])
}

/// Reads every item, skipping those without a usable title or URL and
/// repeated URLs.
fn collect<'a>(
    ctx: &PageContext<'_>,
    items: &[ElementRef<'a>],
    fields: &ItemFields<'_>,
) -> Vec<(SearchResult, ElementRef<'a>)> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(|item| {
            let (title, href) = item_link(*item, fields)?;
            if !ctx.validator.validate_title(&title) {
                return None;
            }
            let url = ctx.resolve(&href)?;
            if !seen.insert(url.clone()) {
                return None;
            }
            let author = fields
                .author
                .and_then(|list| list.first_value(*item))
                .map(|raw| strip_label(&raw))
                .filter(|author| !author.is_empty());
            Some((
                SearchResult {
                    title,
                    url,
                    author,
                    intro: None,
                    category: None,
                    latest_chapter: None,
                    word_count: None,
                    update_time: None,
                    cover_url: None,
                    source_id: ctx.rule.id.clone(),
                    source_name: ctx.rule.name.clone(),
                },
                *item,
            ))
        })
        .collect()
}

/// Title and raw href of an item. An item that is itself an anchor supplies
/// both when the field selectors find nothing inside it.
fn item_link(item: ElementRef<'_>, fields: &ItemFields<'_>) -> Option<(String, String)> {
    let is_anchor = item.value().name() == "a";
    let title_element = fields
        .title
        .and_then(|list| list.select_first(item))
        .map(|(element, selector)| (selector.read(element), element));

    let title = match &title_element {
        Some((Some(title), _)) => Some(title.clone()),
        _ if is_anchor => read_target(item, &Target::Text),
        _ => None,
    }?;

    let href = fields
        .url
        .and_then(|list| list.first_value(item))
        .or_else(|| {
            title_element
                .as_ref()
                .and_then(|(_, element)| element.value().attr("href"))
                .map(str::to_string)
        })
        .or_else(|| is_anchor.then(|| item.value().attr("href").map(str::to_string)).flatten())?;
    Some((title, href))
}
