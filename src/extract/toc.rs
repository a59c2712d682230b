//! Table-of-contents extraction.

use std::collections::{HashMap, HashSet};

use scraper::{ElementRef, Html};

use super::builtin;
use super::error::{StrategyAttempt, StrategyKind};
use super::strategy::{PageContext, StrategyFn, run_chain};
use crate::download::chapter_number;
use crate::model::ChapterInfo;
use crate::rule::{Target, read_target};
use crate::validate::{RejectReason, Verdict};

const CHAIN: &[(StrategyKind, StrategyFn<Vec<ChapterInfo>>)] = &[
    (StrategyKind::PrimarySelectors, from_rule),
    (StrategyKind::AlternateSelectors, from_builtin),
    (StrategyKind::PatternExtraction, from_chapter_anchors),
];

/// Fewest chapter-like anchors the pattern strategy needs to trust a page.
const MIN_PATTERN_ANCHORS: usize = 3;

/// Entries of one TOC page plus the link to the next page, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct TocPage {
    /// In page order; ordinals are assigned by [`finalize`].
    pub entries: Vec<ChapterInfo>,
    pub next_page: Option<String>,
}

/// Parses one TOC page.
pub fn parse_toc_page(ctx: &PageContext<'_>, body: &str) -> Result<TocPage, Vec<StrategyAttempt>> {
    let html = Html::parse_document(body);
    let (entries, _) = run_chain(ctx, &html, CHAIN, |entries| {
        if entries.is_empty() {
            Verdict::Reject(RejectReason::Empty)
        } else {
            Verdict::Accept
        }
    })?;
    Ok(TocPage {
        entries,
        next_page: next_page(ctx, &html),
    })
}

fn next_page(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let toc = &ctx.rule.toc;
    if !toc.has_pages {
        return None;
    }
    let href = toc.next_page.as_ref()?.first_value(html.root_element())?;
    ctx.resolve(&href)
        .filter(|next| next.as_str() != ctx.page_url.as_str())
}

fn entry(ctx: &PageContext<'_>, title: Option<String>, href: Option<String>) -> Option<ChapterInfo> {
    let title = title?;
    let url = ctx.resolve(&href?)?;
    ctx.validator
        .validate_title(&title)
        .then(|| ChapterInfo::new(title, url, 0))
}

fn from_anchor(ctx: &PageContext<'_>, anchor: ElementRef<'_>) -> Option<ChapterInfo> {
    entry(
        ctx,
        read_target(anchor, &Target::Text),
        anchor.value().attr("href").map(str::to_string),
    )
}

fn from_rule(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<ChapterInfo>> {
    let toc = &ctx.rule.toc;
    let items = toc.list.as_ref()?.select_all(html.root_element());
    if items.is_empty() {
        return None;
    }
    let anchors = builtin::ANCHORS.as_ref();
    let entries = items
        .into_iter()
        .filter_map(|item| {
            let is_anchor = item.value().name() == "a";
            let inner = anchors.and_then(|list| list.select_first(item)).map(|(a, _)| a);
            let link = if is_anchor { Some(item) } else { inner };

            let title = toc
                .title
                .as_ref()
                .and_then(|list| list.first_value(item))
                .or_else(|| link.and_then(|a| read_target(a, &Target::Text)));
            let href = toc
                .url
                .as_ref()
                .and_then(|list| list.first_value(item))
                .or_else(|| link.and_then(|a| a.value().attr("href")).map(str::to_string));
            entry(ctx, title, href)
        })
        .collect();
    Some(entries)
}

fn from_builtin(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<ChapterInfo>> {
    let anchors = builtin::TOC_LINKS.as_ref()?.select_all(html.root_element());
    if anchors.is_empty() {
        return None;
    }
    Some(anchors.into_iter().filter_map(|a| from_anchor(ctx, a)).collect())
}

fn from_chapter_anchors(ctx: &PageContext<'_>, html: &Html) -> Option<Vec<ChapterInfo>> {
    let pattern = builtin::CHAPTER_TITLE.as_ref()?;
    let entries: Vec<ChapterInfo> = builtin::ANCHORS
        .as_ref()?
        .select_all(html.root_element())
        .into_iter()
        .filter_map(|a| from_anchor(ctx, a))
        .filter(|info| pattern.is_match(&info.title))
        .collect();
    (entries.len() >= MIN_PATTERN_ANCHORS).then_some(entries)
}

/// Turns raw entries from every page into the final TOC: optional
/// latest-section trim, URL de-duplication and ordinals `1..=N`.
///
/// Among entries sharing a URL the first one with a chapter number in its
/// title wins and keeps its own position; without one the first occurrence
/// wins.
#[must_use]
pub fn finalize(mut entries: Vec<ChapterInfo>, trim_latest_section: bool) -> Vec<ChapterInfo> {
    if trim_latest_section {
        let leading = latest_section_len(&entries);
        entries.drain(..leading);
    }
    let mut winners: HashMap<&str, (usize, bool)> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        let numbered = chapter_number(&entry.title).is_some();
        winners
            .entry(entry.url.as_str())
            .and_modify(|winner| {
                if numbered && !winner.1 {
                    *winner = (index, true);
                }
            })
            .or_insert((index, numbered));
    }
    let keep: HashSet<usize> = winners.into_values().map(|(index, _)| index).collect();
    let mut index = 0;
    entries.retain(|_| {
        let kept = keep.contains(&index);
        index += 1;
        kept
    });
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.order = u32::try_from(index + 1).unwrap_or(u32::MAX);
    }
    entries
}

/// Length of the leading block whose URLs all appear again further down,
/// the "latest chapters" box many sites put above the full list.
fn latest_section_len(entries: &[ChapterInfo]) -> usize {
    let mut last_seen: HashMap<&str, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        last_seen.insert(entry.url.as_str(), index);
    }
    entries
        .iter()
        .enumerate()
        .take_while(|(index, entry)| last_seen.get(entry.url.as_str()).is_some_and(|last| last > index))
        .count()
}

/// Slices a finalized TOC by 1-based inclusive ordinals. `end` past the last
/// entry is clamped; an empty or inverted range yields nothing.
#[must_use]
pub fn slice(entries: &[ChapterInfo], start: Option<u32>, end: Option<u32>) -> Vec<ChapterInfo> {
    let start = start.unwrap_or(1).max(1);
    let end = end.unwrap_or(u32::MAX);
    if start > end {
        return Vec::new();
    }
    entries
        .iter()
        .filter(|entry| (start..=end).contains(&entry.order))
        .cloned()
        .collect()
}
