//! Chapter de-duplication and ordering.
//!
//! Sites list chapters inconsistently: the same URL twice, a "latest"
//! copy of a chapter under a different title, or pages out of order. The
//! orchestrator runs [`dedup`] and then [`sort_and_number`] on everything it
//! fetched.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::model::Chapter;

/// Share of titles (in percent) that must carry a number for the set to be
/// sorted numerically.
const NUMBERED_THRESHOLD_PERCENT: usize = 70;

static NUMBER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"第\s*([0-9零〇一二两三四五六七八九十百千万]+)\s*[章节回]",
        r"(?i)\bchapter\s*([0-9]+)",
        r"^\s*([0-9]+)\s*[.、:：\s]",
    ]
    .into_iter()
    .filter_map(|raw| match Regex::new(raw) {
        Ok(regex) => Some(regex),
        Err(err) => {
            warn!(pattern = raw, error = %err, "chapter number pattern rejected");
            None
        }
    })
    .collect()
});

/// Chapter number in a title: `第12章`, `第十二回`, `Chapter 12` or a
/// leading `12.`. Full-width digits are accepted.
#[must_use]
pub fn chapter_number(title: &str) -> Option<u64> {
    let title: String = title.chars().map(narrow_digit).collect();
    NUMBER_PATTERNS.iter().find_map(|pattern| {
        let raw = pattern.captures(&title)?.get(1)?.as_str();
        raw.parse::<u64>().ok().or_else(|| parse_chinese_numeral(raw))
    })
}

fn narrow_digit(c: char) -> char {
    match c {
        '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap_or(c),
        _ => c,
    }
}

/// Parses Chinese numerals up to the tens of thousands: `十二` is 12,
/// `一百零五` is 105, `两千` is 2000. Mixed digit strings such as `1百`
/// are not supported.
#[must_use]
pub fn parse_chinese_numeral(raw: &str) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }
    let mut total = 0u64;
    let mut section = 0u64;
    let mut digit: Option<u64> = None;

    for c in raw.chars() {
        match c {
            '零' | '〇' => digit = Some(0),
            '一' => digit = Some(1),
            '二' | '两' => digit = Some(2),
            '三' => digit = Some(3),
            '四' => digit = Some(4),
            '五' => digit = Some(5),
            '六' => digit = Some(6),
            '七' => digit = Some(7),
            '八' => digit = Some(8),
            '九' => digit = Some(9),
            '十' | '百' | '千' => {
                let unit = match c {
                    '十' => 10,
                    '百' => 100,
                    _ => 1000,
                };
                // A bare 十 at the start means 10.
                section += digit.take().unwrap_or(1) * unit;
            }
            '万' => {
                section += digit.take().unwrap_or(0);
                total += section.max(1) * 10_000;
                section = 0;
            }
            _ => return None,
        }
    }
    Some(total + section + digit.unwrap_or(0))
}

/// Removes duplicates.
///
/// Input is first put in TOC order (`order`) so the outcome does not depend
/// on fetch completion order. Chapters sharing a URL keep the better copy (a
/// numbered title first, then the longer body). Chapters whose URLs match
/// once fragments, scheme case and trailing slashes are ignored, and whose
/// normalized titles are identical, keep the longer body. Distinct URLs
/// with the same title are separate chapters. On a tie the earlier entry
/// wins.
#[must_use]
pub fn dedup(mut chapters: Vec<Chapter>) -> Vec<Chapter> {
    chapters.sort_by_key(|chapter| chapter.order);
    let before = chapters.len();
    let mut kept: Vec<Chapter> = Vec::with_capacity(before);
    let mut by_url: HashMap<String, usize> = HashMap::new();

    for chapter in chapters {
        match by_url.get(&chapter.url) {
            Some(&index) => {
                if prefer(&chapter, &kept[index]) {
                    kept[index] = chapter;
                }
            }
            None => {
                by_url.insert(chapter.url.clone(), kept.len());
                kept.push(chapter);
            }
        }
    }

    let mut by_title: HashMap<(String, String), usize> = HashMap::new();
    let mut unique: Vec<Chapter> = Vec::with_capacity(kept.len());
    for chapter in kept {
        let title = normalize_title(&chapter.title);
        if title.is_empty() {
            unique.push(chapter);
            continue;
        }
        let key = (canonical_url(&chapter.url), title);
        match by_title.get(&key) {
            Some(&index) => {
                if chapter.content_chars() > unique[index].content_chars() {
                    unique[index] = chapter;
                }
            }
            None => {
                by_title.insert(key, unique.len());
                unique.push(chapter);
            }
        }
    }

    if unique.len() < before {
        debug!(before, after = unique.len(), "duplicate chapters removed");
    }
    unique
}

fn prefer(candidate: &Chapter, current: &Chapter) -> bool {
    let numbered = |c: &Chapter| chapter_number(&c.title).is_some();
    match (numbered(candidate), numbered(current)) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.content_chars() > current.content_chars(),
    }
}

/// URL identity for title merging: no fragment, lowercase scheme and host,
/// no trailing slash.
fn canonical_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => raw.split('#').next().unwrap_or(raw).trim_end_matches('/').to_string(),
    }
}

fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Orders chapters and assigns dense ordinals `1..=N`.
///
/// Input is first put in TOC order (`order`). When at least 70% of titles
/// carry a chapter number, the set is stably sorted by number; unnumbered
/// chapters inherit the number of the one before them so they stay
/// attached. Otherwise TOC order stands.
#[must_use]
pub fn sort_and_number(mut chapters: Vec<Chapter>) -> Vec<Chapter> {
    chapters.sort_by_key(|chapter| chapter.order);

    let numbers: Vec<Option<u64>> = chapters.iter().map(|c| chapter_number(&c.title)).collect();
    let numbered = numbers.iter().filter(|n| n.is_some()).count();
    if !chapters.is_empty() && numbered * 100 >= chapters.len() * NUMBERED_THRESHOLD_PERCENT {
        let mut previous = 0;
        let keys: Vec<u64> = numbers
            .into_iter()
            .map(|number| {
                previous = number.unwrap_or(previous);
                previous
            })
            .collect();
        let mut keyed: Vec<(u64, Chapter)> = keys.into_iter().zip(chapters).collect();
        keyed.sort_by_key(|(key, _)| *key);
        chapters = keyed.into_iter().map(|(_, chapter)| chapter).collect();
    }

    for (index, chapter) in chapters.iter_mut().enumerate() {
        chapter.order = u32::try_from(index + 1).unwrap_or(u32::MAX);
    }
    chapters
}
