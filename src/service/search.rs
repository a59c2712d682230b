//! Merging of per-source search results.

use std::collections::HashSet;

use crate::model::SearchResult;

/// Score bonus for titles containing the keyword verbatim.
const CONTAINS_BONUS: f64 = 1.0;
/// Score for an exact title match.
const EXACT_MATCH: f64 = 3.0;

/// Flattens per-source batches, drops duplicates by normalized
/// (title, author) keeping the first occurrence, ranks by similarity of the
/// title to `keyword` and keeps at most `max_results`.
///
/// Equal scores keep source order.
#[must_use]
pub fn merge_results(batches: Vec<Vec<SearchResult>>, keyword: &str, max_results: usize) -> Vec<SearchResult> {
    let mut seen = HashSet::new();
    let mut merged: Vec<(f64, SearchResult)> = batches
        .into_iter()
        .flatten()
        .filter(|result| {
            let author = result.author.as_deref().map(normalize).unwrap_or_default();
            seen.insert((normalize(&result.title), author))
        })
        .map(|result| (relevance(&result.title, keyword), result))
        .collect();

    merged.sort_by(|(a, _), (b, _)| b.total_cmp(a));
    merged.into_iter().take(max_results).map(|(_, result)| result).collect()
}

/// Similarity of a title to the search keyword. Exact matches rank first,
/// then titles containing the keyword, then Jaro-Winkler similarity.
#[must_use]
pub fn relevance(title: &str, keyword: &str) -> f64 {
    let title = normalize(title);
    let keyword = normalize(keyword);
    if keyword.is_empty() {
        return 0.0;
    }
    if title == keyword {
        return EXACT_MATCH;
    }
    let similarity = strsim::jaro_winkler(&title, &keyword);
    if title.contains(&keyword) {
        CONTAINS_BONUS + similarity
    } else {
        similarity
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
