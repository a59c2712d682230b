//! Quality gate for extracted text.
//!
//! Every candidate produced by an extraction strategy passes through
//! [`ContentValidator::validate`] before it is accepted. A rejected candidate
//! does not end extraction; the next strategy is tried instead.

mod patterns;

use regex::Regex;
use thiserror::Error;

pub use patterns::default_ad_patterns;

/// Share of ad-line characters above which a candidate is rejected.
pub const DEFAULT_MAX_AD_RATIO: f64 = 0.30;
/// Fewest paragraphs an accepted chapter body may have.
pub const DEFAULT_MIN_PARAGRAPHS: usize = 2;

const MAX_TITLE_CHARS: usize = 200;
const MOJIBAKE_MARKERS: &[&str] = &["锟斤拷", "烫烫烫", "屯屯屯", "ï¿½"];
const LATIN1_MOJIBAKE_THRESHOLD: usize = 3;
/// Share of garbled paragraphs above which a body is rejected.
const MAX_GARBLED_LINE_RATIO: f64 = 0.30;

/// Why a candidate was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectReason {
    #[error("empty")]
    Empty,

    #[error("too short ({length} < {min} characters)")]
    TooShort { length: usize, min: usize },

    #[error("too ad-heavy ({:.0}% ad lines)", .ratio * 100.0)]
    TooAdHeavy { ratio: f64 },

    #[error("too few paragraphs ({count})")]
    TooFewParagraphs { count: usize },

    #[error("garbled text")]
    Garbled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(RejectReason),
}

impl Verdict {
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Scores, accepts or rejects, and cleans extracted text.
#[derive(Debug, Clone)]
pub struct ContentValidator {
    max_ad_ratio: f64,
    min_paragraphs: usize,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AD_RATIO, DEFAULT_MIN_PARAGRAPHS)
    }
}

impl ContentValidator {
    #[must_use]
    pub fn new(max_ad_ratio: f64, min_paragraphs: usize) -> Self {
        Self {
            max_ad_ratio: max_ad_ratio.clamp(0.0, 1.0),
            min_paragraphs,
        }
    }

    /// Quality score in `[0, 1]`; higher is better.
    ///
    /// Weighs ad coverage, share of meaningful characters, paragraph count
    /// and punctuation density.
    #[must_use]
    pub fn score(&self, text: &str) -> f64 {
        if text_length(text) == 0 {
            return 0.0;
        }
        let ad = 1.0 - ad_ratio(text, &[]);
        let meaningful = meaningful_ratio(text);
        #[allow(clippy::cast_precision_loss)]
        let paragraphs = (paragraph_count(text) as f64 / 5.0).min(1.0);
        let punctuation = punctuation_score(punctuation_density(text));
        let score = 0.4 * ad + 0.3 * meaningful + 0.2 * paragraphs + 0.1 * punctuation;
        if is_garbled_body(text) {
            score * 0.25
        } else {
            score.clamp(0.0, 1.0)
        }
    }

    /// Accepts or rejects a candidate against the default ad library.
    #[must_use]
    pub fn validate(&self, text: &str, min_length: usize) -> Verdict {
        self.validate_with(text, min_length, &[])
    }

    /// Like [`Self::validate`], also counting lines matched by `extra` as ads.
    #[must_use]
    pub fn validate_with(&self, text: &str, min_length: usize, extra: &[Regex]) -> Verdict {
        let length = text_length(text);
        if length == 0 {
            return Verdict::Reject(RejectReason::Empty);
        }
        if is_garbled_body(text) {
            return Verdict::Reject(RejectReason::Garbled);
        }
        if length < min_length {
            return Verdict::Reject(RejectReason::TooShort {
                length,
                min: min_length,
            });
        }
        let ratio = ad_ratio(text, extra);
        if ratio > self.max_ad_ratio {
            return Verdict::Reject(RejectReason::TooAdHeavy { ratio });
        }
        let count = paragraph_count(text);
        if count < self.min_paragraphs {
            return Verdict::Reject(RejectReason::TooFewParagraphs { count });
        }
        Verdict::Accept
    }

    /// A usable title: non-empty, bounded, not garbled, with at least one
    /// meaningful character.
    #[must_use]
    pub fn validate_title(&self, title: &str) -> bool {
        let title = title.trim();
        !title.is_empty()
            && title.chars().count() <= MAX_TITLE_CHARS
            && !is_garbled(title)
            && title.chars().any(is_meaningful)
    }

    /// Drops ad lines (default library plus `extra`), trims each paragraph
    /// and collapses blank runs.
    #[must_use]
    pub fn clean(&self, text: &str, extra: &[Regex]) -> String {
        text.lines()
            .map(trim_paragraph)
            .filter(|line| !line.is_empty() && !is_ad_line(line, extra))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Characters excluding whitespace.
#[must_use]
pub fn text_length(text: &str) -> usize {
    text.chars().filter(|c| !is_blank(*c)).count()
}

/// Replacement characters, `???` runs, stray control characters or
/// well-known mojibake sequences.
#[must_use]
pub fn is_garbled(text: &str) -> bool {
    if text.contains('\u{FFFD}') || text.contains("???") {
        return true;
    }
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return true;
    }
    if MOJIBAKE_MARKERS.iter().any(|marker| text.contains(marker)) {
        return true;
    }
    latin1_mojibake_count(text) >= LATIN1_MOJIBAKE_THRESHOLD
}

/// Share of non-empty lines that read as garbled.
///
/// Bodies are judged by density so that one `???` in dialogue does not sink
/// a whole chapter; titles and short fields use [`is_garbled`] directly.
#[must_use]
pub fn garbled_line_ratio(text: &str) -> f64 {
    let (lines, garbled) = text
        .lines()
        .map(trim_paragraph)
        .filter(|line| !line.is_empty())
        .fold((0usize, 0usize), |(lines, garbled), line| {
            (lines + 1, garbled + usize::from(is_garbled(line)))
        });
    if lines == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let ratio = garbled as f64 / lines as f64;
    ratio
}

/// A body whose garbled paragraphs exceed the tolerated share.
#[must_use]
pub fn is_garbled_body(text: &str) -> bool {
    garbled_line_ratio(text) > MAX_GARBLED_LINE_RATIO
}

/// UTF-8 read as Latin-1 shows up as `Ã`/`Â` followed by a C1-range char.
fn latin1_mojibake_count(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    chars
        .windows(2)
        .filter(|pair| matches!(pair[0], 'Ã' | 'Â') && ('\u{80}'..='\u{bf}').contains(&pair[1]))
        .count()
        + text.matches("ÃÃ").count()
}

fn is_blank(c: char) -> bool {
    c.is_whitespace() || c == '\u{3000}'
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4e00}'..='\u{9fff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{f900}'..='\u{faff}'
        | '\u{3040}'..='\u{30ff}'
        | '\u{ac00}'..='\u{d7af}')
}

fn is_meaningful(c: char) -> bool {
    c.is_alphanumeric() || is_cjk(c)
}

fn trim_paragraph(line: &str) -> &str {
    line.trim_matches(is_blank)
}

fn is_ad_line(line: &str, extra: &[Regex]) -> bool {
    default_ad_patterns()
        .iter()
        .chain(extra)
        .any(|pattern| pattern.is_match(line))
}

/// Share of non-blank characters sitting on ad lines.
#[must_use]
pub fn ad_ratio(text: &str, extra: &[Regex]) -> f64 {
    let total = text_length(text);
    if total == 0 {
        return 0.0;
    }
    let ad: usize = text
        .lines()
        .filter(|line| is_ad_line(line, extra))
        .map(text_length)
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let ratio = ad as f64 / total as f64;
    ratio
}

#[allow(clippy::cast_precision_loss)]
fn meaningful_ratio(text: &str) -> f64 {
    let total = text_length(text);
    if total == 0 {
        return 0.0;
    }
    text.chars().filter(|c| is_meaningful(*c)).count() as f64 / total as f64
}

/// Non-empty lines.
#[must_use]
pub fn paragraph_count(text: &str) -> usize {
    text.lines().filter(|line| !trim_paragraph(line).is_empty()).count()
}

#[allow(clippy::cast_precision_loss)]
fn punctuation_density(text: &str) -> f64 {
    let total = text_length(text);
    if total == 0 {
        return 0.0;
    }
    let punctuation = text
        .chars()
        .filter(|c| c.is_ascii_punctuation() || "，。！？；：“”‘’、…—《》（）".contains(*c))
        .count();
    punctuation as f64 / total as f64
}

/// Prose sits around 2-20% punctuation; far outside that reads as lists,
/// navigation or noise.
fn punctuation_score(density: f64) -> f64 {
    if (0.02..=0.20).contains(&density) {
        1.0
    } else if density < 0.02 {
        density / 0.02
    } else {
        (1.0 - (density - 0.20) * 2.0).max(0.0)
    }
}
