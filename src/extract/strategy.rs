//! Ordered strategy chains.
//!
//! A chain is a slice of `(StrategyKind, fn)` pairs. Each function inspects
//! the parsed page and either proposes a candidate or reports no match; the
//! caller-supplied check decides whether a candidate is good enough. The
//! first accepted candidate wins.

use scraper::Html;
use tracing::debug;
use url::Url;

use super::error::{AttemptOutcome, StrategyAttempt, StrategyKind};
use crate::rule::SourceRule;
use crate::validate::{ContentValidator, Verdict};

/// Everything a strategy may look at besides the document.
#[derive(Debug, Clone, Copy)]
pub struct PageContext<'a> {
    pub rule: &'a SourceRule,
    /// Final URL of the page after redirects.
    pub page_url: &'a Url,
    pub validator: &'a ContentValidator,
}

impl PageContext<'_> {
    /// Resolves a link found on this page to an absolute URL.
    #[must_use]
    pub fn resolve(&self, href: &str) -> Option<String> {
        self.rule.resolve_url(href, Some(self.page_url))
    }
}

pub type StrategyFn<T> = fn(&PageContext<'_>, &Html) -> Option<T>;

/// Runs `chain` in order and returns the first candidate `check` accepts,
/// or the record of every attempt when none is.
pub fn run_chain<T>(
    ctx: &PageContext<'_>,
    html: &Html,
    chain: &[(StrategyKind, StrategyFn<T>)],
    check: impl Fn(&T) -> Verdict,
) -> Result<(T, StrategyKind), Vec<StrategyAttempt>> {
    let mut attempts = Vec::with_capacity(chain.len());
    for (kind, strategy) in chain {
        let outcome = match strategy(ctx, html) {
            None => AttemptOutcome::NoMatch,
            Some(candidate) => match check(&candidate) {
                Verdict::Accept => {
                    debug!(source_id = %ctx.rule.id, strategy = %kind, url = %ctx.page_url, "strategy accepted");
                    return Ok((candidate, *kind));
                }
                Verdict::Reject(reason) => AttemptOutcome::Rejected(reason),
            },
        };
        debug!(source_id = %ctx.rule.id, strategy = %kind, ?outcome, "strategy did not produce a result");
        attempts.push(StrategyAttempt {
            strategy: *kind,
            outcome,
        });
    }
    Err(attempts)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rule::{RuleRecord, SourceRule};
    use crate::validate::RejectReason;

    fn rule() -> SourceRule {
        SourceRule::from_record(&RuleRecord {
            id: "t".into(),
            name: "T".into(),
            url: "https://t.example".into(),
            enabled: true,
            ..RuleRecord::default()
        })
        .unwrap()
    }

    fn nothing(_: &PageContext<'_>, _: &Html) -> Option<String> {
        None
    }

    fn short(_: &PageContext<'_>, _: &Html) -> Option<String> {
        Some("x".into())
    }

    fn long(_: &PageContext<'_>, _: &Html) -> Option<String> {
        Some("xxxxxxxx".into())
    }

    #[allow(clippy::ptr_arg)]
    fn at_least_four(text: &String) -> Verdict {
        if text.len() >= 4 {
            Verdict::Accept
        } else {
            Verdict::Reject(RejectReason::TooShort {
                length: text.len(),
                min: 4,
            })
        }
    }

    #[test]
    fn test_first_accepted_candidate_wins() {
        let rule = rule();
        let url = Url::parse("https://t.example/a").unwrap();
        let validator = ContentValidator::default();
        let ctx = PageContext {
            rule: &rule,
            page_url: &url,
            validator: &validator,
        };
        let html = Html::parse_document("<p>x</p>");
        let chain: &[(StrategyKind, StrategyFn<String>)] = &[
            (StrategyKind::PrimarySelectors, nothing),
            (StrategyKind::AlternateSelectors, short),
            (StrategyKind::PatternExtraction, long),
        ];
        let (text, kind) = run_chain(&ctx, &html, chain, at_least_four).unwrap();
        assert_eq!(text, "xxxxxxxx");
        assert_eq!(kind, StrategyKind::PatternExtraction);
    }

    #[test]
    fn test_all_attempts_reported_on_failure() {
        let rule = rule();
        let url = Url::parse("https://t.example/a").unwrap();
        let validator = ContentValidator::default();
        let ctx = PageContext {
            rule: &rule,
            page_url: &url,
            validator: &validator,
        };
        let html = Html::parse_document("");
        let chain: &[(StrategyKind, StrategyFn<String>)] = &[
            (StrategyKind::PrimarySelectors, nothing),
            (StrategyKind::AlternateSelectors, short),
        ];
        let attempts = run_chain(&ctx, &html, chain, at_least_four).unwrap_err();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].outcome, AttemptOutcome::NoMatch);
        assert!(matches!(attempts[1].outcome, AttemptOutcome::Rejected(_)));
    }
}
