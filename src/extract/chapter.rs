//! Chapter body extraction.
//!
//! Four strategies, in order: the rule's content selectors, common content
//! containers (`#content` and friends), harvesting every `<p>` outside page
//! chrome, and finally the element whose direct paragraphs hold the most
//! text.

use scraper::{ElementRef, Html};

use super::builtin;
use super::error::{StrategyAttempt, StrategyKind};
use super::strategy::{PageContext, StrategyFn, run_chain};
use super::text::{block_text, direct_paragraph_chars, normalize_lines};
use crate::rule::{SelectorList, Target, read_target};
use crate::validate::{RejectReason, Verdict, is_garbled_body, text_length};

const CHAIN: &[(StrategyKind, StrategyFn<String>)] = &[
    (StrategyKind::PrimarySelectors, from_rule),
    (StrategyKind::AlternateSelectors, from_builtin),
    (StrategyKind::PatternExtraction, from_paragraphs),
    (StrategyKind::LargestTextBlock, from_largest_block),
];

/// Containers whose paragraphs are page chrome, not story text.
const CHROME: &[&str] = &["nav", "header", "footer", "aside"];

/// Link texts that mean "next chapter" rather than "next page".
const NEXT_CHAPTER_MARKERS: &[&str] = &["下一章", "下一回", "next chapter"];

/// One page of a chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterPage {
    /// Heading found on the page, if any.
    pub title: Option<String>,
    /// Accepted text, ad lines removed.
    pub content: String,
    /// Continuation page of the same chapter.
    pub next_page: Option<String>,
}

/// Parses one chapter page.
///
/// The first page must pass full content validation against the rule's
/// `minContentLength` and ad patterns. Continuation pages are often short,
/// so they only need to be non-empty and readable.
pub fn parse_chapter_page(
    ctx: &PageContext<'_>,
    body: &str,
    first_page: bool,
) -> Result<ChapterPage, Vec<StrategyAttempt>> {
    let html = Html::parse_document(body);
    let rule = &ctx.rule.chapter;
    let (text, _) = run_chain(ctx, &html, CHAIN, |text| {
        if first_page {
            ctx.validator
                .validate_with(text, rule.min_content_length, &rule.ad_patterns)
        } else if text_length(text) == 0 {
            Verdict::Reject(RejectReason::Empty)
        } else if is_garbled_body(text) {
            Verdict::Reject(RejectReason::Garbled)
        } else {
            Verdict::Accept
        }
    })?;

    let title = builtin::PAGE_TITLE
        .as_ref()
        .and_then(|list| list.first_value(html.root_element()));
    Ok(ChapterPage {
        title,
        content: ctx.validator.clean(&text, &rule.ad_patterns),
        next_page: next_page(ctx, &html),
    })
}

fn next_page(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let (element, selector) = ctx
        .rule
        .chapter
        .next_page
        .as_ref()?
        .select_first(html.root_element())?;
    let label = read_target(element, &Target::Text)
        .unwrap_or_default()
        .to_lowercase();
    if NEXT_CHAPTER_MARKERS.iter().any(|marker| label.contains(marker)) {
        return None;
    }
    let href = match selector.target() {
        Target::Attr(_) => selector.read(element),
        _ => element.value().attr("href").map(str::to_string),
    }?;
    ctx.resolve(&href)
        .filter(|next| next.as_str() != ctx.page_url.as_str())
}

/// Elements stripped by the rule's `removeSelectors`.
fn removed<'a>(ctx: &PageContext<'_>, html: &'a Html) -> Vec<ElementRef<'a>> {
    ctx.rule
        .chapter
        .remove
        .as_ref()
        .map(|list| {
            list.alternatives()
                .iter()
                .flat_map(|alternative| html.select(alternative.selector()))
                .collect()
        })
        .unwrap_or_default()
}

/// Text of the first alternative whose first match yields any text.
fn first_container(list: &SelectorList, html: &Html, removed: &[ElementRef<'_>]) -> Option<String> {
    list.alternatives().iter().find_map(|alternative| {
        let element = html.select(alternative.selector()).next()?;
        let text = match alternative.target() {
            Target::Attr(_) => alternative.read(element)?,
            _ => block_text(element, removed),
        };
        (!text.is_empty()).then_some(text)
    })
}

fn from_rule(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let list = ctx.rule.chapter.content.as_ref()?;
    first_container(list, html, &removed(ctx, html))
}

fn from_builtin(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let list = builtin::CHAPTER_CONTENT.as_ref()?;
    first_container(list, html, &removed(ctx, html))
}

fn in_chrome_or_removed(element: ElementRef<'_>, removed: &[ElementRef<'_>]) -> bool {
    std::iter::once(*element)
        .chain(element.ancestors())
        .any(|node| {
            removed.iter().any(|r| r.id() == node.id())
                || node
                    .value()
                    .as_element()
                    .is_some_and(|e| CHROME.contains(&e.name()))
        })
}

fn from_paragraphs(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let removed = removed(ctx, html);
    let paragraphs: Vec<String> = builtin::PARAGRAPHS
        .as_ref()?
        .select_all(html.root_element())
        .into_iter()
        .filter(|p| !in_chrome_or_removed(*p, &removed))
        .map(|p| block_text(p, &removed))
        .filter(|text| !text.is_empty())
        .collect();
    (paragraphs.len() >= 2).then(|| normalize_lines(&paragraphs.join("\n")))
}

fn from_largest_block(ctx: &PageContext<'_>, html: &Html) -> Option<String> {
    let removed = removed(ctx, html);
    let (best, chars) = builtin::CONTAINERS
        .as_ref()?
        .select_all(html.root_element())
        .into_iter()
        .filter(|element| !in_chrome_or_removed(*element, &removed))
        .map(|element| (element, direct_paragraph_chars(element)))
        .max_by_key(|(_, chars)| *chars)?;
    (chars > 0).then(|| block_text(best, &removed))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use url::Url;

    use super::*;
    use crate::rule::{ChapterRecord, RuleRecord, SourceRule};
    use crate::validate::ContentValidator;

    fn rule(chapter: ChapterRecord) -> SourceRule {
        SourceRule::from_record(&RuleRecord {
            id: "demo".into(),
            name: "Demo".into(),
            url: "https://demo.example".into(),
            enabled: true,
            chapter,
            ..RuleRecord::default()
        })
        .unwrap()
    }

    fn with_ctx<T>(rule: &SourceRule, f: impl FnOnce(&PageContext<'_>) -> T) -> T {
        let url = Url::parse("https://demo.example/book/1/7.html").unwrap();
        let validator = ContentValidator::default();
        let ctx = PageContext {
            rule,
            page_url: &url,
            validator: &validator,
        };
        f(&ctx)
    }

    fn paragraphs(count: usize, chars: usize) -> Vec<String> {
        (0..count)
            .map(|i| format!("{i}{}", "字".repeat(chars - 1)))
            .collect()
    }

    #[test]
    fn test_rule_selector_with_removals() {
        let rule = rule(ChapterRecord {
            content_selectors: vec!["#missing".into(), "#content".into()],
            remove_selectors: vec![".ad".into()],
            ..ChapterRecord::default()
        });
        let body = format!(
            r#"<h1>第七章</h1><div id="content">{}<div class="ad">广告内容</div></div>"#,
            paragraphs(3, 60).join("<br>")
        );
        let page = with_ctx(&rule, |ctx| parse_chapter_page(ctx, &body, true)).unwrap();
        assert_eq!(page.title.as_deref(), Some("第七章"));
        assert_eq!(page.content.lines().count(), 3);
        assert!(!page.content.contains("广告"));
    }

    #[test]
    fn test_builtin_container_fallback() {
        let rule = rule(ChapterRecord {
            content_selectors: vec![".nope".into()],
            ..ChapterRecord::default()
        });
        let body = format!(r#"<div id="chaptercontent">{}</div>"#, paragraphs(4, 40).join("<br>"));
        let page = with_ctx(&rule, |ctx| parse_chapter_page(ctx, &body, true)).unwrap();
        assert_eq!(page.content.lines().count(), 4);
    }

    #[test]
    fn test_largest_paragraph_block_wins() {
        let rule = rule(ChapterRecord::default());
        let story: String = paragraphs(5, 100).iter().map(|p| format!("<p>{p}</p>")).collect();
        let html = Html::parse_document(&format!(
            r#"<div class="side"><p>短</p></div><div class="main">{story}</div>"#
        ));
        let text = with_ctx(&rule, |ctx| from_largest_block(ctx, &html)).unwrap();
        assert_eq!(text.lines().count(), 5);
        assert_eq!(text_length(&text), 500);
    }

    #[test]
    fn test_paragraph_harvest_skips_chrome() {
        let rule = rule(ChapterRecord::default());
        let html = Html::parse_document(
            "<header><p>site header</p></header><section><p>one</p><p>two</p></section>\
             <footer><p>copyright</p></footer>",
        );
        let text = with_ctx(&rule, |ctx| from_paragraphs(ctx, &html)).unwrap();
        assert_eq!(text, "one\ntwo");
    }

    #[test]
    fn test_short_first_page_rejected_by_every_strategy() {
        let rule = rule(ChapterRecord {
            content_selectors: vec!["#content".into()],
            ..ChapterRecord::default()
        });
        let attempts = with_ctx(&rule, |ctx| {
            parse_chapter_page(ctx, r#"<div id="content"><p>太短</p><p>了</p></div>"#, true)
        })
        .unwrap_err();
        assert_eq!(attempts.len(), 4);
    }

    #[test]
    fn test_continuation_page_only_needs_text() {
        let rule = rule(ChapterRecord {
            content_selectors: vec!["#content".into()],
            ..ChapterRecord::default()
        });
        let page = with_ctx(&rule, |ctx| {
            parse_chapter_page(ctx, r#"<div id="content">最后一句。</div>"#, false)
        })
        .unwrap();
        assert_eq!(page.content, "最后一句。");
    }

    #[test]
    fn test_next_page_link_but_not_next_chapter() {
        let rule = rule(ChapterRecord {
            content_selectors: vec!["#content".into()],
            next_page_selector: Some("#next".into()),
            ..ChapterRecord::default()
        });
        let content = paragraphs(3, 60).join("<br>");
        let paged = format!(r#"<div id="content">{content}</div><a id="next" href="7_2.html">下一页</a>"#);
        let page = with_ctx(&rule, |ctx| parse_chapter_page(ctx, &paged, true)).unwrap();
        assert_eq!(page.next_page.as_deref(), Some("https://demo.example/book/1/7_2.html"));

        let last = format!(r#"<div id="content">{content}</div><a id="next" href="8.html">下一章</a>"#);
        let page = with_ctx(&rule, |ctx| parse_chapter_page(ctx, &last, true)).unwrap();
        assert!(page.next_page.is_none());
    }

    #[test]
    fn test_rule_ad_patterns_removed_from_text() {
        let rule = rule(ChapterRecord {
            content_selectors: vec!["#content".into()],
            ad_patterns: vec!["^本章未完".into()],
            ..ChapterRecord::default()
        });
        let mut lines = paragraphs(3, 60);
        lines.push("本章未完，请点击下一页继续阅读".into());
        let body = format!(r#"<div id="content">{}</div>"#, lines.join("<br>"));
        let page = with_ctx(&rule, |ctx| parse_chapter_page(ctx, &body, true)).unwrap();
        assert_eq!(page.content.lines().count(), 3);
    }
}
