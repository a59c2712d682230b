//! Selector sets shared by many novel sites, used when a rule's own
//! selectors find nothing.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::rule::SelectorList;

type Builtin = LazyLock<Option<SelectorList>>;

fn parse(css: &str) -> Option<SelectorList> {
    SelectorList::parse(css)
        .map_err(|(selector, reason)| warn!(%selector, %reason, "invalid built-in selector"))
        .ok()
}

fn pattern(raw: &str) -> Option<Regex> {
    Regex::new(raw)
        .map_err(|error| warn!(pattern = raw, %error, "invalid built-in pattern"))
        .ok()
}

pub static SEARCH_ITEMS: Builtin = LazyLock::new(|| {
    parse(
        ".result-list .result-item, .novelslist2 li, #checkform table tr, table.grid tr, \
         .search-list li, .search-result li, .bookbox, ul.list li",
    )
});
pub static SEARCH_ITEM_TITLE: Builtin =
    LazyLock::new(|| parse("h3 a, .bookname a, .s2 a, .result-game-item-title a, td a, a"));
pub static SEARCH_ITEM_AUTHOR: Builtin =
    LazyLock::new(|| parse(".author, .s4, .result-game-item-info-tag span, td:nth-child(3)"));

pub static PAGE_TITLE: Builtin = LazyLock::new(|| parse("h1, title"));
pub static DETAIL_INTRO: Builtin = LazyLock::new(|| parse("#intro, .intro, .book-intro, .description"));
pub static DETAIL_COVER: Builtin = LazyLock::new(|| parse("#fmimg img@src, .book-img img@src, .cover img@src"));
pub static META: Builtin = LazyLock::new(|| parse("meta[property], meta[name]"));
pub static BODY: Builtin = LazyLock::new(|| parse("body"));

pub static TOC_LINKS: Builtin = LazyLock::new(|| {
    parse(
        "#list dd a, .listmain dd a, #chapterlist li a, .chapter-list li a, #chapters a, \
         .volume-list li a, ul.chapter li a, #at td a, .mulu li a, dl.chapterlist a",
    )
});
pub static ANCHORS: Builtin = LazyLock::new(|| parse("a[href]"));

pub static CHAPTER_CONTENT: Builtin = LazyLock::new(|| {
    parse(
        "#content, #chaptercontent, #booktxt, #htmlContent, #BookText, #txtContent, #nr1, \
         .read-content, .chapter-content, .content, .novel-content, article",
    )
});
pub static PARAGRAPHS: Builtin = LazyLock::new(|| parse("p"));
pub static CONTAINERS: Builtin = LazyLock::new(|| parse("div, article, section, td"));

/// Chapter-like anchor text: `第12章`, `第十二回`, `Chapter 12`.
pub static CHAPTER_TITLE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    pattern(r"(?i)^\s*(第\s*[0-9零〇一二两三四五六七八九十百千万]+\s*[章节回卷集]|chapter\s*\d+)")
});

/// Labelled author text: `作者：某某`, `Author: Someone`.
pub static AUTHOR_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| pattern(r"(?i)(?:作\s*者|author)\s*[：:]\s*([^\s|/　]+)"));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_builtin_parses() {
        for list in [
            &SEARCH_ITEMS,
            &SEARCH_ITEM_TITLE,
            &SEARCH_ITEM_AUTHOR,
            &PAGE_TITLE,
            &DETAIL_INTRO,
            &DETAIL_COVER,
            &META,
            &BODY,
            &TOC_LINKS,
            &ANCHORS,
            &CHAPTER_CONTENT,
            &PARAGRAPHS,
            &CONTAINERS,
        ] {
            assert!(list.is_some());
        }
        assert!(CHAPTER_TITLE.is_some());
        assert!(AUTHOR_LABEL.is_some());
    }

    #[test]
    fn test_chapter_title_pattern() {
        let Some(re) = CHAPTER_TITLE.as_ref() else {
            panic!("pattern failed to compile");
        };
        assert!(re.is_match("第12章 出山"));
        assert!(re.is_match("第一百零三回"));
        assert!(re.is_match("Chapter 7: Return"));
        assert!(!re.is_match("作品相关"));
    }

    #[test]
    fn test_author_label_pattern() {
        let Some(re) = AUTHOR_LABEL.as_ref() else {
            panic!("pattern failed to compile");
        };
        let caps = re.captures("书名：某书 作者：张三 状态：连载").map(|c| c[1].to_string());
        assert_eq!(caps.as_deref(), Some("张三"));
    }
}
