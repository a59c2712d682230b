//! Built-in advertisement line patterns.
//!
//! These match boilerplate injected into chapter bodies by aggregator sites:
//! "bookmark this site" pleas, mirror domains, app download prompts and
//! update-speed banners. A line matching any pattern counts as ad text.

use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

const DEFAULT_AD_PATTERNS: &[&str] = &[
    r"(?i)(请|記得|记得)?收藏本站",
    r"(?i)本站(域名|网址|地址)",
    r"(?i)最新(章节|網址|网址).{0,12}(请|请到|访问|訪問)",
    r"(?i)(手机|手機)(用户|用戶|版).{0,10}(阅读|閱讀|访问|訪問)",
    r"(?i)(天才|一秒)(一秒)?记住",
    r"(?i)(请|請)?(大家)?(记住|記住).{0,10}(网址|網址|域名)",
    r"(?i)(笔趣阁|筆趣閣|顶点小说|頂點小說).{0,10}(首发|首發|最快|更新)",
    r"(?i)(加入书签|加入書簽|投推荐票|求月票)",
    r"(?i)下载.{0,6}(app|APP|客户端)",
    r"(?i)(www|m)\s*[.。]\s*[a-z0-9-]+\s*[.。]\s*(com|net|org|cc|la|info)",
    r"(?i)https?://\S+",
    r"(?i)(chapter|content) (error|missing).{0,20}report",
    r"(?i)(read|visit).{0,20}(latest|fastest) (chapter|update)s?",
    r"(?i)please (bookmark|remember) (this|our) (site|website)",
];

static DEFAULT_LIBRARY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DEFAULT_AD_PATTERNS
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some(regex),
            Err(error) => {
                warn!(pattern, %error, "skipping invalid built-in ad pattern");
                None
            }
        })
        .collect()
});

/// The compiled default ad library.
#[must_use]
pub fn default_ad_patterns() -> &'static [Regex] {
    &DEFAULT_LIBRARY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_ad(line: &str) -> bool {
        default_ad_patterns().iter().any(|re| re.is_match(line))
    }

    #[test]
    fn test_library_compiles_completely() {
        assert_eq!(default_ad_patterns().len(), DEFAULT_AD_PATTERNS.len());
    }

    #[test]
    fn test_common_ad_lines_match() {
        assert!(is_ad("请收藏本站：https://www.example.com"));
        assert!(is_ad("天才一秒记住本站地址"));
        assert!(is_ad("手机用户请浏览阅读，更优质的阅读体验"));
        assert!(is_ad("www . biquge . com"));
        assert!(is_ad("Please bookmark this site for the latest chapters"));
    }

    #[test]
    fn test_story_lines_do_not_match() {
        assert!(!is_ad("他抬头望向远处的山峰，心中一片平静。"));
        assert!(!is_ad("The wind carried the smell of rain across the valley."));
    }
}
