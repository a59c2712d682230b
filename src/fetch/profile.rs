//! Request header profiles.
//!
//! Sites disagree about which encodings and headers they tolerate: some
//! reject requests without a browser `Accept`, some send broken brotli, some
//! stall on compressed responses. The fetch client walks an ordered list of
//! profiles until one gets a usable response.

use crate::user_agent::{BROWSER_USER_AGENT, MOBILE_USER_AGENT, tool_user_agent};

/// One header set used for a request attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestProfile {
    pub name: &'static str,
    pub user_agent: String,
    pub accept: &'static str,
    pub accept_encoding: &'static str,
    pub accept_language: Option<&'static str>,
    /// Whether to send the caller's Referer (some anti-leech checks need it).
    pub send_referer: bool,
}

impl RequestProfile {
    /// Full desktop browser headers with every compression scheme.
    #[must_use]
    pub fn browser() -> Self {
        Self {
            name: "browser",
            user_agent: BROWSER_USER_AGENT.to_string(),
            accept: "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            accept_encoding: "gzip, deflate, br",
            accept_language: Some("zh-CN,zh;q=0.9,en;q=0.8"),
            send_referer: true,
        }
    }

    /// Mobile browser, gzip only.
    #[must_use]
    pub fn compat() -> Self {
        Self {
            name: "compat",
            user_agent: MOBILE_USER_AGENT.to_string(),
            accept: "text/html,*/*;q=0.8",
            accept_encoding: "gzip",
            accept_language: Some("zh-CN,zh;q=0.9"),
            send_referer: true,
        }
    }

    /// Minimal uncompressed request identifying the tool.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            name: "plain",
            user_agent: tool_user_agent(),
            accept: "*/*",
            accept_encoding: "identity",
            accept_language: None,
            send_referer: false,
        }
    }
}

/// The default profile order: browser, compat, plain.
#[must_use]
pub fn default_profiles() -> Vec<RequestProfile> {
    vec![
        RequestProfile::browser(),
        RequestProfile::compat(),
        RequestProfile::plain(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles_are_ordered_and_distinct() {
        let profiles = default_profiles();
        let names: Vec<_> = profiles.iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["browser", "compat", "plain"]);
        assert_ne!(profiles[0].accept_encoding, profiles[2].accept_encoding);
    }

    #[test]
    fn test_plain_profile_skips_referer() {
        assert!(!RequestProfile::plain().send_referer);
        assert_eq!(RequestProfile::plain().accept_encoding, "identity");
    }
}
