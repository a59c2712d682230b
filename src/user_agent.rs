//! User-Agent strings for outgoing requests.

/// Project URL advertised by the tool User-Agent.
const PROJECT_UA_URL: &str = "https://github.com/fierce/harvester";

/// Browser User-Agent for sites that block anything that is not a browser.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Mobile browser User-Agent; many novel sites serve lighter pages to it.
pub(crate) const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 14; Pixel 8) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Mobile Safari/537.36";

/// User-Agent identifying the tool itself.
#[must_use]
pub(crate) fn tool_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (+{PROJECT_UA_URL})")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_user_agent_carries_version_and_url() {
        let ua = tool_user_agent();
        assert!(ua.contains(PROJECT_UA_URL));
        assert_eq!(
            ua.strip_prefix("harvester/").and_then(|s| s.split(' ').next()).unwrap(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_browser_agents_look_like_browsers() {
        assert!(BROWSER_USER_AGENT.starts_with("Mozilla/5.0"));
        assert!(MOBILE_USER_AGENT.contains("Mobile"));
    }
}
