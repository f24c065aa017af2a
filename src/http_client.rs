use std::sync::OnceLock;
use std::time::Duration;

use reqwest::ClientBuilder;

static BYPASS_HOSTS: OnceLock<Vec<String>> = OnceLock::new();

/// Registers hosts that must be reached directly even when a proxy is set in the
/// environment. Entries starting with `.` match any subdomain. Only the first call wins.
pub fn init_proxy_bypass(hosts: &[String]) {
    let normalized = hosts
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect();
    let _ = BYPASS_HOSTS.set(normalized);
}

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

fn should_bypass_proxy_impl(url: &str, proxy_env_present: bool, hosts: &[String]) -> bool {
    if !proxy_env_present || hosts.is_empty() {
        return false;
    }

    let Ok(u) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = u.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();

    hosts.iter().any(|pattern| {
        if let Some(suffix) = pattern.strip_prefix('.') {
            host == suffix || host.ends_with(pattern.as_str())
        } else {
            host == *pattern
        }
    })
}

pub fn should_bypass_proxy_for_url(url: &str) -> bool {
    let hosts = BYPASS_HOSTS.get().map(|v| v.as_slice()).unwrap_or(&[]);
    should_bypass_proxy_impl(url, has_proxy_env(), hosts)
}

pub fn maybe_disable_proxy(builder: ClientBuilder, url: &str) -> ClientBuilder {
    if should_bypass_proxy_for_url(url) {
        builder.no_proxy()
    } else {
        builder
    }
}

pub fn client_for_url_with_timeout(
    url: &str,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let builder = reqwest::Client::builder().timeout(timeout);
    maybe_disable_proxy(builder, url).build()
}

#[cfg(test)]
mod tests {
    use super::should_bypass_proxy_impl;

    fn hosts() -> Vec<String> {
        vec![".googleapis.com".to_string(), "open.bigmodel.cn".to_string()]
    }

    #[test]
    fn bypass_configured_hosts_when_proxy_env_present() {
        assert!(should_bypass_proxy_impl(
            "https://generativelanguage.googleapis.com/v1beta/models",
            true,
            &hosts()
        ));
        assert!(should_bypass_proxy_impl("https://googleapis.com", true, &hosts()));
        assert!(should_bypass_proxy_impl(
            "https://open.bigmodel.cn/api/paas/v4/chat/completions",
            true,
            &hosts()
        ));
        assert!(!should_bypass_proxy_impl(
            "https://api.openai.com/v1/chat/completions",
            true,
            &hosts()
        ));
    }

    #[test]
    fn do_not_bypass_without_proxy_env() {
        assert!(!should_bypass_proxy_impl(
            "https://generativelanguage.googleapis.com/v1beta/models",
            false,
            &hosts()
        ));
    }
}
