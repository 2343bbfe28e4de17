//! Admission guard for monitored URLs. Rejects anything that could reach
//! internal infrastructure: non-http(s) schemes, loopback, private ranges,
//! link-local addresses, and the cloud metadata endpoint.

use std::net::IpAddr;
use std::sync::LazyLock;

use ipnet::IpNet;
use url::{Host, Url};

use crate::error::WatcherError;

/// Address ranges a scrape must never reach.
static BLOCKED_CIDRS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",        // unspecified
        "10.0.0.0/8",       // RFC 1918
        "127.0.0.0/8",      // loopback
        "169.254.0.0/16",   // link-local, cloud metadata
        "172.16.0.0/12",    // RFC 1918
        "192.168.0.0/16",   // RFC 1918
        "255.255.255.255/32",
        "::/128",           // IPv6 unspecified
        "::1/128",          // IPv6 loopback
        "fc00::/7",         // IPv6 unique-local
        "fe80::/10",        // IPv6 link-local
    ]
    .into_iter()
    .map(|cidr| cidr.parse().unwrap())
    .collect()
});

/// Parse and vet a user-supplied URL. Returns the parsed URL on success.
/// The check runs once at admission and again immediately before navigation,
/// since DNS may resolve differently by then.
pub fn check_url(raw: &str) -> Result<Url, WatcherError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| WatcherError::SsrfRejected(format!("unparseable URL: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(WatcherError::SsrfRejected(format!(
                "scheme {other:?} is not allowed"
            )))
        }
    }

    match url.host() {
        None => {
            return Err(WatcherError::SsrfRejected(
                "URL has no host".to_string(),
            ))
        }
        Some(Host::Ipv4(ip)) => {
            if ip_is_forbidden(IpAddr::V4(ip)) {
                return Err(WatcherError::SsrfRejected(format!(
                    "address {ip} is in a forbidden range"
                )));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if ip_is_forbidden(IpAddr::V6(ip)) {
                return Err(WatcherError::SsrfRejected(format!(
                    "address {ip} is in a forbidden range"
                )));
            }
        }
        Some(Host::Domain(domain)) => {
            if domain.eq_ignore_ascii_case("localhost") || domain.ends_with(".localhost") {
                return Err(WatcherError::SsrfRejected(
                    "localhost is not allowed".to_string(),
                ));
            }
        }
    }

    Ok(url)
}

/// True when an address falls in a blocked range. IPv4-mapped IPv6
/// addresses are checked against the IPv4 rules.
pub fn ip_is_forbidden(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    BLOCKED_CIDRS.iter().any(|cidr| cidr.contains(&ip))
}

/// Resolve the URL's host and re-check every address it maps to. Run right
/// before navigation so a DNS rebind between admission and scrape is caught.
pub async fn resolve_and_check(url: &Url) -> Result<(), WatcherError> {
    let host = url
        .host_str()
        .ok_or_else(|| WatcherError::SsrfRejected("URL has no host".to_string()))?;

    // Literal addresses were already vetted by check_url.
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| WatcherError::SsrfRejected(format!("host {host} did not resolve: {e}")))?;

    for addr in addrs {
        if ip_is_forbidden(addr.ip()) {
            return Err(WatcherError::SsrfRejected(format!(
                "host {host} resolves to forbidden address {}",
                addr.ip()
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(raw: &str) -> bool {
        matches!(check_url(raw), Err(WatcherError::SsrfRejected(_)))
    }

    #[test]
    fn rejects_loopback() {
        assert!(rejected("http://127.0.0.1"));
        assert!(rejected("http://localhost:8080/admin"));
        assert!(rejected("http://[::1]/"));
    }

    #[test]
    fn rejects_private_ranges() {
        assert!(rejected("http://10.0.0.1"));
        assert!(rejected("http://172.16.0.1/internal"));
        assert!(rejected("http://192.168.1.1"));
    }

    #[test]
    fn rejects_metadata_endpoint() {
        assert!(rejected("http://169.254.169.254/latest/meta-data/"));
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(rejected("file:///etc/passwd"));
        assert!(rejected("javascript:alert(1)"));
        assert!(rejected("ftp://example.com/file"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(rejected("not a url"));
        assert!(rejected(""));
    }

    #[test]
    fn accepts_public_urls() {
        assert!(check_url("https://example.com/status").is_ok());
        assert!(check_url("http://news.ycombinator.com").is_ok());
        assert!(check_url("  https://example.com/padded  ").is_ok());
    }

    #[test]
    fn forbidden_ranges_cover_v6_blocks() {
        assert!(ip_is_forbidden("fe80::1".parse().unwrap()));
        assert!(ip_is_forbidden("fc00::1".parse().unwrap()));
        assert!(ip_is_forbidden("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!ip_is_forbidden("2606:4700::6810:85e5".parse().unwrap()));
    }
}
