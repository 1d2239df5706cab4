//! Canonicalization of user- and scanner-supplied strings.
//!
//! The inventory deduplicates on `(target, kind, normalized)`, so every value
//! must reduce to the same canonical form regardless of which scanner emitted
//! it. Normalizing an already-normalized value is a fixed point.

use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::model::AssetKind;
use crate::scope::ScopePolicy;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum NormalizeError {
    #[error("empty value")]
    Empty,
    #[error("not a valid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("not a valid IP address: {0}")]
    InvalidIp(String),
    #[error("address {0} is loopback or private and the scope does not allow it")]
    PrivateAddress(String),
    #[error("not a valid URL: {0}")]
    InvalidUrl(String),
    #[error("invalid port {0}")]
    InvalidPort(String),
}

static DNS_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("dns name regex")
});

/// Canonicalize a hostname or subdomain: lowercase, trailing dot stripped,
/// any scheme/port/path stripped. Fails when the remainder is not a
/// syntactically valid DNS name.
pub fn normalize_host(raw: &str) -> Result<String, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }

    let mut host = if trimmed.contains("://") {
        let parsed =
            Url::parse(trimmed).map_err(|_| NormalizeError::InvalidDnsName(trimmed.into()))?;
        parsed
            .host_str()
            .ok_or_else(|| NormalizeError::InvalidDnsName(trimmed.into()))?
            .to_string()
    } else {
        let mut h = trimmed.split('/').next().unwrap_or_default().to_string();
        // IPv6 literals arrive bracketed when they carry a port.
        if let Some(stripped) = h.strip_prefix('[') {
            if let Some(end) = stripped.find(']') {
                h = stripped[..end].to_string();
            }
        } else if h.matches(':').count() == 1 {
            h = h.split(':').next().unwrap_or_default().to_string();
        }
        h
    };

    host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(NormalizeError::Empty);
    }
    if host.len() > 253 || !DNS_NAME.is_match(&host) {
        return Err(NormalizeError::InvalidDnsName(host));
    }
    Ok(host)
}

/// Parse and canonicalize an IP address (zero-compressed textual IPv6).
/// Loopback and RFC1918/unique-local space is rejected unless the scope
/// policy explicitly allows private networks.
pub fn normalize_ip(raw: &str, scope: &ScopePolicy) -> Result<String, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    let addr: IpAddr = trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .map_err(|_| NormalizeError::InvalidIp(trimmed.into()))?;

    if is_private(&addr) && !scope.allow_private_networks {
        return Err(NormalizeError::PrivateAddress(addr.to_string()));
    }
    Ok(addr.to_string())
}

pub fn is_ip(raw: &str) -> bool {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
}

fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique local, fe80::/10 link local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Canonicalize a URL: lowercase scheme and host, default port elided, dot
/// segments collapsed, trailing slash dropped except on the bare root.
/// Query and fragment are preserved verbatim.
pub fn normalize_url(raw: &str) -> Result<String, NormalizeError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NormalizeError::Empty);
    }
    // Scanners sometimes emit a bare host; interpret it as http.
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let parsed = Url::parse(&candidate).map_err(|_| NormalizeError::InvalidUrl(trimmed.into()))?;
    if !parsed.has_host() {
        return Err(NormalizeError::InvalidUrl(trimmed.into()));
    }

    let scheme = parsed.scheme().to_ascii_lowercase();
    let host = parsed
        .host_str()
        .ok_or_else(|| NormalizeError::InvalidUrl(trimmed.into()))?
        .to_ascii_lowercase();

    // `Url::port` already elides scheme defaults (:80 / :443).
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    };

    // `Url::parse` has already collapsed dot segments in the path.
    let mut path = parsed.path().to_string();
    if path != "/" && path.ends_with('/') {
        path.pop();
    }

    let mut out = format!("{scheme}://{authority}{path}");
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Ok(out)
}

/// Canonical `(host, port, proto)` triple for a service observation.
pub fn normalize_service(
    host: &str,
    port: u32,
    scope: &ScopePolicy,
) -> Result<(String, u16), NormalizeError> {
    let host = if is_ip(host) {
        normalize_ip(host, scope)?
    } else {
        normalize_host(host)?
    };
    let port: u16 = port
        .try_into()
        .ok()
        .filter(|p: &u16| *p >= 1)
        .ok_or_else(|| NormalizeError::InvalidPort(port.to_string()))?;
    Ok((host, port))
}

/// Normalize a raw value according to the asset kind.
pub fn normalize(kind: AssetKind, raw: &str, scope: &ScopePolicy) -> Result<String, NormalizeError> {
    match kind {
        AssetKind::Subdomain | AssetKind::Host => normalize_host(raw),
        AssetKind::Ip => normalize_ip(raw, scope),
        AssetKind::Url => normalize_url(raw),
    }
}

/// Classify a host string the way scanners hand them back: IP literals are
/// `ip` assets, anything else is a `host`.
pub fn classify_host(normalized: &str) -> AssetKind {
    if is_ip(normalized) {
        AssetKind::Ip
    } else {
        AssetKind::Host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_scope() -> ScopePolicy {
        ScopePolicy::for_root("example.com")
    }

    #[test]
    fn host_strips_scheme_port_and_trailing_dot() {
        assert_eq!(normalize_host("HTTPS://API.Example.COM:8443/x").unwrap(), "api.example.com");
        assert_eq!(normalize_host("www.example.com.").unwrap(), "www.example.com");
        assert_eq!(normalize_host("a.example.com:443").unwrap(), "a.example.com");
    }

    #[test]
    fn host_rejects_invalid_names() {
        assert!(normalize_host("").is_err());
        assert!(normalize_host("exa mple.com").is_err());
        assert!(normalize_host("-bad.example.com").is_err());
        assert!(normalize_host("under_score.example.com").is_err());
    }

    #[test]
    fn ip_canonical_form_compresses_v6() {
        let scope = open_scope();
        assert_eq!(normalize_ip("1.2.3.4", &scope).unwrap(), "1.2.3.4");
        assert_eq!(
            normalize_ip("2001:0db8:0000:0000:0000:0000:0000:0001", &scope).unwrap(),
            "2001:db8::1"
        );
    }

    #[test]
    fn ip_rejects_private_unless_scope_allows() {
        let scope = open_scope();
        assert!(matches!(
            normalize_ip("127.0.0.1", &scope),
            Err(NormalizeError::PrivateAddress(_))
        ));
        assert!(normalize_ip("10.1.2.3", &scope).is_err());

        let mut permissive = open_scope();
        permissive.allow_private_networks = true;
        assert_eq!(normalize_ip("10.1.2.3", &permissive).unwrap(), "10.1.2.3");
    }

    #[test]
    fn url_elides_default_ports_and_keeps_query() {
        assert_eq!(normalize_url("HTTP://Example.com:80/").unwrap(), "http://example.com/");
        assert_eq!(
            normalize_url("https://example.com:443/a/?q=1#frag").unwrap(),
            "https://example.com/a?q=1#frag"
        );
        assert_eq!(
            normalize_url("https://example.com:8443/x/../y/").unwrap(),
            "https://example.com:8443/y"
        );
    }

    #[test]
    fn url_accepts_bare_hosts() {
        assert_eq!(normalize_url("example.com").unwrap(), "http://example.com/");
    }

    #[test]
    fn normalization_is_a_fixed_point() {
        let scope = open_scope();
        for (kind, raw) in [
            (AssetKind::Subdomain, "API.Example.com."),
            (AssetKind::Ip, "2001:0DB8::0001"),
            (AssetKind::Url, "HTTPS://a.Example.com:443/path/?x=Y"),
        ] {
            let once = normalize(kind, raw, &scope).unwrap();
            let twice = normalize(kind, &once, &scope).unwrap();
            assert_eq!(once, twice, "kind {kind:?}");
        }
    }

    #[test]
    fn service_triple_validates_port() {
        let scope = open_scope();
        assert_eq!(
            normalize_service("A.Example.com", 443, &scope).unwrap(),
            ("a.example.com".to_string(), 443)
        );
        assert!(normalize_service("a.example.com", 0, &scope).is_err());
        assert!(normalize_service("a.example.com", 70_000, &scope).is_err());
    }
}
