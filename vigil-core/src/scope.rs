//! Scope enforcement: every scan target string is authorized against the
//! owning target's allow-lists before any work happens.
//!
//! The policy is closed-world: a candidate is allowed iff at least one entry
//! matches. Domain entries are exact label-tail suffixes (`a.b.c` matches
//! suffix `b.c`, never `bc`); there are no wildcards and no deny rules.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use url::Url;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::AssetKind;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopePolicy {
    pub root_domain: String,
    /// Exact tail-match DNS suffixes.
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// CIDR blocks, e.g. "198.51.100.0/24".
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    /// Literal URL prefixes.
    #[serde(default)]
    pub allowed_url_prefixes: Vec<String>,
    #[serde(default = "ScopePolicy::default_max_hosts")]
    pub max_hosts: usize,
    #[serde(default = "ScopePolicy::default_max_http_targets")]
    pub max_http_targets: usize,
    /// Optional downward override of the per-target concurrency cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_jobs: Option<i64>,
    /// Permit loopback/RFC1918 targets (lab engagements).
    #[serde(default)]
    pub allow_private_networks: bool,
}

impl ScopePolicy {
    const fn default_max_hosts() -> usize {
        50
    }

    const fn default_max_http_targets() -> usize {
        200
    }

    /// Minimal policy for a root domain: the root suffix covers the root and
    /// every subdomain via tail matching.
    pub fn for_root(root_domain: &str) -> Self {
        Self {
            root_domain: root_domain.to_string(),
            allowed_domains: vec![root_domain.to_string()],
            allowed_cidrs: Vec::new(),
            allowed_url_prefixes: Vec::new(),
            max_hosts: Self::default_max_hosts(),
            max_http_targets: Self::default_max_http_targets(),
            max_concurrent_jobs: None,
            allow_private_networks: false,
        }
    }

    /// Deserialize a stored scope JSON, filling defaults from the root domain.
    pub fn from_json(value: &Value, root_domain: &str) -> Self {
        let mut policy: ScopePolicy = serde_json::from_value(value.clone())
            .unwrap_or_else(|_| Self::for_root(root_domain));
        if policy.root_domain.is_empty() {
            policy.root_domain = root_domain.to_string();
        }
        if policy.allowed_domains.is_empty() {
            policy.allowed_domains = vec![policy.root_domain.clone()];
        }
        policy
    }

    pub fn domain_allowed(&self, host: &str) -> bool {
        let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains.iter().any(|suffix| {
            let suffix = suffix.trim().trim_end_matches('.').to_ascii_lowercase();
            !suffix.is_empty() && (host == suffix || host.ends_with(&format!(".{suffix}")))
        })
    }

    pub fn ip_allowed(&self, addr: &IpAddr) -> bool {
        self.allowed_cidrs.iter().any(|cidr| {
            cidr.parse::<IpNet>()
                .map(|net| net.contains(addr))
                .unwrap_or(false)
        })
    }

    pub fn url_allowed(&self, url: &str) -> bool {
        if self
            .allowed_url_prefixes
            .iter()
            .any(|prefix| !prefix.is_empty() && url.starts_with(prefix.as_str()))
        {
            return true;
        }
        // Fall back to the host check.
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        match parsed.host_str() {
            Some(host) => match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
                Ok(addr) => self.ip_allowed(&addr),
                Err(_) => self.domain_allowed(host),
            },
            None => false,
        }
    }

    /// Pure policy decision for one candidate string.
    pub fn decide(&self, candidate: &str, kind: AssetKind) -> ScopeDecision {
        let allowed = match kind {
            AssetKind::Subdomain | AssetKind::Host => self.domain_allowed(candidate),
            AssetKind::Ip => candidate
                .parse::<IpAddr>()
                .map(|addr| self.ip_allowed(&addr))
                .unwrap_or(false),
            AssetKind::Url => self.url_allowed(candidate),
        };
        if allowed {
            ScopeDecision::allow("matched_allow_list")
        } else {
            ScopeDecision::deny(match kind {
                AssetKind::Subdomain | AssetKind::Host => "no_domain_suffix_match",
                AssetKind::Ip => "no_cidr_match",
                AssetKind::Url => "no_url_prefix_or_host_match",
            })
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScopeDecision {
    pub allowed: bool,
    pub reason: &'static str,
}

impl ScopeDecision {
    fn allow(reason: &'static str) -> Self {
        Self { allowed: true, reason }
    }

    fn deny(reason: &'static str) -> Self {
        Self { allowed: false, reason }
    }
}

/// Database-aware enforcer. When a policy lists no CIDRs at all, IP
/// candidates are admitted only if the inventory proves they were resolved
/// from an in-scope name this engagement. The moment an operator populates
/// `allowed_cidrs`, those entries are the whole IP scope and nothing else is
/// admitted.
#[derive(Clone)]
pub struct ScopeEnforcer {
    pool: PgPool,
}

impl ScopeEnforcer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn authorize(
        &self,
        target_id: Uuid,
        policy: &ScopePolicy,
        candidate: &str,
        kind: AssetKind,
    ) -> Result<()> {
        let decision = policy.decide(candidate, kind);
        if decision.allowed {
            return Ok(());
        }

        if kind == AssetKind::Ip
            && policy.allowed_cidrs.is_empty()
            && self.resolved_from_in_scope(target_id, candidate).await?
        {
            return Ok(());
        }

        Err(EngineError::ScopeDenied {
            candidate: candidate.to_string(),
            reason: decision.reason.to_string(),
        })
    }

    async fn resolved_from_in_scope(&self, target_id: Uuid, ip: &str) -> Result<bool> {
        let exists: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1
            FROM edges e
            JOIN assets ip ON ip.id = e.to_asset_id
            JOIN assets src ON src.id = e.from_asset_id
            WHERE e.target_id = $1
              AND e.rel_type = 'resolves_to'
              AND ip.kind = 'ip'
              AND ip.normalized = $2
              AND src.kind IN ('subdomain', 'host')
            LIMIT 1
            "#,
        )
        .bind(target_id)
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ScopePolicy {
        let mut p = ScopePolicy::for_root("example.com");
        p.allowed_cidrs = vec!["198.51.100.0/24".to_string()];
        p.allowed_url_prefixes = vec!["https://portal.example.net/app".to_string()];
        p
    }

    #[test]
    fn suffix_match_is_label_exact() {
        let p = policy();
        assert!(p.domain_allowed("example.com"));
        assert!(p.domain_allowed("a.b.example.com"));
        assert!(!p.domain_allowed("notexample.com"));
        assert!(!p.domain_allowed("examplexcom"));
        assert!(!p.domain_allowed("example.com.evil.net"));
    }

    #[test]
    fn cidr_match_gates_ips() {
        let p = policy();
        assert!(p.decide("198.51.100.7", AssetKind::Ip).allowed);
        assert!(!p.decide("8.8.8.8", AssetKind::Ip).allowed);
        assert!(!p.decide("not-an-ip", AssetKind::Ip).allowed);
    }

    #[test]
    fn url_prefix_or_host_fallback() {
        let p = policy();
        assert!(p.decide("https://portal.example.net/app/login", AssetKind::Url).allowed);
        assert!(p.decide("https://api.example.com/v1", AssetKind::Url).allowed);
        assert!(!p.decide("https://portal.example.net/other", AssetKind::Url).allowed);
        assert!(!p.decide("https://evil.org/", AssetKind::Url).allowed);
    }

    #[test]
    fn scope_json_round_trip_fills_defaults() {
        let value = serde_json::json!({
            "root_domain": "example.com",
            "max_concurrent_jobs": 1
        });
        let p = ScopePolicy::from_json(&value, "example.com");
        assert_eq!(p.allowed_domains, vec!["example.com"]);
        assert_eq!(p.max_concurrent_jobs, Some(1));
        assert_eq!(p.max_hosts, 50);
    }
}
