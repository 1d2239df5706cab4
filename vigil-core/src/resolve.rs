//! DNS resolution helpers: pipeline bulk resolution and the two-resolver
//! consensus pair used by verification.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{EngineError, Result};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResolveOutcome {
    Resolved(Vec<String>),
    NxDomain,
    /// Timeout or server failure; says nothing about the name's existence.
    Error(String),
}

#[derive(Clone, Debug)]
pub struct ResolveResult {
    pub name: String,
    pub outcome: ResolveOutcome,
}

impl ResolveResult {
    pub fn ips(&self) -> &[String] {
        match &self.outcome {
            ResolveOutcome::Resolved(ips) => ips,
            _ => &[],
        }
    }
}

#[derive(Clone)]
pub struct DnsResolver {
    inner: Arc<TokioAsyncResolver>,
}

impl DnsResolver {
    /// Resolver backed by the host's configured nameservers.
    pub fn system() -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| EngineError::DependencyUnreachable(format!("resolver: {e}")))?;
        Ok(Self {
            inner: Arc::new(resolver),
        })
    }

    /// Two resolvers with independent upstreams, for verification consensus.
    pub fn consensus_pair() -> (Self, Self) {
        let mut opts = ResolverOpts::default();
        opts.timeout = std::time::Duration::from_secs(3);
        opts.attempts = 1;
        let cloudflare =
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts.clone());
        let google = TokioAsyncResolver::tokio(ResolverConfig::google(), opts);
        (
            Self {
                inner: Arc::new(cloudflare),
            },
            Self {
                inner: Arc::new(google),
            },
        )
    }

    pub async fn resolve(&self, name: &str) -> ResolveResult {
        match self.inner.lookup_ip(name).await {
            Ok(lookup) => {
                let mut ips: Vec<String> = Vec::new();
                for addr in lookup.iter() {
                    let rendered = addr.to_string();
                    if !ips.contains(&rendered) {
                        ips.push(rendered);
                    }
                }
                if ips.is_empty() {
                    ResolveResult {
                        name: name.to_string(),
                        outcome: ResolveOutcome::NxDomain,
                    }
                } else {
                    ResolveResult {
                        name: name.to_string(),
                        outcome: ResolveOutcome::Resolved(ips),
                    }
                }
            }
            Err(err) => {
                let outcome = match err.kind() {
                    ResolveErrorKind::NoRecordsFound { .. } => ResolveOutcome::NxDomain,
                    ResolveErrorKind::Timeout => ResolveOutcome::Error("TIMEOUT".to_string()),
                    other => ResolveOutcome::Error(format!("{other}")),
                };
                ResolveResult {
                    name: name.to_string(),
                    outcome,
                }
            }
        }
    }

    /// Resolve many names with bounded concurrency, preserving input order.
    pub async fn resolve_many(&self, names: &[String], concurrency: usize) -> Vec<ResolveResult> {
        stream::iter(names.iter().cloned())
            .map(|name| {
                let resolver = self.clone();
                async move { resolver.resolve(&name).await }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}
