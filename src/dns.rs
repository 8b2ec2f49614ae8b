use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use log::warn;

use crate::record::normalize_name;

#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr>;
}

/// Resolver backed by the host's DNS configuration.
pub struct SystemResolver {
    inner: TokioResolver,
}

impl SystemResolver {
    pub fn new() -> Self {
        let inner = match TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                warn!("Failed to load system DNS configuration, falling back to defaults: {e}");
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            }
        };
        Self { inner }
    }

    /// NS host names currently served for `domain`, normalized.
    pub async fn nameservers(&self, domain: &str) -> Result<BTreeSet<String>> {
        let response = self
            .inner
            .ns_lookup(domain)
            .await
            .with_context(|| format!("NS lookup for {} failed", domain))?;
        Ok(response.iter().map(|ns| normalize_name(&ns.to_string())).collect())
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve_ipv4(&self, host: &str) -> Result<Ipv4Addr> {
        let response = self
            .inner
            .ipv4_lookup(host)
            .await
            .with_context(|| format!("A lookup for {} failed", host))?;
        response
            .iter()
            .next()
            .map(|a| a.0)
            .with_context(|| format!("{} has no A records", host))
    }
}

/// Compare an observed NS set against the expected one, ignoring case and
/// trailing dots.
pub fn nameservers_match(current: &BTreeSet<String>, expected: &[String]) -> bool {
    let expected: BTreeSet<String> = expected.iter().map(|n| normalize_name(n)).collect();
    *current == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nameserver_comparison_is_normalized() {
        let current: BTreeSet<String> = ["ns-769.awsdns-32.net", "ns-455.awsdns-56.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let expected = vec![
            "NS-455.awsdns-56.com.".to_string(),
            "ns-769.awsdns-32.net".to_string(),
        ];
        assert!(nameservers_match(&current, &expected));
        assert!(!nameservers_match(&current, &expected[..1]));
    }
}
