//! Caller context: who sent the input, and what is known about them.
//!
//! Context is resolved server-side through a [`ContextEnricher`] from the
//! connection metadata, never from anything the client reports about itself.
//! IP reputation comes from an optional pluggable [`IpReputationOracle`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::error::Result;

/// Metadata describing the caller of one request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl ThreatContext {
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Raw connection metadata handed to the enricher
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    /// Peer address of the TCP connection
    #[serde(default)]
    pub connection_ip: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

// ============================================
// IP reputation
// ============================================

/// External threat-IP oracle. Scores are 0 (clean) to 100 (known hostile).
#[async_trait]
pub trait IpReputationOracle: Send + Sync {
    async fn score(&self, ip: &str) -> Result<u8>;
}

/// Fixed list of addresses and IPv4 CIDR ranges with reputation scores
#[derive(Debug, Clone, Default)]
pub struct StaticReputationList {
    exact: HashMap<IpAddr, u8>,
    ranges: Vec<(String, u8)>,
}

impl StaticReputationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(address-or-cidr, score)` pairs; unparsable entries are skipped
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u8)>,
        S: AsRef<str>,
    {
        let mut list = Self::new();
        for (entry, score) in entries {
            list.insert(entry.as_ref(), score);
        }
        list
    }

    pub fn insert(&mut self, entry: &str, score: u8) {
        let score = score.min(100);
        if entry.contains('/') {
            self.ranges.push((entry.to_string(), score));
        } else if let Ok(addr) = IpAddr::from_str(entry) {
            self.exact.insert(addr, score);
        } else {
            warn!("Ignoring invalid reputation entry: {}", entry);
        }
    }

    pub fn lookup(&self, ip: &str) -> u8 {
        let addr = match IpAddr::from_str(ip) {
            Ok(addr) => addr,
            Err(_) => return 0,
        };
        let exact = self.exact.get(&addr).copied().unwrap_or(0);
        let ranged = self
            .ranges
            .iter()
            .filter(|(cidr, _)| ip_in_cidr(&addr, cidr))
            .map(|(_, score)| *score)
            .max()
            .unwrap_or(0);
        exact.max(ranged)
    }
}

#[async_trait]
impl IpReputationOracle for StaticReputationList {
    async fn score(&self, ip: &str) -> Result<u8> {
        Ok(self.lookup(ip))
    }
}

/// IPv4 CIDR membership; IPv6 ranges never match
fn ip_in_cidr(addr: &IpAddr, cidr: &str) -> bool {
    let (network, prefix) = match cidr.split_once('/') {
        Some(parts) => parts,
        None => return false,
    };
    let prefix_len: u32 = match prefix.parse() {
        Ok(p) if p <= 32 => p,
        _ => return false,
    };

    match (addr, IpAddr::from_str(network)) {
        (IpAddr::V4(ip_v4), Ok(IpAddr::V4(net_v4))) => {
            let mask = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
            (u32::from(*ip_v4) & mask) == (u32::from(net_v4) & mask)
        }
        _ => false,
    }
}

// ============================================
// Context enrichment
// ============================================

/// Fills in caller context from server-side request metadata
#[async_trait]
pub trait ContextEnricher: Send + Sync {
    async fn enrich(&self, metadata: &RequestMetadata, context: &mut ThreatContext) -> Result<()>;
}

/// Resolves the client IP from forwarding headers when the peer is a trusted
/// proxy, and the user agent from the `User-Agent` header.
#[derive(Debug, Clone)]
pub struct TrustedProxyEnricher {
    /// Ordered list of headers carrying the client IP
    pub trusted_headers: Vec<String>,
    /// Exact addresses or IPv4 CIDR ranges of trusted proxies
    pub trusted_proxies: Vec<String>,
}

impl Default for TrustedProxyEnricher {
    fn default() -> Self {
        Self {
            trusted_headers: vec![
                "X-Forwarded-For".to_string(),
                "X-Real-IP".to_string(),
                "CF-Connecting-IP".to_string(),
            ],
            trusted_proxies: vec!["127.0.0.1".to_string(), "::1".to_string()],
        }
    }
}

impl TrustedProxyEnricher {
    fn is_trusted_proxy(&self, ip: &str) -> bool {
        let addr = match IpAddr::from_str(ip) {
            Ok(addr) => addr,
            Err(_) => return false,
        };
        self.trusted_proxies.iter().any(|trusted| {
            if trusted.contains('/') {
                ip_in_cidr(&addr, trusted)
            } else {
                IpAddr::from_str(trusted).map(|t| t == addr).unwrap_or(false)
            }
        })
    }

    /// Client IP for this request, if one can be determined
    pub fn resolve_ip(&self, metadata: &RequestMetadata) -> Option<String> {
        let peer = metadata.connection_ip.as_deref().filter(|ip| is_valid_ip(ip));

        if let Some(peer_ip) = peer {
            if !self.is_trusted_proxy(peer_ip) {
                return Some(peer_ip.to_string());
            }
        }

        for header in &self.trusted_headers {
            if let Some(value) = find_header(&metadata.headers, header) {
                let leftmost = value.split(',').next().map(str::trim).unwrap_or_default();
                if is_valid_ip(leftmost) {
                    debug!("Resolved client IP {} from {}", leftmost, header);
                    return Some(leftmost.to_string());
                }
                warn!("Invalid IP in header {}, skipping", header);
            }
        }

        peer.map(str::to_string)
    }
}

#[async_trait]
impl ContextEnricher for TrustedProxyEnricher {
    async fn enrich(&self, metadata: &RequestMetadata, context: &mut ThreatContext) -> Result<()> {
        if let Some(ip) = self.resolve_ip(metadata) {
            context.ip_address = Some(ip);
        }
        if context.user_agent.is_none() {
            context.user_agent = find_header(&metadata.headers, "User-Agent").map(str::to_string);
        }
        Ok(())
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Strict IP validation: no whitespace or control characters
pub fn is_valid_ip(ip: &str) -> bool {
    !ip.chars().any(|c| c.is_control() || c.is_whitespace()) && IpAddr::from_str(ip).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(peer: &str, headers: &[(&str, &str)]) -> RequestMetadata {
        RequestMetadata {
            connection_ip: Some(peer.to_string()),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_static_list_exact_and_cidr() {
        let list = StaticReputationList::from_entries([
            ("203.0.113.7", 90u8),
            ("198.51.100.0/24", 60u8),
        ]);

        assert_eq!(list.score("203.0.113.7").await.unwrap(), 90);
        assert_eq!(list.score("198.51.100.42").await.unwrap(), 60);
        assert_eq!(list.score("192.0.2.1").await.unwrap(), 0);
        assert_eq!(list.score("not-an-ip").await.unwrap(), 0);
    }

    #[test]
    fn test_scores_are_capped() {
        let list = StaticReputationList::from_entries([("10.0.0.1", 250u8)]);
        assert_eq!(list.lookup("10.0.0.1"), 100);
    }

    #[tokio::test]
    async fn test_enricher_uses_forwarded_header_behind_trusted_proxy() {
        let enricher = TrustedProxyEnricher::default();
        let meta = metadata(
            "127.0.0.1",
            &[("x-forwarded-for", "203.0.113.1, 10.0.0.2"), ("User-Agent", "Mozilla/5.0")],
        );

        let mut ctx = ThreatContext::default();
        enricher.enrich(&meta, &mut ctx).await.unwrap();
        assert_eq!(ctx.ip_address.as_deref(), Some("203.0.113.1"));
        assert_eq!(ctx.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_enricher_ignores_headers_from_untrusted_peer() {
        let enricher = TrustedProxyEnricher::default();
        let meta = metadata("1.2.3.4", &[("X-Forwarded-For", "203.0.113.1")]);
        assert_eq!(enricher.resolve_ip(&meta).as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_enricher_rejects_header_injection() {
        let enricher = TrustedProxyEnricher::default();
        let meta = metadata("127.0.0.1", &[("X-Real-IP", "203.0.113.1\r\nX-Evil: 1")]);
        assert_eq!(enricher.resolve_ip(&meta).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_cidr_matching() {
        let addr = IpAddr::from_str("172.16.5.4").unwrap();
        assert!(ip_in_cidr(&addr, "172.16.0.0/12"));
        assert!(!ip_in_cidr(&addr, "10.0.0.0/8"));
        assert!(!ip_in_cidr(&addr, "10.0.0.0/99"));
        assert!(ip_in_cidr(&addr, "0.0.0.0/0"));
    }
}
