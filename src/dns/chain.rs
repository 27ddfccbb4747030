//! CNAME-chain resolution to authorized addresses.
//!
//! When the deployment trusts a set of edge IPs instead of a single CNAME
//! value, the apex requirement is satisfied by walking the target's CNAME
//! chain until it lands on one of those addresses. The walk is breadth-first
//! per depth, loop-safe, and bounded.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::dns::{normalize_host, RecordResolver};
use crate::error_handling::DnsError;

/// How a chain walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainReason {
    /// The start host resolved straight to an authorized address.
    DirectIpMatch,
    /// An authorized address was reached through one or more CNAMEs.
    AuthorizedIpMatch,
    /// The frontier was still non-empty when the depth bound was hit.
    MaxChainDepthReached,
    /// A host appeared twice in the chain.
    CnameLoopDetected,
    /// The chain terminated without touching an authorized address.
    AuthorizedIpNotFound,
}

impl ChainReason {
    /// Stable snake_case label, as persisted in check results.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainReason::DirectIpMatch => "direct_ip_match",
            ChainReason::AuthorizedIpMatch => "authorized_ip_match",
            ChainReason::MaxChainDepthReached => "max_chain_depth_reached",
            ChainReason::CnameLoopDetected => "cname_loop_detected",
            ChainReason::AuthorizedIpNotFound => "authorized_ip_not_found",
        }
    }
}

/// Outcome of a chain walk.
#[derive(Debug, Clone)]
pub struct ChainWalk {
    /// Whether an authorized address was reached.
    pub ok: bool,
    /// Why the walk ended.
    pub reason: ChainReason,
    /// Hosts walked, in resolution order.
    pub chain: Vec<String>,
    /// Every address resolved along the way.
    pub resolved_ips: Vec<String>,
}

/// Walks the CNAME chain from `start_host`, looking for any of
/// `authorized_ips`.
///
/// Each depth expands the whole current frontier: hosts with CNAME records
/// push their targets onto the next frontier; hosts without are resolved to
/// A/AAAA and checked against the authorized set. Already-visited hosts are
/// skipped and mark the walk as looped. The walk ends as soon as an
/// authorized address appears, when the frontier drains, or when
/// `max_depth` frontier expansions have run.
///
/// Failure reasons are prioritized: depth exhaustion over loop detection
/// over a clean miss.
pub async fn walk_to_authorized_ip(
    resolver: &dyn RecordResolver,
    start_host: &str,
    authorized_ips: &[IpAddr],
    max_depth: usize,
) -> Result<ChainWalk, DnsError> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut chain: Vec<String> = Vec::new();
    let mut resolved_ips: Vec<String> = Vec::new();
    let mut saw_cname = false;
    let mut loop_detected = false;

    let mut frontier = vec![normalize_host(start_host)];
    let mut depth = 0usize;

    while !frontier.is_empty() && depth < max_depth {
        let mut next_frontier = Vec::new();

        for host in frontier {
            if !visited.insert(host.clone()) {
                loop_detected = true;
                continue;
            }
            chain.push(host.clone());

            let cnames = resolver.resolve_cname(&host).await?;
            if !cnames.is_empty() {
                saw_cname = true;
                next_frontier.extend(cnames.into_iter().map(|c| normalize_host(&c)));
                continue;
            }

            let mut ips = resolver.resolve_a4(&host).await?;
            ips.extend(resolver.resolve_a6(&host).await?);
            let mut matched = false;
            for ip in &ips {
                if let Ok(parsed) = ip.parse::<IpAddr>() {
                    if authorized_ips.contains(&parsed) {
                        matched = true;
                    }
                }
            }
            resolved_ips.extend(ips);

            if matched {
                let reason = if saw_cname {
                    ChainReason::AuthorizedIpMatch
                } else {
                    ChainReason::DirectIpMatch
                };
                return Ok(ChainWalk {
                    ok: true,
                    reason,
                    chain,
                    resolved_ips,
                });
            }
        }

        frontier = next_frontier;
        depth += 1;
    }

    let reason = if !frontier.is_empty() {
        ChainReason::MaxChainDepthReached
    } else if loop_detected {
        ChainReason::CnameLoopDetected
    } else {
        ChainReason::AuthorizedIpNotFound
    };

    Ok(ChainWalk {
        ok: false,
        reason,
        chain,
        resolved_ips,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::testing::MockResolver;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|ip| ip.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_direct_ip_match() {
        let resolver = MockResolver::new();
        resolver.a4("good.example", &["1.2.3.4"]);

        let walk = walk_to_authorized_ip(&resolver, "good.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap();
        assert!(walk.ok);
        assert_eq!(walk.reason, ChainReason::DirectIpMatch);
        assert_eq!(walk.chain, vec!["good.example"]);
    }

    #[tokio::test]
    async fn test_authorized_ip_match_through_chain() {
        let resolver = MockResolver::new();
        resolver
            .cname("apex.example", &["cname-a.example"])
            .cname("cname-a.example", &["cname-b.example"])
            .a4("cname-b.example", &["1.2.3.4"]);

        let walk = walk_to_authorized_ip(&resolver, "apex.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap();
        assert!(walk.ok);
        assert_eq!(walk.reason, ChainReason::AuthorizedIpMatch);
        assert_eq!(
            walk.chain,
            vec!["apex.example", "cname-a.example", "cname-b.example"]
        );
        assert_eq!(walk.resolved_ips, vec!["1.2.3.4"]);
    }

    #[tokio::test]
    async fn test_loop_detected() {
        let resolver = MockResolver::new();
        resolver
            .cname("a.example", &["b.example"])
            .cname("b.example", &["a.example"]);

        let walk = walk_to_authorized_ip(&resolver, "a.example", &ips(&["1.2.3.4"]), 10)
            .await
            .unwrap();
        assert!(!walk.ok);
        assert_eq!(walk.reason, ChainReason::CnameLoopDetected);
    }

    #[tokio::test]
    async fn test_max_depth_reached_wins_over_loop() {
        // A chain that both loops and is still expanding at the depth bound
        // reports depth exhaustion; that is the higher-priority reason.
        let resolver = MockResolver::new();
        resolver
            .cname("a.example", &["a.example", "b.example"])
            .cname("b.example", &["c.example"])
            .cname("c.example", &["d.example"])
            .cname("d.example", &["e.example"]);

        let walk = walk_to_authorized_ip(&resolver, "a.example", &ips(&["1.2.3.4"]), 2)
            .await
            .unwrap();
        assert!(!walk.ok);
        assert_eq!(walk.reason, ChainReason::MaxChainDepthReached);
    }

    #[tokio::test]
    async fn test_unauthorized_termination() {
        let resolver = MockResolver::new();
        resolver
            .cname("apex.example", &["edge.example"])
            .a4("edge.example", &["9.9.9.9"]);

        let walk = walk_to_authorized_ip(&resolver, "apex.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap();
        assert!(!walk.ok);
        assert_eq!(walk.reason, ChainReason::AuthorizedIpNotFound);
        assert_eq!(walk.resolved_ips, vec!["9.9.9.9"]);
    }

    #[tokio::test]
    async fn test_no_records_at_all() {
        let resolver = MockResolver::new();
        let walk = walk_to_authorized_ip(&resolver, "empty.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap();
        assert!(!walk.ok);
        assert_eq!(walk.reason, ChainReason::AuthorizedIpNotFound);
        assert!(walk.resolved_ips.is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_match() {
        let resolver = MockResolver::new();
        resolver
            .cname("apex.example", &["edge.example"])
            .a6("edge.example", &["2001:db8::1"]);

        let walk = walk_to_authorized_ip(&resolver, "apex.example", &ips(&["2001:db8::1"]), 5)
            .await
            .unwrap();
        assert!(walk.ok);
        assert_eq!(walk.reason, ChainReason::AuthorizedIpMatch);
    }

    #[tokio::test]
    async fn test_timeout_propagates() {
        let resolver = MockResolver::new();
        resolver.timeout_for("apex.example");

        let err = walk_to_authorized_ip(&resolver, "apex.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_each_host_processed_at_most_once() {
        // Diamond shape: two branches converge on the same tail host. The
        // visited set must keep the tail from resolving twice, which would
        // double its addresses in the snapshot.
        let resolver = MockResolver::new();
        resolver
            .cname("apex.example", &["left.example", "right.example"])
            .cname("left.example", &["tail.example"])
            .cname("right.example", &["tail.example"])
            .a4("tail.example", &["9.9.9.9"]);

        let walk = walk_to_authorized_ip(&resolver, "apex.example", &ips(&["1.2.3.4"]), 5)
            .await
            .unwrap();
        assert_eq!(
            walk.resolved_ips.len(),
            1,
            "converging chains must not duplicate resolution"
        );
    }
}
