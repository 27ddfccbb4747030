//! DNS resolver facade.
//!
//! A thin typed layer over hickory-resolver with the error policy the
//! validation engine depends on: NXDOMAIN and NODATA come back as empty
//! record lists, timeouts come back as a labeled [`DnsError::Timeout`], and
//! everything else propagates. Callers never see resolver internals.

pub mod chain;

use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;

use crate::config::DnsSettings;
use crate::error_handling::DnsError;

/// One MX record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    /// Exchange host, normalized.
    pub exchange: String,
    /// Preference value; lower wins.
    pub priority: u16,
}

/// Typed, timeout-bounded record resolution.
///
/// The trait is the seam between the validation engine and the network;
/// tests drive the engine with a scripted implementation.
#[async_trait]
pub trait RecordResolver: Send + Sync {
    /// CNAME records for `host`. Empty when none exist.
    async fn resolve_cname(&self, host: &str) -> Result<Vec<String>, DnsError>;

    /// MX records for `host`. Empty when none exist.
    async fn resolve_mx(&self, host: &str) -> Result<Vec<MxRecord>, DnsError>;

    /// TXT records for `host`, each record's rdata chunks concatenated
    /// without separator. Empty when none exist.
    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, DnsError>;

    /// IPv4 addresses for `host`. Empty when none exist.
    async fn resolve_a4(&self, host: &str) -> Result<Vec<String>, DnsError>;

    /// IPv6 addresses for `host`. Empty when none exist.
    async fn resolve_a6(&self, host: &str) -> Result<Vec<String>, DnsError>;
}

/// Lowercases a resolved hostname and strips the trailing dot.
pub fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Lowercases and trims a resolved address.
pub fn normalize_ip(ip: &str) -> String {
    ip.trim().to_ascii_lowercase()
}

/// Production resolver backed by hickory.
pub struct HickoryRecordResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryRecordResolver {
    /// Builds a resolver against the configured nameservers.
    ///
    /// `ndots` is pinned to 0 so search domains are never appended, and the
    /// attempt count is kept low; the polling loop is the retry mechanism,
    /// not the resolver.
    pub fn new(settings: &DnsSettings) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&settings.servers, 53, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);

        let mut opts = ResolverOpts::default();
        opts.timeout = settings.timeout;
        opts.attempts = 2;
        opts.ndots = 0;

        HickoryRecordResolver {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout: settings.timeout,
        }
    }

    /// Bounds a lookup future by the configured timeout and applies the
    /// facade error policy.
    async fn bounded<T, F>(&self, label: String, fut: F) -> Result<Vec<T>, DnsError>
    where
        F: std::future::Future<Output = Result<Vec<T>, ResolveError>> + Send,
        T: Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_elapsed) => Err(DnsError::Timeout { label }),
            Ok(Ok(records)) => Ok(records),
            // Absent names and empty record sets are ordinary answers.
            Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Ok(Vec::new())
            }
            Ok(Err(e)) if matches!(e.kind(), ResolveErrorKind::Timeout) => {
                Err(DnsError::Timeout { label })
            }
            Ok(Err(e)) => Err(DnsError::Resolve { label, source: e }),
        }
    }
}

#[async_trait]
impl RecordResolver for HickoryRecordResolver {
    async fn resolve_cname(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let label = format!("cname:{host}");
        let fut = async {
            let lookup = self.resolver.lookup(host, RecordType::CNAME).await?;
            Ok(lookup
                .iter()
                .filter_map(|rdata| match rdata {
                    RData::CNAME(name) => Some(normalize_host(&name.to_utf8())),
                    _ => None,
                })
                .collect())
        };
        self.bounded(label, fut).await
    }

    async fn resolve_mx(&self, host: &str) -> Result<Vec<MxRecord>, DnsError> {
        let label = format!("mx:{host}");
        let fut = async {
            let lookup = self.resolver.mx_lookup(host).await?;
            Ok(lookup
                .iter()
                .map(|mx| MxRecord {
                    exchange: normalize_host(&mx.exchange().to_utf8()),
                    priority: mx.preference(),
                })
                .collect())
        };
        self.bounded(label, fut).await
    }

    async fn resolve_txt(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let label = format!("txt:{host}");
        let fut = async {
            let lookup = self.resolver.txt_lookup(host).await?;
            Ok(lookup
                .iter()
                .map(|txt| {
                    // One TXT record may arrive as several rdata chunks;
                    // they form a single logical value.
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                        .collect::<String>()
                })
                .collect())
        };
        self.bounded(label, fut).await
    }

    async fn resolve_a4(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let label = format!("a:{host}");
        let fut = async {
            let lookup = self.resolver.ipv4_lookup(host).await?;
            Ok(lookup.iter().map(|a| normalize_ip(&a.to_string())).collect())
        };
        self.bounded(label, fut).await
    }

    async fn resolve_a6(&self, host: &str) -> Result<Vec<String>, DnsError> {
        let label = format!("aaaa:{host}");
        let fut = async {
            let lookup = self.resolver.ipv6_lookup(host).await?;
            Ok(lookup.iter().map(|a| normalize_ip(&a.to_string())).collect())
        };
        self.bounded(label, fut).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("Mail.Example.COM."), "mail.example.com");
        assert_eq!(normalize_host("  edge.example. "), "edge.example");
    }

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip(" 2001:DB8::1 "), "2001:db8::1");
        assert_eq!(normalize_ip("1.2.3.4"), "1.2.3.4");
    }
}
