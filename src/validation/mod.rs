//! DNS validation engine.
//!
//! Resolves the fixed record set for a target and compares it against the
//! configured expected profile. The output is a [`CheckOutcome`]: the
//! overall verdict, one [`MissingEntry`] per requirement, and a sanitized
//! snapshot of everything that was resolved.

pub mod payload;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{DnsSettings, ExpectedProfile};
use crate::dns::chain::{walk_to_authorized_ip, ChainWalk};
use crate::dns::{normalize_host, MxRecord, RecordResolver};
use crate::error_handling::DnsError;
use crate::sanitize::{cap_values, forensic_hash, sanitize_hostname, sanitize_text, truncate_chars};

/// The five requirements a target must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKey {
    /// Apex CNAME (or chain-to-authorized-IP when configured).
    Cname,
    /// Apex MX.
    Mx,
    /// SPF TXT at the apex.
    Spf,
    /// DMARC TXT at `_dmarc.{apex}`.
    Dmarc,
    /// DKIM CNAME at `{selector}._domainkey.{apex}`.
    Dkim,
}

impl CheckKey {
    /// Requirement keys in report order.
    pub const ORDERED: [CheckKey; 5] = [
        CheckKey::Cname,
        CheckKey::Mx,
        CheckKey::Spf,
        CheckKey::Dmarc,
        CheckKey::Dkim,
    ];

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKey::Cname => "cname",
            CheckKey::Mx => "mx",
            CheckKey::Spf => "spf",
            CheckKey::Dmarc => "dmarc",
            CheckKey::Dkim => "dkim",
        }
    }

    /// DNS record type consulted for this requirement.
    pub fn record_type(&self) -> &'static str {
        match self {
            CheckKey::Cname | CheckKey::Dkim => "CNAME",
            CheckKey::Mx => "MX",
            CheckKey::Spf | CheckKey::Dmarc => "TXT",
        }
    }

    /// The DNS name queried for this requirement on `apex`.
    pub fn checked_name(&self, apex: &str, dkim_selector: &str) -> String {
        match self {
            CheckKey::Cname | CheckKey::Mx | CheckKey::Spf => apex.to_string(),
            CheckKey::Dmarc => format!("_dmarc.{apex}"),
            CheckKey::Dkim => format!("{dkim_selector}._domainkey.{apex}"),
        }
    }

    /// Expected value for this requirement, rendered for reports.
    pub fn expected_display(&self, profile: &ExpectedProfile) -> String {
        match self {
            CheckKey::Cname => profile.ui_cname.clone(),
            CheckKey::Mx => format!("{} (priority {})", profile.mx_host, profile.mx_priority),
            CheckKey::Spf => profile.spf.clone(),
            CheckKey::Dmarc => profile.dmarc.clone(),
            CheckKey::Dkim => profile.dkim_cname.clone(),
        }
    }
}

/// Per-requirement verdict: what was expected, what was found, whether the
/// requirement is met.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingEntry {
    /// Requirement key (`cname`, `mx`, `spf`, `dmarc`, `dkim`).
    pub key: CheckKey,
    /// DNS record type consulted.
    #[serde(rename = "type", default)]
    pub record_type: String,
    /// DNS name that was queried.
    #[serde(default)]
    pub name: String,
    /// Expected value.
    #[serde(default)]
    pub expected: String,
    /// Values found, sanitized and bounded.
    #[serde(default)]
    pub found: Vec<String>,
    /// Whether the requirement is satisfied.
    #[serde(default)]
    pub ok: bool,
    /// Whether `found` was shortened by caps or per-value truncation.
    #[serde(default)]
    pub found_truncated: bool,
    /// Authorized addresses, present on the CNAME entry in chain mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_ips: Option<Vec<String>>,
    /// Addresses the chain walk resolved, present in chain mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_ips: Option<Vec<String>>,
    /// Why the chain walk ended, present in chain mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_reason: Option<String>,
}

/// One resolved record list in the snapshot, bounded for storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotList {
    /// Retained values.
    pub values: Vec<String>,
    /// Count before capping.
    pub total: usize,
    /// Whether capping or per-value truncation dropped data.
    pub truncated: bool,
    /// SHA-256 of the pre-truncation originals, present iff `truncated`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Sanitized record of everything resolved during one check cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// CNAME records at the apex.
    pub cname_apex: SnapshotList,
    /// CNAME records at the DKIM name.
    pub cname_dkim: SnapshotList,
    /// MX records at the apex, rendered as `exchange (priority n)`.
    pub mx: SnapshotList,
    /// TXT records at the apex.
    pub txt_apex: SnapshotList,
    /// TXT records at the DMARC name.
    pub txt_dmarc: SnapshotList,
}

/// Result of validating one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// True iff every requirement is satisfied.
    pub ok: bool,
    /// One verdict per requirement, in [`CheckKey::ORDERED`] order.
    pub missing: Vec<MissingEntry>,
    /// Sanitized resolved values.
    pub snapshot: Snapshot,
}

/// Normalizes an SPF/DMARC policy string for comparison: whitespace runs
/// collapsed, trimmed, lowercased.
pub fn normalize_policy(value: &str) -> String {
    sanitize_text(value).to_lowercase()
}

/// The validation engine. Holds the resolver, the expected profile, and the
/// snapshot bounds.
pub struct Validator {
    resolver: Arc<dyn RecordResolver>,
    profile: ExpectedProfile,
    dns: DnsSettings,
}

impl Validator {
    /// Creates an engine over the given resolver and profile.
    pub fn new(resolver: Arc<dyn RecordResolver>, profile: ExpectedProfile, dns: DnsSettings) -> Self {
        Validator {
            resolver,
            profile,
            dns,
        }
    }

    /// The configured expected profile.
    pub fn profile(&self) -> &ExpectedProfile {
        &self.profile
    }

    /// Builds the synthetic per-requirement report used when no resolved
    /// data is available: expected values, nothing found, nothing ok.
    pub fn fallback_missing(&self, target: &str) -> Vec<MissingEntry> {
        let apex = normalize_host(target);
        CheckKey::ORDERED
            .iter()
            .map(|key| {
                let mut entry = MissingEntry {
                    key: *key,
                    record_type: key.record_type().to_string(),
                    name: key.checked_name(&apex, &self.profile.dkim_selector),
                    expected: key.expected_display(&self.profile),
                    found: Vec::new(),
                    ok: false,
                    found_truncated: false,
                    expected_ips: None,
                    found_ips: None,
                    chain_reason: None,
                };
                if *key == CheckKey::Cname && !self.profile.ui_cname_authorized_ips.is_empty() {
                    entry.expected_ips = Some(
                        self.profile
                            .ui_cname_authorized_ips
                            .iter()
                            .map(|ip| ip.to_string())
                            .collect(),
                    );
                }
                entry
            })
            .collect()
    }

    /// Runs the full record comparison for `target`.
    ///
    /// Resolution order does not affect the verdict; lookups run in
    /// sequence so a single slow nameserver cannot amplify load.
    pub async fn check_target(&self, target: &str) -> Result<CheckOutcome, DnsError> {
        let apex = normalize_host(target);
        let dmarc_name = CheckKey::Dmarc.checked_name(&apex, &self.profile.dkim_selector);
        let dkim_name = CheckKey::Dkim.checked_name(&apex, &self.profile.dkim_selector);

        let cname_apex = self.resolver.resolve_cname(&apex).await?;
        let cname_dkim = self.resolver.resolve_cname(&dkim_name).await?;
        let mx = self.resolver.resolve_mx(&apex).await?;
        let txt_apex = self.resolver.resolve_txt(&apex).await?;
        let txt_dmarc = self.resolver.resolve_txt(&dmarc_name).await?;

        // CNAME: chain mode supplants the equality check entirely.
        let chain_walk = if self.profile.ui_cname_authorized_ips.is_empty() {
            None
        } else {
            Some(
                walk_to_authorized_ip(
                    self.resolver.as_ref(),
                    &apex,
                    &self.profile.ui_cname_authorized_ips,
                    self.profile.ui_cname_max_chain_depth,
                )
                .await?,
            )
        };
        let cname_ok = match &chain_walk {
            Some(walk) => walk.ok,
            None => cname_apex
                .iter()
                .any(|c| normalize_host(c) == self.profile.ui_cname),
        };

        let mx_ok = mx.iter().any(|record| {
            normalize_host(&record.exchange) == self.profile.mx_host
                && record.priority == self.profile.mx_priority
        });

        let expected_spf = normalize_policy(&self.profile.spf);
        let spf_ok = txt_apex.iter().any(|txt| normalize_policy(txt) == expected_spf);

        let expected_dmarc = normalize_policy(&self.profile.dmarc);
        let dmarc_ok = txt_dmarc
            .iter()
            .any(|txt| normalize_policy(txt) == expected_dmarc);

        let dkim_ok = cname_dkim
            .iter()
            .any(|c| normalize_host(c) == self.profile.dkim_cname);

        let ok = cname_ok && mx_ok && spf_ok && dmarc_ok && dkim_ok;

        let mx_display: Vec<String> = mx
            .iter()
            .map(|record| format!("{} (priority {})", record.exchange, record.priority))
            .collect();

        let missing = self.build_missing(
            &apex,
            [cname_ok, mx_ok, spf_ok, dmarc_ok, dkim_ok],
            &cname_apex,
            &mx_display,
            &txt_apex,
            &txt_dmarc,
            &cname_dkim,
            chain_walk.as_ref(),
        );

        let snapshot = Snapshot {
            cname_apex: self.snapshot_hosts(&cname_apex),
            cname_dkim: self.snapshot_hosts(&cname_dkim),
            mx: self.snapshot_hosts(&mx_display),
            txt_apex: self.snapshot_txt(&txt_apex),
            txt_dmarc: self.snapshot_txt(&txt_dmarc),
        };

        Ok(CheckOutcome {
            ok,
            missing,
            snapshot,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_missing(
        &self,
        apex: &str,
        verdicts: [bool; 5],
        cname_apex: &[String],
        mx_display: &[String],
        txt_apex: &[String],
        txt_dmarc: &[String],
        cname_dkim: &[String],
        chain_walk: Option<&ChainWalk>,
    ) -> Vec<MissingEntry> {
        CheckKey::ORDERED
            .iter()
            .zip(verdicts)
            .map(|(key, ok)| {
                let (raw_found, txt_like) = match key {
                    CheckKey::Cname => (cname_apex, false),
                    CheckKey::Mx => (mx_display, false),
                    CheckKey::Spf => (txt_apex, true),
                    CheckKey::Dmarc => (txt_dmarc, true),
                    CheckKey::Dkim => (cname_dkim, false),
                };
                let (found, found_truncated) = self.bound_found(raw_found, txt_like);

                let mut entry = MissingEntry {
                    key: *key,
                    record_type: key.record_type().to_string(),
                    name: key.checked_name(apex, &self.profile.dkim_selector),
                    expected: key.expected_display(&self.profile),
                    found,
                    ok,
                    found_truncated,
                    expected_ips: None,
                    found_ips: None,
                    chain_reason: None,
                };

                if *key == CheckKey::Cname {
                    if let Some(walk) = chain_walk {
                        entry.expected_ips = Some(
                            self.profile
                                .ui_cname_authorized_ips
                                .iter()
                                .map(|ip| ip.to_string())
                                .collect(),
                        );
                        let (found_ips, _) = self.bound_found(&walk.resolved_ips, false);
                        entry.found_ips = Some(found_ips);
                        entry.chain_reason = Some(walk.reason.as_str().to_string());
                    }
                }

                entry
            })
            .collect()
    }

    /// Sanitizes, caps, and per-value truncates a found list.
    fn bound_found(&self, values: &[String], txt_like: bool) -> (Vec<String>, bool) {
        let (max_items, max_len) = if txt_like {
            (self.dns.max_txt_records, self.dns.max_txt_length)
        } else {
            (self.dns.max_records, self.dns.max_host_length)
        };
        let sanitized: Vec<String> = values
            .iter()
            .map(|v| {
                if txt_like {
                    sanitize_text(v)
                } else {
                    sanitize_hostname(v)
                }
            })
            .collect();
        let capped = cap_values(sanitized, max_items);
        let mut any_truncated = capped.truncated;
        let bounded = capped
            .values
            .into_iter()
            .map(|v| {
                let (out, truncated) = truncate_chars(&v, max_len);
                any_truncated |= truncated;
                out
            })
            .collect();
        (bounded, any_truncated)
    }

    fn snapshot_hosts(&self, values: &[String]) -> SnapshotList {
        self.snapshot_list(values, false)
    }

    fn snapshot_txt(&self, values: &[String]) -> SnapshotList {
        self.snapshot_list(values, true)
    }

    fn snapshot_list(&self, originals: &[String], txt_like: bool) -> SnapshotList {
        let (values, value_truncated) = self.bound_found(originals, txt_like);
        let truncated = value_truncated || values.len() < originals.len();
        SnapshotList {
            total: originals.len(),
            hash: truncated.then(|| forensic_hash(originals)),
            values,
            truncated,
        }
    }
}
