//! Service configuration.
//!
//! All deployment tuning comes from environment variables; the binary's CLI
//! only selects log level and format. [`Settings::from_env`] reads and
//! validates the whole set at startup so a misconfigured process fails fast
//! instead of at first use.

pub mod constants;
mod types;

pub use types::{LogFormat, LogLevel};

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use log::warn;

use crate::error_handling::ConfigError;

/// Database connection and retry settings.
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// MySQL server host.
    pub host: String,
    /// MySQL user.
    pub user: String,
    /// MySQL password.
    pub pass: String,
    /// Database name.
    pub name: String,
    /// MySQL server port.
    pub port: u16,
    /// Connection pool size. Also the ceiling for concurrent jobs.
    pub pool_connection_limit: u32,
    /// How long to wait for a pooled connection.
    pub pool_acquire_timeout: Duration,
    /// How long to wait for the initial connection at startup.
    pub pool_connect_timeout: Duration,
    /// Transient query failures are retried up to this many times.
    pub query_retry_count: u32,
    /// Base delay for linear retry backoff (`delay × (attempt + 1)`).
    pub query_retry_delay: Duration,
}

/// Outbound SMTP settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    /// SMTP relay host.
    pub host: String,
    /// SMTP relay port.
    pub port: u16,
    /// True for implicit TLS, false for opportunistic STARTTLS.
    pub secure: bool,
    /// SMTP username.
    pub user: String,
    /// SMTP password.
    pub pass: String,
    /// From address for all notifications.
    pub from: String,
    /// Operator inbox receiving request/status notifications.
    pub admin_to: String,
    /// Notification bodies are truncated to this length.
    pub body_max_length: usize,
}

/// DNS resolution settings.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    /// Upstream nameservers, queried in order.
    pub servers: Vec<IpAddr>,
    /// Per-lookup timeout.
    pub timeout: Duration,
    /// Interval between background validation ticks per target.
    pub poll_interval: Duration,
    /// Time budget before a PENDING request expires.
    pub job_max_age: Duration,
    /// Cap on non-TXT record lists in snapshots.
    pub max_records: usize,
    /// Cap on TXT record lists in snapshots.
    pub max_txt_records: usize,
    /// Per-value truncation length for TXT records.
    pub max_txt_length: usize,
    /// Per-value truncation length for hostnames.
    pub max_host_length: usize,
}

/// The expected DNS profile a target must match.
#[derive(Debug, Clone)]
pub struct ExpectedProfile {
    /// Expected apex CNAME (normalized).
    pub ui_cname: String,
    /// When non-empty, the CNAME requirement is satisfied by chain-walking to
    /// one of these addresses instead of by the equality check.
    pub ui_cname_authorized_ips: Vec<IpAddr>,
    /// Frontier-expansion bound for the CNAME chain walk.
    pub ui_cname_max_chain_depth: usize,
    /// Expected MX exchange host (normalized).
    pub mx_host: String,
    /// Expected MX priority; compared with strict equality.
    pub mx_priority: u16,
    /// DKIM selector; the checked name is `{selector}._domainkey.{apex}`.
    pub dkim_selector: String,
    /// Expected DKIM CNAME (normalized).
    pub dkim_cname: String,
    /// Expected SPF TXT value (compared after whitespace-collapse + lowercase).
    pub spf: String,
    /// Expected DMARC TXT value at `_dmarc.{apex}` (same normalization).
    pub dmarc: String,
}

/// Background job scheduling settings.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Global cap on concurrently running jobs, clamped to the pool size.
    pub max_active: usize,
    /// Upper bound on the random first-tick delay applied when resuming
    /// jobs at boot.
    pub resume_startup_jitter: Duration,
}

/// Intake handler settings.
#[derive(Debug, Clone)]
pub struct IntakeSettings {
    /// Minimum age of the last request row before a target may resubmit.
    pub target_cooldown: Duration,
    /// Byte budget for persisted check-result JSON.
    pub result_json_max_bytes: usize,
}

/// Read-only query path settings.
#[derive(Debug, Clone)]
pub struct CheckdnsSettings {
    /// When set, `GET /api/checkdns/:target` requires this value in the
    /// `x-api-key` header.
    pub token: Option<String>,
    /// Minimum interval between read-only live checks per target.
    pub min_interval: Duration,
}

/// Full service configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,
    /// Database settings.
    pub db: DbSettings,
    /// SMTP settings.
    pub smtp: SmtpSettings,
    /// DNS settings.
    pub dns: DnsSettings,
    /// Expected DNS profile.
    pub profile: ExpectedProfile,
    /// Job scheduler settings.
    pub jobs: JobSettings,
    /// Intake settings.
    pub intake: IntakeSettings,
    /// Read-only query settings.
    pub checkdns: CheckdnsSettings,
}

impl Settings {
    /// Loads settings from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    ///
    /// The indirection keeps configuration parsing testable without mutating
    /// process-global environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let db = DbSettings {
            host: env.required("DB_HOST")?,
            user: env.required("DB_USER")?,
            pass: env.required("DB_PASS")?,
            name: env.required("DB_NAME")?,
            port: env.parse_or("DB_PORT", 3306u16)?,
            pool_connection_limit: env.parse_or("DB_POOL_CONNECTION_LIMIT", 10u32)?,
            pool_acquire_timeout: env.millis_or("DB_POOL_ACQUIRE_TIMEOUT_MS", 10_000)?,
            pool_connect_timeout: env.millis_or("DB_POOL_CONNECT_TIMEOUT_MS", 10_000)?,
            query_retry_count: env.parse_or("DB_QUERY_RETRY_COUNT", 3u32)?,
            query_retry_delay: env.millis_or("DB_QUERY_RETRY_DELAY_MS", 250)?,
        };
        if db.pool_connection_limit == 0 {
            return Err(ConfigError::InvalidVar {
                name: "DB_POOL_CONNECTION_LIMIT",
                reason: "must be at least 1".into(),
            });
        }

        let smtp = SmtpSettings {
            host: env.required("SMTP_HOST")?,
            port: env.parse_or("SMTP_PORT", 587u16)?,
            secure: env.bool_or("SMTP_SECURE", false)?,
            user: env.required("SMTP_USER")?,
            pass: env.required("SMTP_PASS")?,
            from: env.required("SMTP_FROM")?,
            admin_to: env.required("ADMIN_EMAIL_TO")?,
            body_max_length: env.parse_or("EMAIL_BODY_MAX_LENGTH", 10_000usize)?,
        };

        let poll_interval = env.secs_or("DNS_POLL_INTERVAL_SECONDS", 60)?;
        if poll_interval.is_zero() {
            return Err(ConfigError::InvalidVar {
                name: "DNS_POLL_INTERVAL_SECONDS",
                reason: "must be at least 1".into(),
            });
        }
        let job_max_age_hours: u64 = env.parse_or("DNS_JOB_MAX_AGE_HOURS", 48u64)?;
        if job_max_age_hours == 0 {
            return Err(ConfigError::InvalidVar {
                name: "DNS_JOB_MAX_AGE_HOURS",
                reason: "must be at least 1".into(),
            });
        }
        let dns = DnsSettings {
            servers: env.ip_list("DNS_SERVERS", true)?,
            timeout: env.millis_or("DNS_TIMEOUT_MS", 5_000)?,
            poll_interval,
            job_max_age: Duration::from_secs(job_max_age_hours * 3_600),
            max_records: env.parse_or("DNS_MAX_RECORDS", 20usize)?,
            max_txt_records: env.parse_or("DNS_MAX_TXT_RECORDS", 30usize)?,
            max_txt_length: env.parse_or("DNS_MAX_TXT_LENGTH", 1_024usize)?,
            max_host_length: env.parse_or("DNS_MAX_HOST_LENGTH", 255usize)?,
        };

        let profile = ExpectedProfile {
            ui_cname: normalize_expected_host(&env.required("UI_CNAME_EXPECTED")?),
            ui_cname_authorized_ips: env.ip_list("UI_CNAME_AUTHORIZED_IPS", false)?,
            ui_cname_max_chain_depth: env.parse_or("UI_CNAME_MAX_CHAIN_DEPTH", 5usize)?,
            mx_host: normalize_expected_host(&env.required("EMAIL_MX_EXPECTED_HOST")?),
            mx_priority: env.required_parse("EMAIL_MX_EXPECTED_PRIORITY")?,
            dkim_selector: env.required("EMAIL_DKIM_SELECTOR")?,
            dkim_cname: normalize_expected_host(&env.required("EMAIL_DKIM_CNAME_EXPECTED")?),
            spf: env.required("EMAIL_SPF_EXPECTED")?,
            dmarc: env.required("EMAIL_DMARC_EXPECTED")?,
        };
        if profile.ui_cname_max_chain_depth == 0 {
            return Err(ConfigError::InvalidVar {
                name: "UI_CNAME_MAX_CHAIN_DEPTH",
                reason: "must be at least 1".into(),
            });
        }

        let requested_jobs: usize = env.parse_or("MAX_ACTIVE_JOBS", 10usize)?;
        let pool_limit = db.pool_connection_limit as usize;
        let max_active = if requested_jobs > pool_limit {
            warn!(
                "MAX_ACTIVE_JOBS {} exceeds DB_POOL_CONNECTION_LIMIT {}; clamping to {}",
                requested_jobs, pool_limit, pool_limit
            );
            pool_limit
        } else {
            requested_jobs.max(1)
        };
        let jobs = JobSettings {
            max_active,
            resume_startup_jitter: env.millis_or("RESUME_STARTUP_JITTER_MS", 5_000)?,
        };

        let intake = IntakeSettings {
            target_cooldown: env.secs_or("TARGET_COOLDOWN_SECONDS", 60)?,
            result_json_max_bytes: env.parse_or(
                "RESULT_JSON_MAX_BYTES",
                constants::RESULT_JSON_MAX_BYTES_DEFAULT,
            )?,
        };

        let checkdns = CheckdnsSettings {
            token: env.optional("CHECKDNS_TOKEN"),
            min_interval: env.secs_or("CHECKDNS_MIN_INTERVAL_SECONDS", 60)?,
        };

        Ok(Settings {
            host: env.required("HOST")?,
            port: env.required_parse("PORT")?,
            db,
            smtp,
            dns,
            profile,
            jobs,
            intake,
            checkdns,
        })
    }

    /// One-line startup summary with secrets omitted.
    pub fn redacted_summary(&self) -> String {
        format!(
            "listen={}:{} db={}@{}:{}/{} pool={} smtp={}:{} dns_servers={} poll={}s max_age={}h max_jobs={}",
            self.host,
            self.port,
            self.db.user,
            self.db.host,
            self.db.port,
            self.db.name,
            self.db.pool_connection_limit,
            self.smtp.host,
            self.smtp.port,
            self.dns
                .servers
                .iter()
                .map(|ip| ip.to_string())
                .collect::<Vec<_>>()
                .join(","),
            self.dns.poll_interval.as_secs(),
            self.dns.job_max_age.as_secs() / 3_600,
            self.jobs.max_active,
        )
    }
}

/// Expected hostnames arrive from configuration with arbitrary casing and
/// sometimes a trailing dot; store them the way resolved records are
/// normalized so comparisons are byte-for-byte.
fn normalize_expected_host(value: &str) -> String {
    value.trim().trim_end_matches('.').to_ascii_lowercase()
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, name: &'static str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::MissingVar(name))
    }

    fn required_parse<T>(&self, name: &'static str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.required(name)?;
        raw.parse().map_err(|e| ConfigError::InvalidVar {
            name,
            reason: format!("{e}"),
        })
    }

    fn parse_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.optional(name) {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidVar {
                name,
                reason: format!("{e}"),
            }),
            None => Ok(default),
        }
    }

    fn millis_or(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_millis(self.parse_or(name, default)?))
    }

    fn secs_or(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse_or(name, default)?))
    }

    fn bool_or(&self, name: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(name).as_deref() {
            None => Ok(default),
            Some("true") | Some("1") | Some("yes") => Ok(true),
            Some("false") | Some("0") | Some("no") => Ok(false),
            Some(other) => Err(ConfigError::InvalidVar {
                name,
                reason: format!("expected true/false, got {other:?}"),
            }),
        }
    }

    /// Parses a comma-separated list of IP addresses. Rejects malformed
    /// entries outright; a typo in a nameserver list should stop the boot.
    fn ip_list(&self, name: &'static str, required: bool) -> Result<Vec<IpAddr>, ConfigError> {
        let raw = match self.optional(name) {
            Some(raw) => raw,
            None if required => return Err(ConfigError::MissingVar(name)),
            None => return Ok(Vec::new()),
        };
        let mut ips = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let ip: IpAddr = part.parse().map_err(|_| ConfigError::InvalidVar {
                name,
                reason: format!("{part:?} is not an IP address"),
            })?;
            ips.push(ip);
        }
        if required && ips.is_empty() {
            return Err(ConfigError::InvalidVar {
                name,
                reason: "expected at least one IP address".into(),
            });
        }
        Ok(ips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("HOST", "0.0.0.0"),
            ("PORT", "8080"),
            ("DB_HOST", "db.internal"),
            ("DB_USER", "verifier"),
            ("DB_PASS", "secret"),
            ("DB_NAME", "dnsverify"),
            ("ADMIN_EMAIL_TO", "ops@forwarder.example"),
            ("SMTP_HOST", "smtp.forwarder.example"),
            ("SMTP_USER", "mailer"),
            ("SMTP_PASS", "secret"),
            ("SMTP_FROM", "noreply@forwarder.example"),
            ("DNS_SERVERS", "8.8.8.8, 1.1.1.1"),
            ("UI_CNAME_EXPECTED", "Edge.Forwarder.Example."),
            ("EMAIL_MX_EXPECTED_HOST", "mx.forwarder.example"),
            ("EMAIL_MX_EXPECTED_PRIORITY", "10"),
            ("EMAIL_DKIM_SELECTOR", "fwd"),
            ("EMAIL_DKIM_CNAME_EXPECTED", "fwd.dkim.forwarder.example"),
            ("EMAIL_SPF_EXPECTED", "v=spf1 include:spf.forwarder.example -all"),
            ("EMAIL_DMARC_EXPECTED", "v=DMARC1; p=quarantine"),
        ])
    }

    fn settings_from(vars: HashMap<&'static str, &'static str>) -> Result<Settings, ConfigError> {
        Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_minimal_env_parses_with_defaults() {
        let settings = settings_from(base_vars()).expect("settings should parse");
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.db.pool_connection_limit, 10);
        assert_eq!(settings.jobs.max_active, 10);
        assert_eq!(settings.dns.poll_interval, Duration::from_secs(60));
        assert_eq!(
            settings.intake.result_json_max_bytes,
            constants::RESULT_JSON_MAX_BYTES_DEFAULT
        );
        assert!(settings.checkdns.token.is_none());
        assert!(settings.profile.ui_cname_authorized_ips.is_empty());
    }

    #[test]
    fn test_missing_required_var_is_reported_by_name() {
        let mut vars = base_vars();
        vars.remove("DNS_SERVERS");
        let err = settings_from(vars).unwrap_err();
        assert!(err.to_string().contains("DNS_SERVERS"));
    }

    #[test]
    fn test_dns_servers_parsed_and_trimmed() {
        let settings = settings_from(base_vars()).unwrap();
        assert_eq!(settings.dns.servers.len(), 2);
        assert_eq!(settings.dns.servers[0].to_string(), "8.8.8.8");
        assert_eq!(settings.dns.servers[1].to_string(), "1.1.1.1");
    }

    #[test]
    fn test_bad_dns_server_rejected() {
        let mut vars = base_vars();
        vars.insert("DNS_SERVERS", "8.8.8.8,not-an-ip");
        let err = settings_from(vars).unwrap_err();
        assert!(err.to_string().contains("not-an-ip"));
    }

    #[test]
    fn test_expected_hosts_normalized() {
        let settings = settings_from(base_vars()).unwrap();
        assert_eq!(settings.profile.ui_cname, "edge.forwarder.example");
        assert_eq!(settings.profile.mx_host, "mx.forwarder.example");
    }

    #[test]
    fn test_max_active_jobs_clamped_to_pool_limit() {
        let mut vars = base_vars();
        vars.insert("DB_POOL_CONNECTION_LIMIT", "4");
        vars.insert("MAX_ACTIVE_JOBS", "50");
        let settings = settings_from(vars).unwrap();
        assert_eq!(settings.jobs.max_active, 4);
    }

    #[test]
    fn test_authorized_ips_optional_but_validated() {
        let mut vars = base_vars();
        vars.insert("UI_CNAME_AUTHORIZED_IPS", "1.2.3.4,5.6.7.8");
        let settings = settings_from(vars).unwrap();
        assert_eq!(settings.profile.ui_cname_authorized_ips.len(), 2);

        let mut vars = base_vars();
        vars.insert("UI_CNAME_AUTHORIZED_IPS", "1.2.3.4,bogus");
        assert!(settings_from(vars).is_err());
    }

    #[test]
    fn test_smtp_secure_accepts_common_spellings() {
        for (raw, expected) in [("true", true), ("1", true), ("false", false), ("0", false)] {
            let mut vars = base_vars();
            vars.insert("SMTP_SECURE", raw);
            assert_eq!(settings_from(vars).unwrap().smtp.secure, expected);
        }
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut vars = base_vars();
        vars.insert("DNS_POLL_INTERVAL_SECONDS", "0");
        assert!(settings_from(vars).is_err());
    }

    #[test]
    fn test_redacted_summary_hides_secrets() {
        let summary = settings_from(base_vars()).unwrap().redacted_summary();
        assert!(!summary.contains("secret"));
        assert!(summary.contains("db.internal"));
    }
}
