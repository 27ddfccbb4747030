//! Error type definitions.
//!
//! Typed errors for initialization, configuration, database access, and DNS
//! resolution. Handler-facing errors (the `{ "error": ... }` envelope) live
//! in `server::error`.

use log::SetLoggerError;
use thiserror::Error;

/// Error types for process initialization failures.
#[derive(Error, Debug)]
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error loading or validating configuration.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Error initializing the DNS resolver.
    #[error("DNS resolver initialization error: {0}")]
    DnsResolverError(String),

    /// Error initializing the SMTP transport.
    #[error("SMTP transport initialization error: {0}")]
    SmtpError(String),
}

/// Error types for environment configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required environment variable is not set.
    #[error("Missing required environment variable {0}")]
    MissingVar(&'static str),

    /// An environment variable is set but cannot be parsed.
    #[error("Invalid value for {name}: {reason}")]
    InvalidVar {
        /// Variable name.
        name: &'static str,
        /// What was wrong with the value.
        reason: String,
    },
}

/// Error types for database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQL execution error.
    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    /// The initial pool connection did not come up in time.
    #[error("Database connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// A `(target, type)` pair already has a request row.
    #[error("Duplicate request for {kind} {target}")]
    DuplicateRequest {
        /// Request type label (`UI` or `EMAIL`).
        kind: String,
        /// Normalized target domain.
        target: String,
    },
}

impl DatabaseError {
    /// True when the underlying SQL error is a transient connection-level
    /// failure worth retrying: pool/acquire timeouts, lost or refused
    /// connections, socket timeouts.
    pub fn is_transient(&self) -> bool {
        let DatabaseError::SqlError(e) = self else {
            return false;
        };
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
            sqlx::Error::Io(io) => matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
            ),
            sqlx::Error::Tls(_) => false,
            other => {
                // Driver-level disconnects surface as protocol errors with a
                // recognizable message rather than a dedicated variant.
                let msg = other.to_string().to_lowercase();
                msg.contains("connection reset")
                    || msg.contains("connection refused")
                    || msg.contains("connection closed")
                    || msg.contains("timed out")
                    || msg.contains("host unreachable")
            }
        }
    }
}

/// Error types for DNS resolution through the facade.
///
/// NXDOMAIN and NODATA are not errors; the facade returns an empty record
/// list for those. Only timeouts and genuine resolver failures surface here.
#[derive(Error, Debug)]
pub enum DnsError {
    /// The lookup exceeded the configured DNS timeout.
    #[error("DNS timeout during {label}")]
    Timeout {
        /// Which lookup timed out, e.g. `cname:example.com`.
        label: String,
    },

    /// The resolver failed for a reason other than NXDOMAIN or timeout.
    #[error("DNS lookup failed during {label}: {source}")]
    Resolve {
        /// Which lookup failed.
        label: String,
        /// Underlying resolver error.
        #[source]
        source: hickory_resolver::error::ResolveError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_request_message() {
        let err = DatabaseError::DuplicateRequest {
            kind: "EMAIL".into(),
            target: "example.com".into(),
        };
        assert_eq!(err.to_string(), "Duplicate request for EMAIL example.com");
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(DatabaseError::SqlError(sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_io_reset_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(DatabaseError::SqlError(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        assert!(!DatabaseError::SqlError(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_duplicate_is_not_transient() {
        let err = DatabaseError::DuplicateRequest {
            kind: "EMAIL".into(),
            target: "example.com".into(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_dns_timeout_message_carries_label() {
        let err = DnsError::Timeout {
            label: "mx:example.com".into(),
        };
        assert!(err.to_string().contains("mx:example.com"));
    }
}
