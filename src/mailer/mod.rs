//! Operator notifications over SMTP.
//!
//! Two message kinds: a request-created note at intake and a status-change
//! note on promotion or expiry. Notification failures never fail the
//! operation that triggered them; callers log and move on. Headers are
//! sanitized against CRLF injection and bodies are length-capped before
//! anything leaves the process.

use async_trait::async_trait;
use lettre::message::SinglePart;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;

use crate::config::SmtpSettings;
use crate::error_handling::InitializationError;
use crate::sanitize::{sanitize_text, truncate_chars};
use crate::storage::DnsRequest;

/// Outbound notification contract.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fired once when a request row is created.
    async fn send_request_created(&self, row: &DnsRequest) -> anyhow::Result<()>;

    /// Fired when a request reaches a terminal state. `last_result` is the
    /// parsed last check payload when one exists.
    async fn send_status_change(
        &self,
        row: &DnsRequest,
        last_result: Option<&serde_json::Value>,
    ) -> anyhow::Result<()>;
}

/// Header values must be a single sanitized line.
fn sanitize_header(value: &str) -> String {
    sanitize_text(value)
}

fn created_subject(row: &DnsRequest) -> String {
    sanitize_header(&format!(
        "DNS validation started for {} ({})",
        row.target, row.kind
    ))
}

fn created_body(row: &DnsRequest, max_length: usize) -> String {
    let body = format!(
        "A DNS validation request was created.\n\n\
         Target: {}\n\
         Type: {}\n\
         Status: {}\n\
         Created: {}\n\
         Expires: {}\n",
        row.target,
        row.kind,
        row.status,
        row.created_at.to_rfc3339(),
        row.expires_at.to_rfc3339(),
    );
    truncate_chars(&body, max_length).0
}

fn status_subject(row: &DnsRequest) -> String {
    sanitize_header(&format!(
        "DNS validation {} for {} ({})",
        row.status, row.target, row.kind
    ))
}

fn status_body(
    row: &DnsRequest,
    last_result: Option<&serde_json::Value>,
    max_length: usize,
) -> String {
    let mut body = format!(
        "A DNS validation request changed status.\n\n\
         Target: {}\n\
         Type: {}\n\
         Status: {}\n",
        row.target, row.kind, row.status,
    );
    if let Some(reason) = &row.fail_reason {
        body.push_str(&format!("Reason: {}\n", sanitize_text(reason)));
    }
    if let Some(result) = last_result {
        let rendered = serde_json::to_string_pretty(result).unwrap_or_default();
        body.push_str("\nLast check result:\n");
        body.push_str(&rendered);
        body.push('\n');
    }
    truncate_chars(&body, max_length).0
}

/// SMTP-backed notifier.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    admin_to: String,
    body_max_length: usize,
}

impl SmtpNotifier {
    /// Builds the transport from deployment settings. `SMTP_SECURE` selects
    /// implicit TLS; otherwise STARTTLS is used opportunistically.
    pub fn new(settings: &SmtpSettings) -> Result<Self, InitializationError> {
        let tls_params = TlsParameters::new(settings.host.clone())
            .map_err(|e| InitializationError::SmtpError(e.to_string()))?;
        let tls = if settings.secure {
            Tls::Wrapper(tls_params)
        } else {
            Tls::Opportunistic(tls_params)
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
            .port(settings.port)
            .tls(tls)
            .credentials(Credentials::new(
                settings.user.clone(),
                settings.pass.clone(),
            ))
            .build();

        Ok(SmtpNotifier {
            transport,
            from: settings.from.clone(),
            admin_to: settings.admin_to.clone(),
            body_max_length: settings.body_max_length,
        })
    }

    async fn send(&self, subject: String, body: String) -> anyhow::Result<()> {
        let email = Message::builder()
            .from(self.from.parse()?)
            .to(self.admin_to.parse()?)
            .subject(&subject)
            .singlepart(SinglePart::plain(body))?;

        self.transport.send(email).await?;
        info!("Notification sent: {subject}");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send_request_created(&self, row: &DnsRequest) -> anyhow::Result<()> {
        self.send(
            created_subject(row),
            created_body(row, self.body_max_length),
        )
        .await
    }

    async fn send_status_change(
        &self,
        row: &DnsRequest,
        last_result: Option<&serde_json::Value>,
    ) -> anyhow::Result<()> {
        self.send(
            status_subject(row),
            status_body(row, last_result, self.body_max_length),
        )
        .await
    }
}

#[cfg(test)]
pub mod testing {
    //! Recording notifier for handler and scheduler tests.

    use std::sync::Mutex;

    use super::*;
    use crate::storage::RequestStatus;

    /// What a notifier was asked to send.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentMail {
        /// `send_request_created` for a target.
        Created(String),
        /// `send_status_change` for a target with its status at send time.
        StatusChange(String, RequestStatus),
    }

    /// Notifier that records calls instead of talking SMTP.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<SentMail>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every subsequent send fail, to prove callers treat
        /// notification errors as fire-and-forget.
        pub fn fail_sends(&self) {
            self.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<SentMail> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_request_created(&self, row: &DnsRequest) -> anyhow::Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("smtp unavailable");
            }
            self.sent
                .lock()
                .unwrap()
                .push(SentMail::Created(row.target.clone()));
            Ok(())
        }

        async fn send_status_change(
            &self,
            row: &DnsRequest,
            _last_result: Option<&serde_json::Value>,
        ) -> anyhow::Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                anyhow::bail!("smtp unavailable");
            }
            self.sent
                .lock()
                .unwrap()
                .push(SentMail::StatusChange(row.target.clone(), row.status));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RequestStatus, RequestType};
    use chrono::{TimeZone, Utc};

    fn row() -> DnsRequest {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        DnsRequest {
            id: 1,
            target: "example.com".into(),
            kind: RequestType::Email,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            activated_at: None,
            last_checked_at: None,
            next_check_at: None,
            expires_at: now + chrono::Duration::hours(48),
            last_check_result_json: None,
            fail_reason: None,
        }
    }

    #[test]
    fn test_subjects_are_crlf_safe() {
        let mut row = row();
        row.target = "evil.example\r\nBcc: victim@example.com".into();
        let subject = created_subject(&row);
        assert!(!subject.contains('\r'));
        assert!(!subject.contains('\n'));
    }

    #[test]
    fn test_created_body_mentions_target_and_deadline() {
        let body = created_body(&row(), 10_000);
        assert!(body.contains("example.com"));
        assert!(body.contains("Expires:"));
    }

    #[test]
    fn test_status_body_includes_fail_reason() {
        let mut row = row();
        row.status = RequestStatus::Expired;
        row.fail_reason = Some("Request expired".into());
        let body = status_body(&row, None, 10_000);
        assert!(body.contains("EXPIRED"));
        assert!(body.contains("Request expired"));
    }

    #[test]
    fn test_status_body_renders_last_result() {
        let result = serde_json::json!({ "ok": true });
        let body = status_body(&row(), Some(&result), 10_000);
        assert!(body.contains("Last check result"));
        assert!(body.contains("\"ok\": true"));
    }

    #[test]
    fn test_bodies_respect_length_cap() {
        let result = serde_json::json!({ "filler": "x".repeat(5_000) });
        let body = status_body(&row(), Some(&result), 500);
        assert!(body.chars().count() <= 500);
    }
}
