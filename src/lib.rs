//! domain-verifier: DNS onboarding validation for hosted email forwarding.
//!
//! Customers point their domain's DNS at the forwarding service and submit
//! the domain here. The service polls a fixed record set (apex CNAME, MX,
//! SPF, DMARC, DKIM) against a configured expected profile and promotes the
//! request to `ACTIVE` once everything matches, or expires it when its time
//! budget runs out. A read-only query endpoint serves external pollers
//! without scheduling any work.
//!
//! # Requirements
//!
//! Runs on Tokio; the binary entry point wires configuration from the
//! environment and calls [`run_service`].

#![warn(missing_docs)]

pub mod config;
pub mod dns;
pub mod domain;
pub mod error_handling;
pub mod logging;
pub mod mailer;
pub mod sanitize;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod validation;

pub use config::{LogFormat, LogLevel, Settings};
pub use run::run_service;

mod run {
    use std::sync::Arc;
    use std::time::Instant;

    use anyhow::Context;
    use log::{error, info, warn};
    use tokio_util::sync::CancellationToken;

    use crate::config::constants::SHUTDOWN_GRACE;
    use crate::config::Settings;
    use crate::dns::HickoryRecordResolver;
    use crate::mailer::SmtpNotifier;
    use crate::scheduler::{JobContext, JobScheduler};
    use crate::server::{serve, AppState, DebounceMap, IpRateLimiter};
    use crate::storage::{init_db_pool, run_migrations, MySqlRequestStore, RetryPolicy};
    use crate::validation::Validator;

    /// Runs the service until SIGTERM/SIGINT.
    ///
    /// Wires the pool, resolver, notifier, and scheduler; resumes polling
    /// jobs for rows that were `PENDING` at the last shutdown; then serves
    /// HTTP. On a shutdown signal the server stops accepting connections,
    /// jobs are cancelled, the pool is drained, and a hard exit fires if
    /// anything is still in flight after the grace period.
    pub async fn run_service(settings: Settings) -> anyhow::Result<()> {
        let settings = Arc::new(settings);
        info!("Starting domain-verifier: {}", settings.redacted_summary());

        let pool = init_db_pool(&settings.db)
            .await
            .context("Failed to initialize database pool")?;
        run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        let store = Arc::new(MySqlRequestStore::new(
            pool.clone(),
            RetryPolicy::from_settings(&settings.db),
        ));
        let resolver = Arc::new(HickoryRecordResolver::new(&settings.dns));
        let validator = Arc::new(Validator::new(
            resolver,
            settings.profile.clone(),
            settings.dns.clone(),
        ));
        let notifier = Arc::new(
            SmtpNotifier::new(&settings.smtp).context("Failed to initialize SMTP transport")?,
        );

        let shutdown = CancellationToken::new();
        let scheduler = JobScheduler::new(
            JobContext {
                store: store.clone(),
                validator: validator.clone(),
                notifier: notifier.clone(),
                result_json_max_bytes: settings.intake.result_json_max_bytes,
            },
            settings.jobs.max_active,
            settings.dns.poll_interval,
            settings.jobs.resume_startup_jitter,
            shutdown.clone(),
        );
        scheduler
            .resume_pending()
            .await
            .context("Failed to resume pending validation jobs")?;

        let rate_limiter = Arc::new(IpRateLimiter::default());
        rate_limiter.spawn_sweeper(shutdown.clone());

        let state = AppState {
            settings: settings.clone(),
            store,
            validator,
            notifier,
            scheduler,
            debounce: Arc::new(DebounceMap::new(settings.checkdns.min_interval)),
            rate_limiter,
            started_at: Instant::now(),
        };

        spawn_signal_handler(shutdown.clone());

        serve(state, shutdown.clone()).await?;

        info!("HTTP server stopped; draining database pool");
        pool.close().await;
        info!("Shutdown complete");
        Ok(())
    }

    /// Cancels `shutdown` on SIGTERM/SIGINT and arms the force-exit timer.
    fn spawn_signal_handler(shutdown: CancellationToken) {
        tokio::spawn(async move {
            let sigterm = async {
                #[cfg(unix)]
                {
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    {
                        Ok(mut stream) => {
                            stream.recv().await;
                        }
                        Err(e) => {
                            error!("Failed to install SIGTERM handler: {e}");
                            std::future::pending::<()>().await;
                        }
                    }
                }
                #[cfg(not(unix))]
                std::future::pending::<()>().await;
            };

            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Failed to listen for SIGINT: {e}");
                        return;
                    }
                    info!("SIGINT received, shutting down");
                }
                _ = sigterm => {
                    info!("SIGTERM received, shutting down");
                }
            }
            shutdown.cancel();

            // In-flight work gets the grace period, then the process goes.
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            warn!(
                "Shutdown grace period of {:?} elapsed, forcing exit",
                SHUTDOWN_GRACE
            );
            std::process::exit(0);
        });
    }
}
