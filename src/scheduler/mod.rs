//! Background polling scheduler.
//!
//! One job per `PENDING` request, keyed `{type}:{target}`. Each job owns a
//! cancellable interval task that re-validates its target until the row
//! leaves `PENDING` or the process shuts down. Admission is capped
//! globally; starts beyond the cap wait in a FIFO queue and are promoted as
//! running jobs finish. On boot the scheduler reconstructs jobs for every
//! live `PENDING` row, jittering first ticks so a restart does not hammer
//! the resolver.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::constants::RESUME_JITTER_POLL_MARGIN_MS;
use crate::mailer::Notifier;
use crate::sanitize::sanitize_fail_reason;
use crate::storage::{DnsRequest, RequestStatus, RequestStore, Transition};
use crate::validation::payload::build_result_payload;
use crate::validation::Validator;

/// Collaborators a job tick needs.
pub struct JobContext {
    /// Request store.
    pub store: Arc<dyn RequestStore>,
    /// Validation engine.
    pub validator: Arc<Validator>,
    /// Outbound notifier.
    pub notifier: Arc<dyn Notifier>,
    /// Byte budget for persisted check results.
    pub result_json_max_bytes: usize,
}

/// What a tick decided about its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    /// Keep polling.
    Continue,
    /// The row is terminal, gone, or raced; tear the job down.
    Stop,
}

struct JobHandle {
    cancel: CancellationToken,
    running: Arc<AtomicBool>,
}

struct QueuedStart {
    id: u64,
    key: String,
}

#[derive(Default)]
struct SchedulerInner {
    jobs: HashMap<String, JobHandle>,
    queue: VecDeque<QueuedStart>,
    queued_keys: HashSet<String>,
}

/// The job scheduler. One instance per process, shared behind `Arc`.
pub struct JobScheduler {
    inner: Mutex<SchedulerInner>,
    ctx: JobContext,
    max_active: usize,
    poll_interval: Duration,
    resume_jitter: Duration,
    shutdown: CancellationToken,
}

impl JobScheduler {
    /// Creates the scheduler. `shutdown` tears down every job when
    /// cancelled.
    pub fn new(
        ctx: JobContext,
        max_active: usize,
        poll_interval: Duration,
        resume_jitter: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(JobScheduler {
            inner: Mutex::new(SchedulerInner::default()),
            ctx,
            max_active,
            poll_interval,
            resume_jitter,
            shutdown,
        })
    }

    /// Number of currently running jobs.
    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Number of starts waiting for a slot.
    pub fn queued_count(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    /// Whether the running-job cap is reached.
    pub fn at_capacity(&self) -> bool {
        self.active_count() >= self.max_active
    }

    /// Starts (or queues) a polling job for `row`. No-op when a job or a
    /// queued start already exists for the row's key.
    pub fn start_for_request(self: &Arc<Self>, row: &DnsRequest, initial_delay: Duration) {
        let key = row.job_key();
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.contains_key(&key) || inner.queued_keys.contains(&key) {
            debug!("Job {key} already tracked; ignoring start");
            return;
        }
        if inner.jobs.len() < self.max_active {
            self.spawn_job(&mut inner, row.id, key, initial_delay);
        } else {
            debug!("Job {key} queued; {} jobs running", inner.jobs.len());
            inner.queued_keys.insert(key.clone());
            inner.queue.push_back(QueuedStart { id: row.id, key });
        }
    }

    /// Reconstructs jobs for every live `PENDING` row. Returns how many
    /// jobs were started or queued.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize, crate::error_handling::DatabaseError> {
        let rows = self.ctx.store.find_pending_not_expired(Utc::now()).await?;
        let count = rows.len();

        // Spread first ticks over the jitter window, staying clear of the
        // next interval tick.
        let poll_ms = self.poll_interval.as_millis() as u64;
        let max_jitter = self
            .resume_jitter
            .as_millis()
            .min(poll_ms.saturating_sub(RESUME_JITTER_POLL_MARGIN_MS) as u128) as u64;

        for row in rows {
            let delay = if max_jitter == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
            };
            self.start_for_request(&row, delay);
        }
        if count > 0 {
            info!("Resumed {count} pending validation jobs");
        }
        Ok(count)
    }

    /// Must hold the inner lock. Registers the handle and spawns the task.
    fn spawn_job(
        self: &Arc<Self>,
        inner: &mut SchedulerInner,
        id: u64,
        key: String,
        initial_delay: Duration,
    ) {
        let cancel = self.shutdown.child_token();
        let running = Arc::new(AtomicBool::new(false));
        inner.jobs.insert(
            key.clone(),
            JobHandle {
                cancel: cancel.clone(),
                running: running.clone(),
            },
        );
        debug!("Job {key} started (delay {:?})", initial_delay);

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            scheduler.run_job(id, key, cancel, running, initial_delay).await;
        });
    }

    async fn run_job(
        self: Arc<Self>,
        id: u64,
        key: String,
        cancel: CancellationToken,
        running: Arc<AtomicBool>,
        initial_delay: Duration,
    ) {
        if !initial_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(initial_delay) => {}
                _ = cancel.cancelled() => {
                    self.finish_job(&key);
                    return;
                }
            }
        }

        // The interval's first tick completes immediately, so the first
        // validation runs as soon as the delay (if any) elapses.
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_check(id, &key, &running).await {
                        TickOutcome::Continue => {}
                        TickOutcome::Stop => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        self.finish_job(&key);
    }

    /// Removes a finished job and promotes queued starts into free slots.
    fn finish_job(self: &Arc<Self>, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(handle) = inner.jobs.remove(key) {
            handle.cancel.cancel();
            debug!("Job {key} stopped");
        }
        while inner.jobs.len() < self.max_active {
            let Some(queued) = inner.queue.pop_front() else {
                break;
            };
            inner.queued_keys.remove(&queued.key);
            if inner.jobs.contains_key(&queued.key) {
                continue;
            }
            self.spawn_job(&mut inner, queued.id, queued.key, Duration::ZERO);
        }
    }

    /// One validation tick. See the module docs for the full contract; in
    /// short: reentrancy-guarded, expiry before validation, every write
    /// guarded on `status = 'PENDING'`, errors recorded but never fatal to
    /// the job.
    pub(crate) async fn run_check(&self, id: u64, key: &str, running: &AtomicBool) -> TickOutcome {
        // At most one in-flight validation per key.
        if running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Job {key}: tick skipped, previous tick still running");
            return TickOutcome::Continue;
        }
        let outcome = self.tick(id, key).await;
        running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn tick(&self, id: u64, key: &str) -> TickOutcome {
        let now = Utc::now();

        let row = match self.ctx.store.find_by_id(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                info!("Job {key}: request row {id} is gone, stopping");
                return TickOutcome::Stop;
            }
            Err(e) => {
                warn!("Job {key}: failed to load request {id}: {e}");
                self.record_failure(id, &e.to_string()).await;
                return TickOutcome::Continue;
            }
        };
        if row.status != RequestStatus::Pending {
            info!("Job {key}: request {id} is {}, stopping", row.status);
            return TickOutcome::Stop;
        }

        if row.is_expired(now) {
            match self
                .ctx
                .store
                .conditional_transition(
                    id,
                    now,
                    Transition::Expire {
                        fail_reason: "Request expired".into(),
                    },
                )
                .await
            {
                Ok(1) => {
                    info!("Job {key}: request {id} expired");
                    self.notify_status(id).await;
                }
                Ok(_) => debug!("Job {key}: expiry raced, another actor transitioned first"),
                Err(e) => warn!("Job {key}: failed to expire request {id}: {e}"),
            }
            return TickOutcome::Stop;
        }

        let outcome = match self.ctx.validator.check_target(&row.target).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Job {key}: validation error for {}: {e}", row.target);
                self.record_failure(id, &e.to_string()).await;
                return TickOutcome::Continue;
            }
        };

        let next_check_at = now + chrono::Duration::from_std(self.poll_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let payload = build_result_payload(&outcome, self.ctx.result_json_max_bytes);
        match self
            .ctx
            .store
            .update_check_result(id, now, next_check_at, &payload)
            .await
        {
            Ok(0) => {
                info!("Job {key}: request {id} left PENDING mid-check, stopping");
                return TickOutcome::Stop;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Job {key}: failed to persist check result for {id}: {e}");
                self.record_failure(id, &e.to_string()).await;
                return TickOutcome::Continue;
            }
        }

        if !outcome.ok {
            debug!(
                "Job {key}: {} still missing requirements",
                row.target
            );
            return TickOutcome::Continue;
        }

        match self
            .ctx
            .store
            .conditional_transition(
                id,
                now,
                Transition::Activate { activated_at: now },
            )
            .await
        {
            Ok(1) => {
                info!("Job {key}: request {id} promoted to ACTIVE");
                self.notify_status(id).await;
                if let Err(e) = self.ctx.store.mark_domain_active(&row.target, now).await {
                    warn!("Job {key}: failed to record active domain {}: {e}", row.target);
                }
            }
            Ok(_) => debug!("Job {key}: promotion raced, another actor transitioned first"),
            Err(e) => {
                warn!("Job {key}: failed to promote request {id}: {e}");
                self.record_failure(id, &e.to_string()).await;
                return TickOutcome::Continue;
            }
        }
        TickOutcome::Stop
    }

    /// Best-effort failure note; never fails the tick.
    async fn record_failure(&self, id: u64, reason: &str) {
        let reason = sanitize_fail_reason(reason);
        if let Err(e) = self
            .ctx
            .store
            .record_fail_reason(id, Utc::now(), &reason)
            .await
        {
            warn!("Failed to record fail reason for request {id}: {e}");
        }
    }

    /// Fire-and-forget status-change notification with the freshly
    /// persisted row and its parsed last result.
    async fn notify_status(&self, id: u64) {
        let row = match self.ctx.store.find_by_id(id).await {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to reload request {id} for notification: {e}");
                return;
            }
        };
        let last_result = row
            .last_check_result_json
            .as_deref()
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok());
        if let Err(e) = self
            .ctx
            .notifier
            .send_status_change(&row, last_result.as_ref())
            .await
        {
            warn!("Failed to send status notification for {}: {e}", row.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnsSettings, ExpectedProfile};
    use crate::dns::testing::MockResolver;
    use crate::mailer::testing::{RecordingNotifier, SentMail};
    use crate::storage::testing::MemoryStore;
    use crate::storage::RequestType;
    use chrono::{DateTime, Utc};

    fn profile() -> ExpectedProfile {
        ExpectedProfile {
            ui_cname: "edge.forwarder.example".into(),
            ui_cname_authorized_ips: Vec::new(),
            ui_cname_max_chain_depth: 5,
            mx_host: "mx.forwarder.example".into(),
            mx_priority: 10,
            dkim_selector: "fwd".into(),
            dkim_cname: "fwd.dkim.forwarder.example".into(),
            spf: "v=spf1 mx -all".into(),
            dmarc: "v=DMARC1; p=quarantine".into(),
        }
    }

    fn dns_settings() -> DnsSettings {
        DnsSettings {
            servers: vec!["127.0.0.1".parse().unwrap()],
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(60),
            job_max_age: Duration::from_secs(48 * 3_600),
            max_records: 20,
            max_txt_records: 30,
            max_txt_length: 1_024,
            max_host_length: 255,
        }
    }

    fn pass_dns(resolver: &MockResolver, target: &str) {
        resolver
            .cname(target, &["edge.forwarder.example"])
            .cname(
                &format!("fwd._domainkey.{target}"),
                &["fwd.dkim.forwarder.example"],
            )
            .mx(target, &[("mx.forwarder.example", 10)])
            .txt(target, &["v=spf1 mx -all"])
            .txt(&format!("_dmarc.{target}"), &["v=DMARC1; p=quarantine"]);
    }

    struct Fixture {
        scheduler: Arc<JobScheduler>,
        store: Arc<MemoryStore>,
        notifier: Arc<RecordingNotifier>,
        resolver: Arc<MockResolver>,
    }

    fn fixture(max_active: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let resolver = Arc::new(MockResolver::new());
        let validator = Arc::new(Validator::new(
            resolver.clone(),
            profile(),
            dns_settings(),
        ));
        let scheduler = JobScheduler::new(
            JobContext {
                store: store.clone(),
                validator,
                notifier: notifier.clone(),
                result_json_max_bytes: 20_000,
            },
            max_active,
            Duration::from_secs(60),
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        Fixture {
            scheduler,
            store,
            notifier,
            resolver,
        }
    }

    async fn insert_pending(
        store: &MemoryStore,
        target: &str,
        expires_at: DateTime<Utc>,
    ) -> DnsRequest {
        store
            .insert_request(target, RequestType::Email, Utc::now(), expires_at)
            .await
            .unwrap()
    }

    fn fresh_flag() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[tokio::test]
    async fn test_tick_promotes_passing_target_exactly_once() {
        let f = fixture(4);
        pass_dns(&f.resolver, "good.example");
        let row = insert_pending(&f.store, "good.example", Utc::now() + chrono::Duration::hours(1)).await;

        let running = fresh_flag();
        let outcome = f.scheduler.run_check(row.id, "EMAIL:good.example", &running).await;
        assert_eq!(outcome, TickOutcome::Stop);

        let stored = f.store.row(row.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Active);
        assert!(stored.activated_at.is_some());
        assert!(stored.last_check_result_json.is_some());
        assert_eq!(f.store.active_domains(), vec!["good.example"]);
        assert_eq!(
            f.notifier.sent(),
            vec![SentMail::StatusChange(
                "good.example".into(),
                RequestStatus::Active
            )]
        );

        // A second tick sees the terminal row and just stops.
        let outcome = f.scheduler.run_check(row.id, "EMAIL:good.example", &running).await;
        assert_eq!(outcome, TickOutcome::Stop);
        assert_eq!(f.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_expires_overdue_request() {
        let f = fixture(4);
        let row = insert_pending(&f.store, "late.example", Utc::now() - chrono::Duration::seconds(1)).await;

        let running = fresh_flag();
        let outcome = f.scheduler.run_check(row.id, "EMAIL:late.example", &running).await;
        assert_eq!(outcome, TickOutcome::Stop);

        let stored = f.store.row(row.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Expired);
        assert_eq!(stored.fail_reason.as_deref(), Some("Request expired"));
        assert_eq!(
            f.notifier.sent(),
            vec![SentMail::StatusChange(
                "late.example".into(),
                RequestStatus::Expired
            )]
        );
    }

    #[tokio::test]
    async fn test_tick_continues_on_failing_records() {
        let f = fixture(4);
        // Zone resolves but matches nothing.
        f.resolver.mx("wrong.example", &[("other.example", 5)]);
        let row = insert_pending(&f.store, "wrong.example", Utc::now() + chrono::Duration::hours(1)).await;

        let running = fresh_flag();
        let outcome = f.scheduler.run_check(row.id, "EMAIL:wrong.example", &running).await;
        assert_eq!(outcome, TickOutcome::Continue);

        let stored = f.store.row(row.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        assert!(stored.last_checked_at.is_some());
        assert!(stored.next_check_at.is_some());
        assert!(stored.last_check_result_json.is_some());
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn test_tick_records_dns_error_and_keeps_job() {
        let f = fixture(4);
        f.resolver.timeout_for("slow.example");
        let row = insert_pending(&f.store, "slow.example", Utc::now() + chrono::Duration::hours(1)).await;

        let running = fresh_flag();
        let outcome = f.scheduler.run_check(row.id, "EMAIL:slow.example", &running).await;
        assert_eq!(outcome, TickOutcome::Continue);

        let stored = f.store.row(row.id).unwrap();
        assert_eq!(stored.status, RequestStatus::Pending);
        let reason = stored.fail_reason.expect("fail reason should be recorded");
        assert!(reason.contains("timeout") || reason.contains("Timeout"));
    }

    #[tokio::test]
    async fn test_tick_stops_when_row_is_gone() {
        let f = fixture(4);
        let running = fresh_flag();
        let outcome = f.scheduler.run_check(999, "EMAIL:ghost.example", &running).await;
        assert_eq!(outcome, TickOutcome::Stop);
    }

    #[tokio::test]
    async fn test_reentrancy_guard_skips_overlapping_tick() {
        let f = fixture(4);
        pass_dns(&f.resolver, "good.example");
        let row = insert_pending(&f.store, "good.example", Utc::now() + chrono::Duration::hours(1)).await;

        let running = AtomicBool::new(true);
        let outcome = f.scheduler.run_check(row.id, "EMAIL:good.example", &running).await;
        assert_eq!(outcome, TickOutcome::Continue);
        // Nothing was touched while another tick held the flag.
        let stored = f.store.row(row.id).unwrap();
        assert!(stored.last_checked_at.is_none());
        assert_eq!(stored.status, RequestStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_queues_excess_jobs_fifo() {
        let f = fixture(1);
        // Neither target ever passes, so jobs hold their slots.
        let a = insert_pending(&f.store, "a.example", Utc::now() + chrono::Duration::hours(1)).await;
        let b = insert_pending(&f.store, "b.example", Utc::now() + chrono::Duration::hours(1)).await;

        f.scheduler.start_for_request(&a, Duration::ZERO);
        f.scheduler.start_for_request(&b, Duration::ZERO);
        assert_eq!(f.scheduler.active_count(), 1);
        assert_eq!(f.scheduler.queued_count(), 1);

        // Duplicate starts are ignored in both states.
        f.scheduler.start_for_request(&a, Duration::ZERO);
        f.scheduler.start_for_request(&b, Duration::ZERO);
        assert_eq!(f.scheduler.active_count(), 1);
        assert_eq!(f.scheduler.queued_count(), 1);

        // Terminate job A's row; its next tick stops the job, freeing the
        // slot for B.
        let mut terminal = f.store.row(a.id).unwrap();
        terminal.status = RequestStatus::Expired;
        f.store.put_row(terminal);

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_secs(61)).await;
            if f.scheduler.queued_count() == 0 {
                break;
            }
        }
        assert_eq!(f.scheduler.queued_count(), 0);
        assert_eq!(f.scheduler.active_count(), 1);
        let _ = b;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_pending_reconstructs_live_jobs_only() {
        let f = fixture(8);
        insert_pending(&f.store, "one.example", Utc::now() + chrono::Duration::hours(1)).await;
        insert_pending(&f.store, "two.example", Utc::now() + chrono::Duration::hours(1)).await;
        // Already past deadline: not resumed.
        insert_pending(&f.store, "dead.example", Utc::now() - chrono::Duration::hours(1)).await;
        // Terminal: not resumed.
        let done = insert_pending(&f.store, "done.example", Utc::now() + chrono::Duration::hours(1)).await;
        let mut done_row = f.store.row(done.id).unwrap();
        done_row.status = RequestStatus::Active;
        f.store.put_row(done_row);

        let resumed = f.scheduler.resume_pending().await.unwrap();
        assert_eq!(resumed, 2);
        assert_eq!(f.scheduler.active_count() + f.scheduler.queued_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_count_never_exceeds_cap() {
        let f = fixture(2);
        for i in 0..6 {
            let row = insert_pending(
                &f.store,
                &format!("t{i}.example"),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await;
            f.scheduler.start_for_request(&row, Duration::ZERO);
            assert!(f.scheduler.active_count() <= 2);
        }
        assert_eq!(f.scheduler.active_count(), 2);
        assert_eq!(f.scheduler.queued_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_token_tears_jobs_down() {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let resolver = Arc::new(MockResolver::new());
        let validator = Arc::new(Validator::new(resolver, profile(), dns_settings()));
        let shutdown = CancellationToken::new();
        let scheduler = JobScheduler::new(
            JobContext {
                store: store.clone(),
                validator,
                notifier,
                result_json_max_bytes: 20_000,
            },
            4,
            Duration::from_secs(60),
            Duration::ZERO,
            shutdown.clone(),
        );

        let row = store
            .insert_request(
                "t.example",
                RequestType::Email,
                Utc::now(),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        scheduler.start_for_request(&row, Duration::ZERO);
        assert_eq!(scheduler.active_count(), 1);

        shutdown.cancel();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if scheduler.active_count() == 0 {
                break;
            }
        }
        assert_eq!(scheduler.active_count(), 0);
    }
}
