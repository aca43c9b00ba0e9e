//! Sync scheduling.
//!
//! Decides *when* a sync cycle runs; `SyncClient` decides *what* it does.
//!
//! - Change events (re)arm a single debounce timer
//! - Only one cycle runs at a time; requests during a cycle are coalesced
//!   into one retry after it finishes
//! - Cycle starts are rate limited; early requests are deferred, not dropped
//! - Manual sync skips the rate limit and reports its outcome
//!
//! The timing rules live in `SchedulerState`, which takes the current time
//! as an argument so it can be driven by a fake clock. `SyncScheduler` owns a
//! background worker that feeds it events and timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::CloudSyncConfig;
use crate::events::{ChangeEvent, EventBus};
use crate::remote::RemoteStore;
use crate::sync_client::{RestoreResult, SyncClient, SyncResult};

/// Source of the current time for scheduling decisions
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// Clock backed by tokio's timer (follows paused time in tests)
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Where the scheduler is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    /// A retry timer is armed
    PendingRetry,
}

/// Decision for a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Start a cycle now
    Run,
    /// Folded into a cycle that is running or already armed
    Coalesced,
    /// Too soon after the last start; retry after the delay
    Deferred(Duration),
}

/// Timing rules of the scheduler, free of any I/O.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    phase: SyncPhase,
    pending: bool,
    last_sync_at: Option<Instant>,
    min_interval: Duration,
    idle_debounce: Duration,
    recent_debounce: Duration,
    recent_window: Duration,
    retry_delay: Duration,
}

impl SchedulerState {
    pub fn new(config: &CloudSyncConfig) -> Self {
        Self {
            phase: SyncPhase::Idle,
            pending: false,
            last_sync_at: None,
            min_interval: config.min_interval(),
            idle_debounce: config.idle_debounce(),
            recent_debounce: config.recent_debounce(),
            recent_window: config.recent_window(),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_sync_at(&self) -> Option<Instant> {
        self.last_sync_at
    }

    /// Debounce delay for a change seen at `now`: longer right after a sync
    pub fn debounce_delay(&self, now: Instant) -> Duration {
        match self.last_sync_at {
            Some(last) if now.saturating_duration_since(last) < self.recent_window => {
                self.recent_debounce
            }
            _ => self.idle_debounce,
        }
    }

    /// Decide what to do with a sync request arriving at `now`.
    pub fn admit(&mut self, now: Instant, bypass_rate_limit: bool) -> Admission {
        match self.phase {
            SyncPhase::Syncing => {
                self.pending = true;
                return Admission::Coalesced;
            }
            SyncPhase::PendingRetry if !bypass_rate_limit => return Admission::Coalesced,
            _ => {}
        }

        if !bypass_rate_limit {
            if let Some(last) = self.last_sync_at {
                let elapsed = now.saturating_duration_since(last);
                if elapsed < self.min_interval {
                    self.phase = SyncPhase::PendingRetry;
                    return Admission::Deferred(self.min_interval - elapsed);
                }
            }
        }

        self.phase = SyncPhase::Syncing;
        self.pending = false;
        self.last_sync_at = Some(now);
        Admission::Run
    }

    /// Record the end of a cycle. Returns the retry delay when a request
    /// arrived while it was running.
    pub fn complete(&mut self, now: Instant, success: bool) -> Option<Duration> {
        if success {
            self.last_sync_at = Some(now);
        }
        if self.pending {
            self.pending = false;
            self.phase = SyncPhase::PendingRetry;
            Some(self.retry_delay)
        } else {
            self.phase = SyncPhase::Idle;
            None
        }
    }

    /// Hold the single-flight slot for a startup restore. Requests that
    /// arrive meanwhile are coalesced into one cycle after it.
    ///
    /// Returns false if a cycle is already running.
    pub fn begin_restore(&mut self) -> bool {
        if self.phase == SyncPhase::Syncing {
            return false;
        }
        self.phase = SyncPhase::Syncing;
        true
    }

    /// The armed retry timer fired
    pub fn retry_fired(&mut self) {
        if self.phase == SyncPhase::PendingRetry {
            self.phase = SyncPhase::Idle;
        }
    }
}

/// Outcome reported to a manual sync caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualSyncResult {
    pub success: bool,
    pub message: String,
}

impl ManualSyncResult {
    fn new(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
        }
    }
}

impl From<&SyncResult> for ManualSyncResult {
    fn from(result: &SyncResult) -> Self {
        if result.success {
            Self::new(true, "Sync completed")
        } else if result.errors.is_empty() {
            Self::new(false, "Sync failed")
        } else {
            Self::new(false, result.errors.join("; "))
        }
    }
}

/// What `startup` decided to do
#[derive(Debug, Clone)]
pub enum StartupAction {
    /// Cloud sync is off
    Skipped,
    /// Local notes exist; a merge cycle was scheduled
    Merge,
    /// Local store was empty; the remote snapshot was pulled first
    Restored(RestoreResult),
}

type Responder = oneshot::Sender<ManualSyncResult>;

enum Command {
    Schedule(String),
    Manual(Responder),
    Restore(oneshot::Sender<RestoreResult>),
    Finished {
        result: SyncResult,
        responder: Option<Responder>,
    },
    Restored {
        result: RestoreResult,
        responder: oneshot::Sender<RestoreResult>,
    },
    Shutdown,
}

/// Background sync scheduler
pub struct SyncScheduler<R> {
    client: Arc<SyncClient<R>>,
    commands: mpsc::UnboundedSender<Command>,
    enabled: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteStore + 'static> SyncScheduler<R> {
    /// Start the scheduler with tokio's clock. Must be called within a
    /// tokio runtime.
    pub fn start(client: SyncClient<R>, bus: &EventBus, config: &CloudSyncConfig) -> Self {
        Self::start_with_clock(client, bus, config, Arc::new(TokioClock))
    }

    pub fn start_with_clock(
        client: SyncClient<R>,
        bus: &EventBus,
        config: &CloudSyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = Arc::new(client);
        let enabled = Arc::new(AtomicBool::new(config.enabled));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Worker {
            client: client.clone(),
            enabled: enabled.clone(),
            state: SchedulerState::new(config),
            clock,
            commands: rx,
            completions: tx.clone(),
            events: Some(bus.subscribe()),
            debounce_deadline: None,
            debounce_reason: String::new(),
            retry_deadline: None,
        };
        let handle = tokio::spawn(worker.run());

        tracing::info!(
            provider = client.provider_name(),
            key = %client.object_key(),
            enabled = config.enabled,
            "Sync scheduler started"
        );

        Self {
            client,
            commands: tx,
            enabled,
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn client(&self) -> &SyncClient<R> {
        &self.client
    }

    /// Ask for a cycle after the debounce delay
    pub fn schedule(&self, reason: &str) {
        if !self.is_enabled() {
            return;
        }
        if self.commands.send(Command::Schedule(reason.to_string())).is_err() {
            tracing::warn!(reason = %reason, "Sync scheduler is not running");
        }
    }

    /// Startup policy: restore an empty device from the remote snapshot,
    /// otherwise reconcile with a regular cycle.
    pub async fn startup(&self) -> StartupAction {
        if !self.is_enabled() {
            return StartupAction::Skipped;
        }

        match self.client.has_local_notes() {
            Ok(true) => {
                self.schedule("startup-merge");
                StartupAction::Merge
            }
            Ok(false) => {
                let (tx, rx) = oneshot::channel();
                if self.commands.send(Command::Restore(tx)).is_err() {
                    tracing::warn!("Sync scheduler is not running, skipping restore");
                    return StartupAction::Skipped;
                }
                let restored = rx.await.unwrap_or_default();
                self.schedule("post-restore");
                StartupAction::Restored(restored)
            }
            Err(e) => {
                // An unreadable store must never be pushed over remote data
                tracing::error!(error = %e, "Could not inspect local notes at startup");
                StartupAction::Skipped
            }
        }
    }

    /// Run a cycle now, skipping the rate limit, and report how it went.
    pub async fn manual_sync(&self) -> ManualSyncResult {
        if !self.is_enabled() {
            return ManualSyncResult::new(false, "Cloud sync is disabled");
        }

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Manual(tx)).is_err() {
            return ManualSyncResult::new(false, "Sync scheduler is not running");
        }
        rx.await
            .unwrap_or_else(|_| ManualSyncResult::new(false, "Sync scheduler stopped"))
    }

    /// Stop the worker. A cycle already running is allowed to finish.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Sync scheduler worker failed");
            }
        }
    }
}

struct Worker<R> {
    client: Arc<SyncClient<R>>,
    enabled: Arc<AtomicBool>,
    state: SchedulerState,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedSender<Command>,
    events: Option<broadcast::Receiver<ChangeEvent>>,
    debounce_deadline: Option<Instant>,
    debounce_reason: String,
    retry_deadline: Option<Instant>,
}

impl<R: RemoteStore + 'static> Worker<R> {
    async fn run(mut self) {
        // Placeholder deadline for disabled timer branches
        let far_future = Instant::now() + Duration::from_secs(365 * 24 * 3600);

        loop {
            let debounce_at = self.debounce_deadline.unwrap_or(far_future);
            let retry_at = self.retry_deadline.unwrap_or(far_future);

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Schedule(reason)) => self.arm_debounce(reason),
                        Some(Command::Manual(responder)) => {
                            self.request("manual", true, Some(responder));
                        }
                        Some(Command::Restore(responder)) => self.restore(responder),
                        Some(Command::Finished { result, responder }) => {
                            self.finish(result, responder);
                        }
                        Some(Command::Restored { result, responder }) => {
                            self.finish_restore(result, responder);
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                event = recv_event(&mut self.events), if self.events.is_some() => {
                    match event {
                        Ok(event) => self.arm_debounce(event.part.as_str()),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped = skipped, "Change events lagged");
                            self.arm_debounce("lagged".to_string());
                        }
                        Err(broadcast::error::RecvError::Closed) => self.events = None,
                    }
                }
                () = sleep_until(debounce_at), if self.debounce_deadline.is_some() => {
                    self.debounce_deadline = None;
                    let reason = std::mem::take(&mut self.debounce_reason);
                    self.request(&reason, false, None);
                }
                () = sleep_until(retry_at), if self.retry_deadline.is_some() => {
                    self.retry_deadline = None;
                    self.state.retry_fired();
                    self.request("retry", false, None);
                }
            }
        }

        tracing::debug!("Sync scheduler worker finished");
    }

    fn arm_debounce(&mut self, reason: String) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let now = self.clock.now();
        let delay = self.state.debounce_delay(now);
        tracing::debug!(reason = %reason, delay_ms = delay.as_millis() as u64, "Sync scheduled");
        self.debounce_deadline = Some(now + delay);
        self.debounce_reason = reason;
    }

    fn request(&mut self, reason: &str, bypass_rate_limit: bool, responder: Option<Responder>) {
        if !self.enabled.load(Ordering::SeqCst) {
            tracing::debug!(reason = %reason, "Cloud sync disabled, skipping");
            if let Some(responder) = responder {
                let _ = responder.send(ManualSyncResult::new(false, "Cloud sync is disabled"));
            }
            return;
        }
        let now = self.clock.now();
        match self.state.admit(now, bypass_rate_limit) {
            Admission::Run => {
                self.retry_deadline = None;
                self.launch(reason, responder);
            }
            Admission::Coalesced => {
                tracing::debug!(reason = %reason, "Sync request coalesced");
                if let Some(responder) = responder {
                    let _ = responder.send(ManualSyncResult::new(
                        true,
                        "Sync already in progress, another cycle is queued",
                    ));
                }
            }
            Admission::Deferred(delay) => {
                tracing::debug!(
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Sync rate limited, deferring"
                );
                self.retry_deadline = Some(now + delay);
            }
        }
    }

    fn launch(&self, reason: &str, responder: Option<Responder>) {
        tracing::debug!(reason = %reason, "Starting sync cycle");
        let client = self.client.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = client.run_cycle().await;
            let _ = completions.send(Command::Finished { result, responder });
        });
    }

    fn restore(&mut self, responder: oneshot::Sender<RestoreResult>) {
        if !self.state.begin_restore() {
            tracing::warn!("Sync cycle already running, skipping restore");
            let _ = responder.send(RestoreResult {
                warnings: vec!["Sync already in progress".to_string()],
                ..Default::default()
            });
            return;
        }

        tracing::debug!("Starting restore from remote");
        let client = self.client.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = client.restore_from_remote().await;
            let _ = completions.send(Command::Restored { result, responder });
        });
    }

    fn finish_restore(&mut self, result: RestoreResult, responder: oneshot::Sender<RestoreResult>) {
        let now = self.clock.now();
        // Does not count toward the rate limit
        if let Some(delay) = self.state.complete(now, false) {
            self.retry_deadline = Some(now + delay);
        }
        let _ = responder.send(result);
    }

    fn finish(&mut self, result: SyncResult, responder: Option<Responder>) {
        let now = self.clock.now();
        if let Some(delay) = self.state.complete(now, result.success) {
            self.retry_deadline = Some(now + delay);
        }
        if !result.success {
            tracing::warn!(errors = ?result.errors, "Sync cycle failed");
        }
        if let Some(responder) = responder {
            let _ = responder.send(ManualSyncResult::from(&result));
        }
    }
}

async fn recv_event(
    events: &mut Option<broadcast::Receiver<ChangeEvent>>,
) -> Result<ChangeEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
