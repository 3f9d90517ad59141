//! # Sync Engine
//!
//! Main orchestrator: decides when a run happens, runs push then pull, and
//! owns the process-wide [`SyncStatus`].
//!
//! ## Run Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Run                                         │
//! │                                                                         │
//! │  trigger_sync() / sync() / initial_sync()                               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  run in flight? ── yes ──► request one follow-up, await the same run    │
//! │        │ no                                                             │
//! │        ▼                                                                │
//! │  signed in? reachable? sync enabled?  ── no ──► skipped (no change)     │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  state = syncing                                                        │
//! │  [initial]  full pull (absence-based deletion), marker per owner        │
//! │  push       until drained / no progress / transient / max passes        │
//! │  pull       incremental, every table                                    │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  success  → idle,  last_sync_at = now                                   │
//! │  partial  → idle,  retry scheduled with exponential backoff             │
//! │  fatal    → error, last_error set (auth lost, local store failure)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Triggers by Mode
//! ```text
//! ┌──────────────────────┬────────┬────────┬─────────┐
//! │ Trigger              │ auto   │ manual │ offline │
//! ├──────────────────────┼────────┼────────┼─────────┤
//! │ AuthChanged          │ ✓      │ ✓      │         │
//! │ Manual               │ ✓      │ ✓      │         │
//! │ Foreground           │ ✓      │        │         │
//! │ ConnectivityRestored │ ✓      │        │         │
//! │ Retry                │ ✓      │        │         │
//! └──────────────────────┴────────┴────────┴─────────┘
//! ```

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ironlog_core::{SyncNotice, SyncState, SyncStatus};
use ironlog_db::{now_millis, Database};

use crate::config::{SyncConfig, SyncMode, SyncSettings};
use crate::connectivity::{spawn_probe_loop, Connectivity, TcpProbe};
use crate::error::{SyncError, SyncErrorKind, SyncResult};
use crate::events::{NoOpEmitter, SyncEventEmitter};
use crate::pull::{PullMode, PullPipeline, PullReport};
use crate::push::{PushPipeline, PushReport, PushSettings};
use crate::remote::RemoteBackend;

/// Meta key holding the owner the local cursors belong to.
const OWNER_KEY: &str = "owner";

fn initial_sync_key(owner: &str) -> String {
    format!("initial_sync:{}", owner)
}

// =============================================================================
// Triggers & Reports
// =============================================================================

/// Why a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AuthChanged,
    Foreground,
    ConnectivityRestored,
    Manual,
    Retry,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::AuthChanged => write!(f, "auth_changed"),
            Trigger::Foreground => write!(f, "foreground"),
            Trigger::ConnectivityRestored => write!(f, "connectivity_restored"),
            Trigger::Manual => write!(f, "manual"),
            Trigger::Retry => write!(f, "retry"),
        }
    }
}

/// Regular run or first run after sign-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Regular,
    Initial,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queue drained, pull applied.
    Success,
    /// Finished with non-fatal errors (transient failures, rejections).
    Partial,
    /// Ended early; the status is `error`.
    Fatal,
    /// Not started: signed out, unreachable or sync disabled.
    Skipped,
}

/// Result of one sync run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub kind: RunKind,
    pub outcome: RunOutcome,
    pub push: PushReport,
    pub pull: PullReport,
    /// Whether the incremental pull over all tables finished.
    pub pull_completed: bool,
    pub error: Option<String>,
    pub error_kind: Option<SyncErrorKind>,
}

impl SyncReport {
    fn new(kind: RunKind) -> Self {
        SyncReport {
            kind,
            outcome: RunOutcome::Success,
            push: PushReport::default(),
            pull: PullReport::default(),
            pull_completed: false,
            error: None,
            error_kind: None,
        }
    }

    fn ended(kind: RunKind, outcome: RunOutcome, reason: &SyncError) -> Self {
        SyncReport {
            outcome,
            error: Some(reason.to_string()),
            error_kind: Some(reason.kind()),
            ..Self::new(kind)
        }
    }

    /// All notices raised by the run, push first.
    pub fn notices(&self) -> Vec<SyncNotice> {
        self.push
            .notices
            .iter()
            .chain(self.pull.notices.iter())
            .cloned()
            .collect()
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Coalescing slot for the single in-flight run.
#[derive(Default)]
struct RunSlot {
    /// Completion signal of the current run loop.
    in_flight: Option<watch::Receiver<Option<SyncReport>>>,
    /// Run requested while one was in flight.
    follow_up: Option<RunKind>,
}

struct Inner {
    config: SyncConfig,
    db: Database,
    push: PushPipeline,
    pull: PullPipeline,
    connectivity: Connectivity,
    emitter: Arc<dyn SyncEventEmitter>,
    status: watch::Sender<SyncStatus>,
    owner: RwLock<Option<String>>,
    runs: StdMutex<RunSlot>,
    backoff: Mutex<ExponentialBackoff>,
    retry: Mutex<Option<JoinHandle<()>>>,
    /// Pending-count watcher and reachability probe.
    background: StdMutex<Vec<JoinHandle<()>>>,
}

/// The sync engine. Cloning is cheap; clones share one engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

fn create_backoff(settings: &SyncSettings) -> ExponentialBackoff {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(settings.initial_backoff_ms),
        max_interval: Duration::from_secs(settings.max_backoff_secs),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();
    backoff
}

impl SyncEngine {
    /// Creates an engine with a no-op emitter and a reachable connectivity
    /// flag.
    pub fn new(config: SyncConfig, db: Database, remote: Arc<dyn RemoteBackend>) -> Self {
        Self::with_parts(
            config,
            db,
            remote,
            Connectivity::default(),
            Arc::new(NoOpEmitter),
        )
    }

    fn with_parts(
        config: SyncConfig,
        db: Database,
        remote: Arc<dyn RemoteBackend>,
        connectivity: Connectivity,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        let push = PushPipeline::new(db.clone(), remote.clone(), PushSettings::from(&config));
        let pull = PullPipeline::new(db.clone(), remote, config.remote.request_timeout());
        let (status, _) = watch::channel(SyncStatus::default());
        let backoff = create_backoff(&config.sync);

        let engine = SyncEngine {
            inner: Arc::new(Inner {
                config,
                db,
                push,
                pull,
                connectivity,
                emitter,
                status,
                owner: RwLock::new(None),
                runs: StdMutex::new(RunSlot::default()),
                backoff: Mutex::new(backoff),
                retry: Mutex::new(None),
                background: StdMutex::new(Vec::new()),
            }),
        };
        engine.start_background();
        engine
    }

    /// Starts the pending-count watcher, and the reachability probe when a
    /// remote endpoint is configured. Both stop on [`SyncEngine::shutdown`].
    fn start_background(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime, sync background tasks not started");
            return;
        }

        let mut tasks = vec![spawn_pending_watcher(&self.inner)];

        let remote = &self.inner.config.remote;
        match remote.endpoint_url() {
            Ok(Some(url)) => match TcpProbe::from_url(&url, remote.request_timeout()) {
                Ok(probe) => {
                    let interval = Duration::from_secs(self.inner.config.sync.probe_interval_secs);
                    info!(address = probe.address(), ?interval, "Starting reachability probe");
                    tasks.push(spawn_probe_loop(
                        Arc::new(probe),
                        self.inner.connectivity.clone(),
                        interval,
                    ));
                }
                Err(e) => warn!(error = %e, "Cannot probe remote endpoint"),
            },
            Ok(None) => debug!("No remote endpoint, reachability is reported by the host"),
            Err(e) => warn!(error = %e, "Invalid remote endpoint, probe not started"),
        }

        self.background_tasks().extend(tasks);
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.inner.connectivity
    }

    /// Returns the current sync status.
    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    /// Observes status changes. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    /// The signed-in owner, if any.
    pub async fn owner(&self) -> Option<String> {
        self.inner.owner.read().await.clone()
    }

    // =========================================================================
    // Entry Points
    // =========================================================================

    /// Reacts to sign-in (`Some`) or sign-out (`None`).
    ///
    /// Sign-in triggers the initial sync the first time an owner is seen on
    /// this device, a regular sync otherwise. Signing in as a different
    /// owner resets the pull cursors.
    pub async fn on_auth_changed(&self, owner: Option<String>) -> SyncResult<()> {
        let Some(owner) = owner else {
            self.sign_out().await;
            return Ok(());
        };

        let cursors = self.inner.db.cursors();
        let previous = cursors.get_meta(OWNER_KEY).await?;
        if previous.as_deref() != Some(owner.as_str()) {
            if previous.is_some() {
                info!(owner = %owner, "Signed in as a different owner, resetting cursors");
                cursors.reset_all().await?;
            }
            cursors.set_meta(OWNER_KEY, &owner).await?;
        }

        let needs_initial = cursors.get_meta(&initial_sync_key(&owner)).await?.is_none();
        *self.inner.owner.write().await = Some(owner.clone());
        self.refresh_pending_count().await?;

        info!(owner = %owner, needs_initial, "Signed in");
        if needs_initial {
            if self.accepts(Trigger::AuthChanged) {
                self.trigger_initial_sync();
            }
        } else {
            self.trigger_sync(Trigger::AuthChanged);
        }
        Ok(())
    }

    async fn sign_out(&self) {
        info!("Signed out, resetting sync status");
        *self.inner.owner.write().await = None;
        self.cancel_retry().await;
        self.inner.backoff.lock().await.reset();
        self.update_status(|status| *status = SyncStatus::default());
    }

    /// Starts a sync in the background if `trigger` is allowed in the
    /// current mode. Returns false if it was ignored.
    pub fn trigger_sync(&self, trigger: Trigger) -> bool {
        if !self.accepts(trigger) {
            debug!(%trigger, mode = %self.inner.config.mode(), "Trigger ignored");
            return false;
        }

        debug!(%trigger, "Sync triggered");
        let engine = self.clone();
        tokio::spawn(async move {
            engine.sync().await;
        });
        true
    }

    /// Starts the initial sync in the background.
    pub fn trigger_initial_sync(&self) -> bool {
        if !self.inner.config.mode().is_sync_enabled() {
            return false;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            engine.initial_sync().await;
        });
        true
    }

    /// Runs a sync, or waits for the one in flight.
    pub async fn sync(&self) -> SyncReport {
        self.request(RunKind::Regular).await
    }

    /// Runs the initial sync for the signed-in owner. Falls back to a
    /// regular sync once the owner's initial sync has completed.
    pub async fn initial_sync(&self) -> SyncReport {
        self.request(RunKind::Initial).await
    }

    /// Re-reads the queue length into the status. Local writes through
    /// [`Database::records`] trigger this on their own.
    pub async fn refresh_pending_count(&self) -> SyncResult<i64> {
        let pending = self.inner.db.queue().count_pending().await?;
        if self.inner.status.borrow().pending_count != pending {
            self.update_status(|status| status.pending_count = pending);
        }
        Ok(pending)
    }

    /// Cancels a scheduled retry and stops the background tasks. In-flight
    /// runs finish on their own.
    pub async fn shutdown(&self) {
        info!("Shutting down sync engine");
        self.cancel_retry().await;
        for task in self.background_tasks().drain(..) {
            task.abort();
        }
    }

    /// Refreshes the pending count unless signed out (where it stays zero).
    async fn refresh_pending_if_signed_in(&self) -> SyncResult<()> {
        if self.owner().await.is_some() {
            self.refresh_pending_count().await?;
        }
        Ok(())
    }

    fn background_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self) -> MutexGuard<'_, RunSlot> {
        self.inner.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepts(&self, trigger: Trigger) -> bool {
        match self.inner.config.mode() {
            SyncMode::Offline => false,
            SyncMode::Manual => matches!(trigger, Trigger::AuthChanged | Trigger::Manual),
            SyncMode::Auto => true,
        }
    }

    // =========================================================================
    // Run Coalescing
    // =========================================================================

    async fn request(&self, kind: RunKind) -> SyncReport {
        let mut done = {
            let mut slot = self.slot();
            match &slot.in_flight {
                Some(running) => {
                    let running = running.clone();
                    slot.follow_up = match slot.follow_up {
                        Some(RunKind::Initial) => Some(RunKind::Initial),
                        _ => Some(kind),
                    };
                    debug!(?kind, "Run in flight, coalescing");
                    running
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    slot.in_flight = Some(rx.clone());
                    tokio::spawn(self.clone().run_loop(kind, tx));
                    rx
                }
            }
        };

        let report = done.wait_for(Option::is_some).await.ok().and_then(|r| r.clone());
        report.unwrap_or_else(|| {
            error!("Sync run ended without a report");
            SyncReport::ended(
                kind,
                RunOutcome::Fatal,
                &SyncError::Internal("sync run ended unexpectedly".into()),
            )
        })
    }

    async fn run_loop(self, mut kind: RunKind, done: watch::Sender<Option<SyncReport>>) {
        let mut guard = RunGuard {
            engine: self.clone(),
            finished: false,
        };

        loop {
            let report = self.run_once(kind).await;

            let next = {
                let mut slot = self.slot();
                let next = slot.follow_up.take().filter(|_| {
                    matches!(report.outcome, RunOutcome::Success | RunOutcome::Partial)
                });
                if next.is_none() {
                    slot.in_flight = None;
                }
                next
            };

            match next {
                Some(follow_up) => {
                    debug!(?follow_up, "Running follow-up sync");
                    kind = follow_up;
                }
                None => {
                    guard.finished = true;
                    done.send_replace(Some(report));
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Single Run
    // =========================================================================

    async fn run_once(&self, kind: RunKind) -> SyncReport {
        if !self.inner.config.mode().is_sync_enabled() {
            debug!("Sync disabled, skipping run");
            return self
                .skipped(kind, SyncError::InvalidConfig("sync mode is offline".into()))
                .await;
        }
        let Some(owner) = self.owner().await else {
            debug!("No owner signed in, skipping run");
            return self.skipped(kind, SyncError::NotSignedIn).await;
        };
        if !self.inner.connectivity.is_reachable() {
            debug!("Remote unreachable, skipping run");
            return self.skipped(kind, SyncError::Unreachable).await;
        }

        info!(owner = %owner, ?kind, "Sync run started");
        self.update_status(|status| {
            status.state = SyncState::Syncing;
            status.notices.clear();
        });

        let mut report = SyncReport::new(kind);
        let result = self.execute(&owner, &mut report).await;
        self.finish(&owner, report, result).await
    }

    async fn skipped(&self, kind: RunKind, reason: SyncError) -> SyncReport {
        if let Err(e) = self.refresh_pending_if_signed_in().await {
            warn!(error = %e, "Failed to count pending mutations");
        }
        SyncReport::ended(kind, RunOutcome::Skipped, &reason)
    }

    async fn execute(&self, owner: &str, report: &mut SyncReport) -> SyncResult<()> {
        let cursors = self.inner.db.cursors();

        if report.kind == RunKind::Initial {
            let marker = initial_sync_key(owner);
            if cursors.get_meta(&marker).await?.is_some() {
                report.kind = RunKind::Regular;
            } else {
                self.inner.pull.run(owner, PullMode::Full, &mut report.pull).await?;
                cursors.set_meta(&marker, &now_millis().to_string()).await?;
                info!(owner, "Initial sync pull complete");
            }
        }

        self.inner.push.run(owner, &mut report.push).await?;
        self.inner
            .pull
            .run(owner, PullMode::Incremental, &mut report.pull)
            .await?;
        report.pull_completed = true;
        Ok(())
    }

    async fn finish(
        &self,
        owner: &str,
        mut report: SyncReport,
        result: SyncResult<()>,
    ) -> SyncReport {
        report.outcome = match &result {
            Ok(()) if report.push.has_transient_failures() || report.push.dropped > 0 => {
                RunOutcome::Partial
            }
            Ok(()) => RunOutcome::Success,
            Err(e) if e.is_fatal() => RunOutcome::Fatal,
            Err(_) => RunOutcome::Partial,
        };

        match &result {
            Err(e) => {
                report.error = Some(e.to_string());
                report.error_kind = Some(e.kind());
            }
            Ok(()) => {
                if let Some(message) = &report.push.last_transient_error {
                    report.error = Some(message.clone());
                    report.error_kind = Some(SyncErrorKind::NetworkTransient);
                }
            }
        }

        let pending = self.inner.db.queue().count_pending().await;
        if let Err(e) = &pending {
            warn!(error = %e, "Failed to count pending mutations");
        }

        // The owner signed out or changed while this run was in flight.
        if self.owner().await.as_deref() != Some(owner) {
            info!(owner, outcome = ?report.outcome, "Owner changed during the run, status left untouched");
            return report;
        }

        let notices = report.notices();
        for notice in &notices {
            self.inner.emitter.emit_notice(notice);
        }

        let now = now_millis();
        let outcome = report.outcome;
        let fatal_error = report.error.clone();
        let pull_completed = report.pull_completed;
        self.update_status(move |status| {
            status.notices = notices;
            if let Ok(pending) = pending {
                status.pending_count = pending;
            }
            if outcome == RunOutcome::Fatal {
                status.state = SyncState::Error;
                status.last_error = fatal_error;
            } else {
                status.state = SyncState::Idle;
                status.last_error = None;
                if pull_completed {
                    status.last_sync_at = Some(now);
                }
            }
        });

        let transient = report.push.has_transient_failures()
            || result.as_ref().err().is_some_and(SyncError::is_retryable);

        match report.outcome {
            RunOutcome::Fatal => {
                error!(error = ?report.error, "Sync run failed");
                self.cancel_retry().await;
            }
            _ if transient => {
                warn!(error = ?report.error, "Sync run hit transient failures");
                self.schedule_retry().await;
            }
            outcome => {
                info!(
                    ?outcome,
                    pushed = report.push.acked,
                    pulled = report.pull.received,
                    notices = report.push.notices.len() + report.pull.notices.len(),
                    "Sync run complete"
                );
                self.inner.backoff.lock().await.reset();
            }
        }

        report
    }

    // =========================================================================
    // Retry
    // =========================================================================

    async fn schedule_retry(&self) {
        if !self.inner.config.mode().allows_background() {
            debug!("Automatic retry disabled in this mode");
            return;
        }

        let Some(delay) = self.inner.backoff.lock().await.next_backoff() else {
            return;
        };

        info!(delay_ms = delay.as_millis() as u64, "Scheduling sync retry");
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            engine.trigger_sync(Trigger::Retry);
        });

        if let Some(previous) = self.inner.retry.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn cancel_retry(&self) {
        if let Some(handle) = self.inner.retry.lock().await.take() {
            handle.abort();
        }
    }

    fn update_status(&self, modify: impl FnOnce(&mut SyncStatus)) {
        self.inner.status.send_modify(modify);
        let snapshot = self.inner.status.borrow().clone();
        self.inner.emitter.emit_status(&snapshot);
    }
}

/// Releases the run slot if a run loop unwinds, so later requests start a
/// fresh run instead of waiting on a dead one.
struct RunGuard {
    engine: SyncEngine,
    finished: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        error!("Sync run aborted");
        {
            let mut slot = self.engine.slot();
            slot.in_flight = None;
            slot.follow_up = None;
        }
        self.engine.update_status(|status| {
            status.state = SyncState::Error;
            status.last_error = Some("sync run aborted".into());
        });
    }
}

/// Keeps `pending_count` current as the app writes locally.
fn spawn_pending_watcher(inner: &Arc<Inner>) -> JoinHandle<()> {
    let mut changes = inner.db.subscribe_changes();
    let inner = Arc::downgrade(inner);

    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let engine = SyncEngine { inner };
            if let Err(e) = engine.refresh_pending_if_signed_in().await {
                warn!(error = %e, "Failed to refresh pending count");
            }
        }
    })
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating a SyncEngine with options.
pub struct SyncEngineBuilder {
    config: SyncConfig,
    db: Option<Database>,
    remote: Option<Arc<dyn RemoteBackend>>,
    connectivity: Option<Connectivity>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
}

impl SyncEngineBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncEngineBuilder {
            config,
            db: None,
            remote: None,
            connectivity: None,
            emitter: None,
        }
    }

    /// Sets the local store.
    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the remote backend.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteBackend>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Shares a connectivity flag with a probe or platform callback.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Builds the SyncEngine.
    pub fn build(self) -> SyncResult<SyncEngine> {
        self.config.validate()?;

        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| SyncError::InvalidConfig("Remote backend required".into()))?;

        Ok(SyncEngine::with_parts(
            self.config,
            db,
            remote,
            self.connectivity.unwrap_or_default(),
            self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingEmitter;
    use crate::memory::InMemoryRemote;
    use crate::remote::{CreatedRecord, RemoteResult};
    use async_trait::async_trait;
    use ironlog_core::{EntityTable, Payload, RemoteRecord};
    use ironlog_db::DbConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Remote whose first listing panics, as a buggy client would.
    struct PanicsOnce {
        remote: InMemoryRemote,
        armed: AtomicBool,
    }

    #[async_trait]
    impl RemoteBackend for PanicsOnce {
        async fn list_changed_since(
            &self,
            table: EntityTable,
            owner: &str,
            cursor: i64,
        ) -> RemoteResult<Vec<RemoteRecord>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                panic!("remote client bug");
            }
            self.remote.list_changed_since(table, owner, cursor).await
        }

        async fn create_record(
            &self,
            table: EntityTable,
            owner: &str,
            payload: &Payload,
        ) -> RemoteResult<CreatedRecord> {
            self.remote.create_record(table, owner, payload).await
        }

        async fn update_record(
            &self,
            table: EntityTable,
            remote_id: &str,
            payload: &Payload,
        ) -> RemoteResult<i64> {
            self.remote.update_record(table, remote_id, payload).await
        }

        async fn delete_record(&self, table: EntityTable, remote_id: &str) -> RemoteResult<()> {
            self.remote.delete_record(table, remote_id).await
        }
    }

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn manual_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Manual;
        config
    }

    async fn setup(config: SyncConfig) -> (SyncEngine, Arc<InMemoryRemote>) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(InMemoryRemote::new());
        (SyncEngine::new(config, db, remote.clone()), remote)
    }

    #[test]
    fn test_builder_requires_database() {
        let result = SyncEngineBuilder::new(SyncConfig::default())
            .with_remote(Arc::new(InMemoryRemote::new()))
            .build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_skipped_when_signed_out() {
        let (engine, remote) = setup(manual_config()).await;
        let report = engine.sync().await;

        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(report.error.as_deref(), Some("No user signed in"));
        assert_eq!(engine.status().state, SyncState::Idle);
        assert!(remote.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_when_unreachable() {
        let (engine, remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());
        engine.connectivity().set_reachable(false);

        let report = engine.sync().await;
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(report.error_kind, Some(SyncErrorKind::NetworkTransient));
        assert!(remote.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_skipped_run_reports_pending_count() {
        let (engine, _remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());
        engine.connectivity().set_reachable(false);

        let records = engine.database().records();
        for name in ["Push", "Pull", "Legs"] {
            records
                .create(EntityTable::Schema, payload(json!({ "name": name })))
                .await
                .unwrap();
        }

        let report = engine.sync().await;
        assert_eq!(report.outcome, RunOutcome::Skipped);
        assert_eq!(engine.status().pending_count, 3);
    }

    #[tokio::test]
    async fn test_local_writes_update_pending_count() {
        let (engine, _remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());
        let mut status = engine.subscribe();

        let records = engine.database().records();
        records
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        records
            .create(EntityTable::Schema, payload(json!({ "name": "Upper/Lower" })))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            status.wait_for(|s| s.pending_count == 2),
        )
        .await
        .expect("pending count not refreshed")
        .unwrap();
    }

    #[tokio::test]
    async fn test_local_writes_leave_signed_out_status_alone() {
        let (engine, _remote) = setup(manual_config()).await;
        engine
            .database()
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();

        let report = engine.sync().await;
        assert_eq!(report.outcome, RunOutcome::Skipped);
        tokio::task::yield_now().await;
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[tokio::test]
    async fn test_configured_endpoint_is_watched() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = manual_config();
        config.remote.endpoint = Some(format!("http://127.0.0.1:{}", port));
        config.sync.probe_interval_secs = 1;
        let (engine, _remote) = setup(config).await;

        let connectivity = engine.connectivity();
        assert!(connectivity.is_reachable());
        let mut reachable = connectivity.subscribe();
        tokio::time::timeout(Duration::from_secs(5), reachable.wait_for(|r| !*r))
            .await
            .expect("connectivity never updated")
            .unwrap();

        engine.shutdown().await;
        assert!(engine.background_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_run_releases_slot() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let remote = Arc::new(PanicsOnce {
            remote: InMemoryRemote::new(),
            armed: AtomicBool::new(true),
        });
        let engine = SyncEngine::new(manual_config(), db, remote);
        *engine.inner.owner.write().await = Some("user-1".into());

        let first = engine.sync().await;
        assert_eq!(first.outcome, RunOutcome::Fatal);
        assert_eq!(engine.status().state, SyncState::Error);
        assert_eq!(engine.status().last_error.as_deref(), Some("sync run aborted"));

        let second = tokio::time::timeout(Duration::from_secs(2), engine.sync())
            .await
            .expect("second sync waited on the aborted run");
        assert_eq!(second.outcome, RunOutcome::Success);
        assert_eq!(engine.status().state, SyncState::Idle);
    }

    #[tokio::test]
    async fn test_sign_out_during_run_keeps_reset_status() {
        let (engine, remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());
        engine
            .database()
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        remote.set_latency(Some(Duration::from_millis(50))).await;

        let running = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.sync().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.on_auth_changed(None).await.unwrap();

        let report = running.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Success);
        assert_eq!(engine.status(), SyncStatus::default());
    }

    #[tokio::test]
    async fn test_successful_run_updates_status() {
        let (engine, _remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());
        engine
            .database()
            .records()
            .create(EntityTable::Schema, payload(json!({ "name": "PPL" })))
            .await
            .unwrap();
        assert_eq!(engine.refresh_pending_count().await.unwrap(), 1);

        let report = engine.sync().await;

        assert_eq!(report.outcome, RunOutcome::Success);
        assert!(report.pull_completed);
        let status = engine.status();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_initial_sync_runs_once_per_owner() {
        let (engine, _remote) = setup(manual_config()).await;
        *engine.inner.owner.write().await = Some("user-1".into());

        let first = engine.initial_sync().await;
        assert_eq!(first.kind, RunKind::Initial);

        let second = engine.initial_sync().await;
        assert_eq!(second.kind, RunKind::Regular);
    }

    #[tokio::test]
    async fn test_manual_mode_ignores_background_triggers() {
        let (engine, _remote) = setup(manual_config()).await;
        assert!(!engine.trigger_sync(Trigger::Foreground));
        assert!(!engine.trigger_sync(Trigger::Retry));
        assert!(engine.trigger_sync(Trigger::Manual));

        let mut config = SyncConfig::default();
        config.sync.mode = SyncMode::Offline;
        let (offline, _remote) = setup(config).await;
        assert!(!offline.trigger_sync(Trigger::Manual));
        assert!(!offline.trigger_initial_sync());
    }

    #[tokio::test]
    async fn test_sign_out_resets_status() {
        let emitter = Arc::new(RecordingEmitter::default());
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let engine = SyncEngineBuilder::new(manual_config())
            .with_database(db)
            .with_remote(Arc::new(InMemoryRemote::new()))
            .with_emitter(emitter.clone())
            .build()
            .unwrap();

        *engine.inner.owner.write().await = Some("user-1".into());
        engine.update_status(|s| {
            s.state = SyncState::Error;
            s.pending_count = 4;
        });

        engine.on_auth_changed(None).await.unwrap();

        assert_eq!(engine.status(), SyncStatus::default());
        assert!(engine.owner().await.is_none());
        assert_eq!(emitter.statuses.lock().unwrap().last(), Some(&SyncStatus::default()));
    }
}
