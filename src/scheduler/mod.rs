//! Target orchestrator.
//!
//! One task owns the registry and the targets file. It reacts to:
//!   - the activation sweep timer   → promote due `ready` targets to `active`
//!   - the batch tick timer         → dispatch up to `max_concurrent` active targets
//!   - worker completions           → update counters, notify, persist
//!   - administrative commands      → add / remove / activate / ...
//!
//! Worker runs are futures held in a `FuturesUnordered` polled by the same
//! loop, so the registry needs no locks and results land in the order they
//! resolve. A new batch only starts once every run of the previous one has
//! resolved; ticks that arrive earlier are skipped, not queued.
//!
//! Prepare runs share the `max_concurrent` worker slots with polls. Prepares
//! that find no free slot wait in a FIFO queue and start as runs complete;
//! a batch only takes the slots they leave.

use crate::config::MonitorConfig;
use crate::metrics::{BatchSnapshot, BatchStats};
use crate::notify::{ChangeNotice, NotificationSink};
use crate::registry::{DispatchKind, PollReport, RegistryError, TargetRegistry, Transition};
use crate::store::ConfigStore;
use crate::target::{AddTarget, Target, TargetId, TargetStatus};
use crate::worker::{output_dir_for, Worker, WorkerOutcome, WorkerRequest, WorkerResult};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("orchestrator is not running")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    pub activation_sweep: Duration,
    pub worker_timeout: Duration,
    pub max_concurrent: usize,
    pub output_root: PathBuf,
    pub default_interval_ms: u64,
}

impl From<&MonitorConfig> for SchedulerSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            tick: Duration::from_millis(config.tick_ms),
            activation_sweep: Duration::from_millis(config.activation_sweep_ms),
            worker_timeout: Duration::from_secs(config.worker_timeout_secs),
            max_concurrent: config.max_concurrent,
            output_root: config.output_dir.clone(),
            default_interval_ms: config.default_interval_ms,
        }
    }
}

/// What a batch tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStart {
    /// Previous batch still outstanding.
    Skipped,
    /// Nothing eligible.
    Idle,
    /// Every worker slot is taken by prepare runs.
    Saturated,
    Started { dispatched: usize, deferred: usize },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub total_targets: usize,
    pub status_counts: BTreeMap<TargetStatus, usize>,
    pub active_targets: usize,
    pub in_flight: usize,
    pub queued_prepares: usize,
    /// The scheduler loop is running.
    pub concurrent_processing: bool,
    pub batch_in_progress: bool,
    pub max_concurrent: usize,
    pub uptime_secs: u64,
    pub batches: BatchSnapshot,
}

/// Requests served by the orchestrator task.
#[derive(Debug)]
pub enum Command {
    List {
        reply: oneshot::Sender<Vec<Target>>,
    },
    Get {
        id: TargetId,
        reply: oneshot::Sender<Option<Target>>,
    },
    Add {
        request: AddTarget,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Remove {
        id: TargetId,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Activate {
        id: TargetId,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Deactivate {
        id: TargetId,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Prepare {
        id: TargetId,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Retry {
        id: TargetId,
        reply: oneshot::Sender<Result<Target, OrchestratorError>>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Cloneable client side of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

pub fn command_channel(capacity: usize) -> (OrchestratorHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OrchestratorHandle { tx }, rx)
}

impl OrchestratorHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)
    }

    pub async fn list(&self) -> Result<Vec<Target>, OrchestratorError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn get(&self, id: TargetId) -> Result<Option<Target>, OrchestratorError> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    pub async fn add(&self, request: AddTarget) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Add { request, reply }).await?
    }

    pub async fn remove(&self, id: TargetId) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn activate(&self, id: TargetId) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Activate { id, reply }).await?
    }

    pub async fn deactivate(&self, id: TargetId) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Deactivate { id, reply }).await?
    }

    pub async fn prepare(&self, id: TargetId) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Prepare { id, reply }).await?
    }

    pub async fn retry(&self, id: TargetId) -> Result<Target, OrchestratorError> {
        self.request(|reply| Command::Retry { id, reply }).await?
    }

    pub async fn status(&self) -> Result<StatusReport, OrchestratorError> {
        self.request(|reply| Command::Status { reply }).await
    }
}

struct Completion {
    id: TargetId,
    kind: DispatchKind,
    result: WorkerResult,
}

struct Batch {
    started: Instant,
    dispatched: usize,
    outstanding: usize,
}

pub struct Orchestrator {
    registry: TargetRegistry,
    store: ConfigStore,
    worker: Arc<dyn Worker>,
    notifier: Arc<dyn NotificationSink>,
    settings: SchedulerSettings,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    batch: Option<Batch>,
    /// Pending targets waiting for a free slot to run their prepare.
    prepare_queue: VecDeque<TargetId>,
    /// Targets to go straight to `active` once their prepare run succeeds.
    activate_after_prepare: HashSet<TargetId>,
    stats: BatchStats,
    started_at: Instant,
    running: bool,
}

impl Orchestrator {
    pub fn new(
        targets: Vec<Target>,
        store: ConfigStore,
        worker: Arc<dyn Worker>,
        notifier: Arc<dyn NotificationSink>,
        settings: SchedulerSettings,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            registry: TargetRegistry::from_targets(targets)?,
            store,
            worker,
            notifier,
            settings,
            in_flight: FuturesUnordered::new(),
            batch: None,
            prepare_queue: VecDeque::new(),
            activate_after_prepare: HashSet::new(),
            stats: BatchStats::new(),
            started_at: Instant::now(),
            running: false,
        })
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn batch_in_progress(&self) -> bool {
        self.batch.is_some()
    }

    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    pub fn queued_prepares(&self) -> usize {
        self.prepare_queue.len()
    }

    fn free_slots(&self) -> usize {
        self.settings.max_concurrent.saturating_sub(self.in_flight.len())
    }

    /// Drive the orchestrator until `shutdown` resolves. Outstanding worker
    /// runs are awaited (each is bounded by its deadline) before returning.
    pub async fn run<F>(mut self, mut commands: mpsc::Receiver<Command>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.settings.activation_sweep);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut commands_open = true;
        self.running = true;
        info!(
            targets = self.registry.len(),
            tick_ms = self.settings.tick.as_millis() as u64,
            sweep_ms = self.settings.activation_sweep.as_millis() as u64,
            timeout_secs = self.settings.worker_timeout.as_secs(),
            max_concurrent = self.settings.max_concurrent,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }

                _ = sweep.tick() => {
                    self.activation_sweep(Utc::now());
                }

                _ = tick.tick() => {
                    self.start_batch();
                }

                Some(completion) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.apply(completion);
                }

                command = commands.recv(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!("all orchestrator handles dropped");
                            commands_open = false;
                        }
                    }
                }
            }
        }

        self.running = false;
        if !self.in_flight.is_empty() {
            info!(outstanding = self.in_flight.len(), "waiting for in-flight workers");
        }
        self.drain().await;
        self.persist();
        info!("scheduler stopped");
    }

    /// Promote every `ready` target whose start time has passed.
    pub fn activation_sweep(&mut self, now: DateTime<Utc>) -> Vec<TargetId> {
        let due: Vec<TargetId> = self
            .registry
            .list_by_status(TargetStatus::Ready)
            .into_iter()
            .filter(|t| t.schedule.start_at.is_due(now))
            .map(|t| t.id.clone())
            .collect();

        for id in &due {
            match self.registry.set_status(id, TargetStatus::Active) {
                Ok(_) => info!(target_id = %id, "start time reached, target active"),
                Err(e) => warn!(target_id = %id, error = %e, "activation sweep skipped target"),
            }
        }
        if !due.is_empty() {
            self.persist();
        }
        due
    }

    /// One batch tick: dispatch eligible active targets, least recently
    /// seen first, into the worker slots prepares leave free. The rest wait
    /// for a later tick.
    pub fn start_batch(&mut self) -> BatchStart {
        if let Some(batch) = &self.batch {
            debug!(outstanding = batch.outstanding, "previous batch still running, skipping tick");
            self.stats.record_skip();
            return BatchStart::Skipped;
        }

        let mut eligible: Vec<&Target> = self
            .registry
            .list_by_status(TargetStatus::Active)
            .into_iter()
            .filter(|t| !t.in_flight())
            .collect();
        if eligible.is_empty() {
            return BatchStart::Idle;
        }
        let slots = self.free_slots();
        if slots == 0 {
            debug!(
                outstanding = self.in_flight.len(),
                eligible = eligible.len(),
                "every worker slot busy with prepare runs"
            );
            return BatchStart::Saturated;
        }
        eligible.sort_by(|a, b| {
            a.timestamps
                .last_seen_at
                .cmp(&b.timestamps.last_seen_at)
                .then_with(|| a.timestamps.created_at.cmp(&b.timestamps.created_at))
        });

        let selected: Vec<TargetId> = eligible
            .iter()
            .take(slots)
            .map(|t| t.id.clone())
            .collect();
        let deferred = eligible.len() - selected.len();

        let mut dispatched = 0;
        for id in &selected {
            match self.dispatch(id, DispatchKind::Poll) {
                Ok(()) => dispatched += 1,
                Err(e) => warn!(target_id = %id, error = %e, "dispatch refused"),
            }
        }
        if dispatched == 0 {
            return BatchStart::Idle;
        }

        // in-flight flags and cycle counters hit disk before any result can
        self.persist();
        self.batch = Some(Batch {
            started: Instant::now(),
            dispatched,
            outstanding: dispatched,
        });
        self.stats.record_start(dispatched, deferred);
        info!(dispatched, deferred, "batch started");
        BatchStart::Started {
            dispatched,
            deferred,
        }
    }

    /// Tick and wait for the resulting batch to finish.
    pub async fn run_batch(&mut self) -> BatchStart {
        let start = self.start_batch();
        while self.batch.is_some() {
            if !self.next_completion().await {
                break;
            }
        }
        start
    }

    /// Apply the next worker completion. `false` when nothing is outstanding.
    pub async fn next_completion(&mut self) -> bool {
        match self.in_flight.next().await {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    pub async fn drain(&mut self) {
        while self.next_completion().await {}
    }

    fn dispatch(&mut self, id: &TargetId, kind: DispatchKind) -> Result<(), RegistryError> {
        let target = self.registry.begin_dispatch(id, kind)?;
        let request = WorkerRequest {
            target_id: target.id.clone(),
            url: target.url.clone(),
            output_dir: output_dir_for(&self.settings.output_root, &target.url, &target.id),
        };
        match kind {
            DispatchKind::Poll => info!(
                target_id = %id,
                host = %target.host(),
                cycle = target.counters.process_count,
                "dispatching worker"
            ),
            DispatchKind::Prepare => info!(target_id = %id, url = %target.url, "preparing target"),
        }

        let worker = Arc::clone(&self.worker);
        let deadline = self.settings.worker_timeout;
        self.in_flight.push(Box::pin(async move {
            let result = worker.invoke(&request, deadline).await;
            Completion {
                id: request.target_id,
                kind,
                result,
            }
        }));
        Ok(())
    }

    fn apply(&mut self, completion: Completion) {
        let Completion { id, kind, result } = completion;
        let now = Utc::now();

        match kind {
            DispatchKind::Poll => {
                self.stats.record_outcome(result.outcome);
                match self.registry.finish_poll(&id, &result, now) {
                    Ok(report) => self.report_poll(&id, &result, &report, now),
                    Err(e) => debug!(target_id = %id, error = %e, "dropping result for removed target"),
                }
                self.batch_member_done();
            }
            DispatchKind::Prepare => {
                let activate = self.activate_after_prepare.remove(&id);
                match self.registry.finish_prepare(&id, &result, activate, now) {
                    Ok(status) if result.is_success() => info!(
                        target_id = %id,
                        items = result.item_count,
                        status = %status,
                        "target prepared"
                    ),
                    Ok(status) => warn!(
                        target_id = %id,
                        status = %status,
                        error = result.diagnostic.as_deref().unwrap_or("unknown"),
                        "prepare run failed"
                    ),
                    Err(e) => debug!(target_id = %id, error = %e, "dropping prepare result for removed target"),
                }
            }
        }

        self.start_queued_prepares();
        self.persist();
    }

    fn report_poll(
        &self,
        id: &TargetId,
        result: &WorkerResult,
        report: &PollReport,
        now: DateTime<Utc>,
    ) {
        let Some(target) = self.registry.get(id) else {
            return;
        };
        let elapsed_ms = result.elapsed.as_millis() as u64;

        match result.outcome {
            WorkerOutcome::Success if report.change.changed => {
                self.notifier.notify(ChangeNotice {
                    target_id: id.clone(),
                    url: target.url.clone(),
                    previous: report.previous,
                    current: report.current,
                    delta: report.change.delta,
                    observed_at: now,
                });
            }
            WorkerOutcome::Success => info!(
                target_id = %id,
                host = %target.host(),
                items = report.current,
                elapsed_ms,
                "no changes"
            ),
            WorkerOutcome::Failure => warn!(
                target_id = %id,
                host = %target.host(),
                failures = report.consecutive_failures,
                error = result.diagnostic.as_deref().unwrap_or("unknown"),
                elapsed_ms,
                "worker failed, will retry next tick"
            ),
            WorkerOutcome::Timeout => warn!(
                target_id = %id,
                host = %target.host(),
                failures = report.consecutive_failures,
                elapsed_ms,
                "worker timed out, will retry next tick"
            ),
        }
    }

    fn batch_member_done(&mut self) {
        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        batch.outstanding = batch.outstanding.saturating_sub(1);
        if batch.outstanding > 0 {
            return;
        }
        let elapsed = batch.started.elapsed();
        let dispatched = batch.dispatched;
        self.batch = None;
        self.stats.record_complete(elapsed);
        info!(
            targets = dispatched,
            elapsed_ms = elapsed.as_millis() as u64,
            "batch complete"
        );
    }

    /// Start a pending target's prepare run, or queue it until a worker slot
    /// frees up.
    fn request_prepare(&mut self, id: &TargetId) -> Result<(), OrchestratorError> {
        let status = self.status_of(id)?;
        if status != TargetStatus::Pending {
            return Err(RegistryError::NotDispatchable {
                id: id.clone(),
                status,
            }
            .into());
        }
        if !self.prepare_queue.contains(id) {
            self.prepare_queue.push_back(id.clone());
        }
        self.start_queued_prepares();
        if self.prepare_queue.contains(id) {
            debug!(
                target_id = %id,
                queued = self.prepare_queue.len(),
                "worker slots full, prepare queued"
            );
        }
        Ok(())
    }

    fn start_queued_prepares(&mut self) {
        while self.free_slots() > 0 {
            let Some(id) = self.prepare_queue.pop_front() else {
                break;
            };
            if let Err(e) = self.dispatch(&id, DispatchKind::Prepare) {
                debug!(target_id = %id, error = %e, "dropping queued prepare");
            }
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.registry.snapshot()) {
            error!(
                error = %e,
                path = %self.store.path().display(),
                "failed to persist targets, in-memory state stays authoritative"
            );
        }
    }

    fn snapshot_of(&self, id: &TargetId) -> Result<Target, OrchestratorError> {
        self.registry
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()).into())
    }

    fn status_of(&self, id: &TargetId) -> Result<TargetStatus, OrchestratorError> {
        self.registry
            .get(id)
            .map(Target::status)
            .ok_or_else(|| RegistryError::NotFound(id.clone()).into())
    }

    pub fn handle_command(&mut self, command: Command) {
        // a dropped reply receiver just means the caller went away
        match command {
            Command::List { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.registry.get(&id).cloned());
            }
            Command::Add { request, reply } => {
                let _ = reply.send(self.add_target(request));
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove_target(&id));
            }
            Command::Activate { id, reply } => {
                let _ = reply.send(self.activate_target(&id));
            }
            Command::Deactivate { id, reply } => {
                let _ = reply.send(self.deactivate_target(&id));
            }
            Command::Prepare { id, reply } => {
                let _ = reply.send(self.prepare_target(&id));
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.retry_target(&id));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status_report());
            }
        }
    }

    /// Create a `pending` target and start its prepare run.
    pub fn add_target(&mut self, request: AddTarget) -> Result<Target, OrchestratorError> {
        let target = request
            .into_target(self.settings.default_interval_ms, Utc::now())
            .map_err(OrchestratorError::InvalidRequest)?;
        let id = target.id.clone();
        info!(
            target_id = %id,
            url = %target.url,
            start_at = %String::from(target.schedule.start_at),
            interval_ms = target.schedule.interval_ms,
            "target added"
        );
        self.registry.add(target)?;
        self.request_prepare(&id)?;
        self.persist();
        self.snapshot_of(&id)
    }

    /// Delete a target. A run already in flight finishes and is discarded.
    pub fn remove_target(&mut self, id: &TargetId) -> Result<Target, OrchestratorError> {
        let removed = self.registry.remove(id)?;
        self.activate_after_prepare.remove(id);
        self.prepare_queue.retain(|queued| queued != id);
        self.persist();
        info!(target_id = %id, url = %removed.url, "target removed");
        Ok(removed)
    }

    pub fn activate_target(&mut self, id: &TargetId) -> Result<Target, OrchestratorError> {
        match self.status_of(id)? {
            TargetStatus::Ready | TargetStatus::Paused => {
                self.registry.set_status(id, TargetStatus::Active)?;
                self.persist();
                info!(target_id = %id, "target activated");
            }
            TargetStatus::Active => debug!(target_id = %id, "target already active"),
            TargetStatus::Pending => {
                self.activate_after_prepare.insert(id.clone());
                self.request_prepare(id)?;
                self.persist();
                info!(target_id = %id, "target will activate once prepared");
            }
            TargetStatus::Preparing => {
                self.activate_after_prepare.insert(id.clone());
                info!(target_id = %id, "target will activate once prepared");
            }
            TargetStatus::Error => {
                return Err(RegistryError::InvalidTransition {
                    id: id.clone(),
                    from: TargetStatus::Error,
                    to: TargetStatus::Active,
                }
                .into())
            }
        }
        self.snapshot_of(id)
    }

    /// Pause polling. An in-flight run is not cancelled.
    pub fn deactivate_target(&mut self, id: &TargetId) -> Result<Target, OrchestratorError> {
        match self.registry.set_status(id, TargetStatus::Paused)? {
            Transition::Changed { .. } => {
                self.persist();
                info!(target_id = %id, "target deactivated");
            }
            Transition::Unchanged => debug!(target_id = %id, "target already paused"),
        }
        self.snapshot_of(id)
    }

    pub fn prepare_target(&mut self, id: &TargetId) -> Result<Target, OrchestratorError> {
        if self.status_of(id)? != TargetStatus::Preparing {
            self.request_prepare(id)?;
            self.persist();
        }
        self.snapshot_of(id)
    }

    /// `error → pending`, then prepare again.
    pub fn retry_target(&mut self, id: &TargetId) -> Result<Target, OrchestratorError> {
        self.registry.set_status(id, TargetStatus::Pending)?;
        info!(target_id = %id, "retrying target");
        self.request_prepare(id)?;
        self.persist();
        self.snapshot_of(id)
    }

    pub fn status_report(&self) -> StatusReport {
        let status_counts = self.registry.counts_by_status();
        StatusReport {
            total_targets: self.registry.len(),
            active_targets: status_counts
                .get(&TargetStatus::Active)
                .copied()
                .unwrap_or(0),
            status_counts,
            in_flight: self.registry.in_flight_count(),
            queued_prepares: self.prepare_queue.len(),
            concurrent_processing: self.running,
            batch_in_progress: self.batch.is_some(),
            max_concurrent: self.settings.max_concurrent,
            uptime_secs: self.started_at.elapsed().as_secs(),
            batches: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifier;
    use crate::target::StartAt;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy)]
    enum Mode {
        Items(u64),
        Fail,
        Hang,
    }

    /// In-process worker that records concurrency per target and overall.
    struct FakeWorker {
        delay: Duration,
        modes: Mutex<HashMap<String, Mode>>,
        running: Mutex<HashMap<TargetId, usize>>,
        max_per_target: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        calls: Mutex<Vec<TargetId>>,
    }

    impl FakeWorker {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                modes: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                max_per_target: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn set_mode(&self, url: &str, mode: Mode) {
            self.modes.lock().unwrap().insert(url.to_string(), mode);
        }

        fn reset_counts(&self) {
            self.calls.lock().unwrap().clear();
            self.max_concurrent.store(0, Ordering::SeqCst);
        }

        fn calls(&self) -> Vec<TargetId> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Worker for FakeWorker {
        async fn invoke(&self, request: &WorkerRequest, deadline: Duration) -> WorkerResult {
            {
                let mut running = self.running.lock().unwrap();
                let n = running.entry(request.target_id.clone()).or_default();
                *n += 1;
                self.max_per_target.fetch_max(*n, Ordering::SeqCst);
            }
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            self.calls.lock().unwrap().push(request.target_id.clone());

            let mode = self
                .modes
                .lock()
                .unwrap()
                .get(&request.url)
                .copied()
                .unwrap_or(Mode::Items(5));
            let result = match mode {
                Mode::Items(n) => {
                    tokio::time::sleep(self.delay).await;
                    WorkerResult::success(n, 1, format!("Events generated: {n}"), self.delay)
                }
                Mode::Fail => {
                    tokio::time::sleep(self.delay).await;
                    WorkerResult::failure("worker exited with exit status: 1".to_string(), self.delay)
                }
                Mode::Hang => {
                    tokio::time::sleep(deadline).await;
                    WorkerResult::timeout(deadline, deadline)
                }
            };

            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            *self
                .running
                .lock()
                .unwrap()
                .get_mut(&request.target_id)
                .unwrap() -= 1;
            result
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ChangeNotice>>);

    impl NotificationSink for Recorder {
        fn notify(&self, notice: ChangeNotice) {
            self.0.lock().unwrap().push(notice);
        }
    }

    fn settings(dir: &Path, max_concurrent: usize) -> SchedulerSettings {
        SchedulerSettings {
            tick: Duration::from_millis(20),
            activation_sweep: Duration::from_millis(20),
            worker_timeout: Duration::from_millis(100),
            max_concurrent,
            output_root: dir.join("output"),
            default_interval_ms: 1000,
        }
    }

    fn orchestrator(dir: &Path, worker: Arc<FakeWorker>, max_concurrent: usize) -> Orchestrator {
        orchestrator_with(dir, worker, Arc::new(Notifier::new()), max_concurrent)
    }

    fn orchestrator_with(
        dir: &Path,
        worker: Arc<FakeWorker>,
        notifier: Arc<dyn NotificationSink>,
        max_concurrent: usize,
    ) -> Orchestrator {
        Orchestrator::new(
            Vec::new(),
            ConfigStore::new(dir.join("targets.json")),
            worker,
            notifier,
            settings(dir, max_concurrent),
        )
        .unwrap()
    }

    async fn add_active(orch: &mut Orchestrator, url: &str) -> TargetId {
        let id = orch.add_target(AddTarget::new(url)).unwrap().id;
        orch.drain().await;
        assert_eq!(orch.registry().get(&id).unwrap().status(), TargetStatus::Active);
        id
    }

    fn status(orch: &Orchestrator, id: &TargetId) -> TargetStatus {
        orch.registry().get(id).unwrap().status()
    }

    #[tokio::test]
    async fn test_bounded_concurrency_without_starvation() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let mut orch = orchestrator(dir.path(), worker.clone(), 2);

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(add_active(&mut orch, &format!("https://book{i}.example/match")).await);
        }
        worker.reset_counts();

        assert_eq!(
            orch.run_batch().await,
            BatchStart::Started {
                dispatched: 2,
                deferred: 3
            }
        );
        assert_eq!(worker.calls().len(), 2);
        assert!(orch.registry().list().iter().all(|t| !t.in_flight()));

        orch.run_batch().await;
        orch.run_batch().await;

        let polled: HashSet<TargetId> = worker.calls().into_iter().collect();
        assert_eq!(polled, ids.iter().cloned().collect::<HashSet<_>>());
        assert_eq!(worker.calls().len(), 6);
        assert!(worker.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert_eq!(worker.max_per_target.load(Ordering::SeqCst), 1);
        assert!(orch.registry().list().iter().all(|t| !t.in_flight()));
        let counts: Vec<u64> = orch
            .registry()
            .list()
            .iter()
            .map(|t| t.counters.process_count)
            .collect();
        assert!(counts.iter().all(|c| (1..=2).contains(c)));
    }

    #[tokio::test]
    async fn test_prepare_runs_share_worker_slots() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let mut orch = orchestrator(dir.path(), worker.clone(), 2);

        let polled = add_active(&mut orch, "https://book0.example/match").await;

        let mut added = Vec::new();
        for i in 1..6 {
            added.push(
                orch.add_target(AddTarget::new(format!("https://book{i}.example/match")))
                    .unwrap(),
            );
        }
        assert_eq!(orch.outstanding(), 2);
        assert_eq!(orch.queued_prepares(), 3);
        assert_eq!(added[0].status(), TargetStatus::Preparing);
        assert_eq!(added[4].status(), TargetStatus::Pending);
        assert_eq!(orch.status_report().queued_prepares, 3);

        // prepares hold every slot, the active target waits
        assert_eq!(orch.start_batch(), BatchStart::Saturated);
        assert!(!orch.registry().get(&polled).unwrap().in_flight());

        orch.next_completion().await;
        assert_eq!(orch.outstanding(), 2);
        assert_eq!(orch.queued_prepares(), 2);

        orch.drain().await;
        assert_eq!(orch.queued_prepares(), 0);
        for t in &added {
            assert_eq!(status(&orch, &t.id), TargetStatus::Active);
        }

        orch.run_batch().await;
        orch.run_batch().await;
        orch.run_batch().await;
        assert!(worker.max_concurrent.load(Ordering::SeqCst) <= 2);
        assert_eq!(worker.max_per_target.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_takes_slots_left_by_prepares() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let mut orch = orchestrator(dir.path(), worker.clone(), 2);
        add_active(&mut orch, "https://a.example/1").await;
        add_active(&mut orch, "https://b.example/1").await;

        orch.add_target(AddTarget::new("https://c.example/1")).unwrap();
        assert_eq!(
            orch.start_batch(),
            BatchStart::Started {
                dispatched: 1,
                deferred: 1
            }
        );
        assert_eq!(orch.outstanding(), 2);
        orch.drain().await;
        assert!(worker.max_concurrent.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_remove_drops_queued_prepare() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(10));
        let mut orch = orchestrator(dir.path(), worker.clone(), 1);

        orch.add_target(AddTarget::new("https://a.example/1")).unwrap();
        let queued = orch.add_target(AddTarget::new("https://b.example/1")).unwrap();
        assert_eq!(orch.queued_prepares(), 1);

        orch.remove_target(&queued.id).unwrap();
        assert_eq!(orch.queued_prepares(), 0);
        orch.drain().await;
        assert_eq!(worker.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_skipped_while_batch_running() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        add_active(&mut orch, "https://a.example/1").await;

        assert!(matches!(orch.start_batch(), BatchStart::Started { dispatched: 1, .. }));
        assert!(orch.batch_in_progress());
        assert_eq!(orch.start_batch(), BatchStart::Skipped);
        assert_eq!(orch.status_report().batches.ticks_skipped, 1);

        orch.drain().await;
        assert!(!orch.batch_in_progress());
        assert!(matches!(orch.start_batch(), BatchStart::Started { .. }));
        orch.drain().await;
    }

    #[tokio::test]
    async fn test_no_overlapping_runs_per_target() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        let id = add_active(&mut orch, "https://a.example/1").await;

        orch.start_batch();
        assert!(orch.registry().get(&id).unwrap().in_flight());
        assert_eq!(
            orch.dispatch(&id, DispatchKind::Poll),
            Err(RegistryError::AlreadyInFlight(id.clone()))
        );
        assert!(orch.prepare_target(&id).is_err());
        assert_eq!(orch.outstanding(), 1);

        orch.drain().await;
        assert_eq!(worker.max_per_target.load(Ordering::SeqCst), 1);
        assert!(!orch.registry().get(&id).unwrap().in_flight());
    }

    #[tokio::test]
    async fn test_failure_keeps_target_active() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        let url = "https://a.example/1";
        let id = add_active(&mut orch, url).await;

        worker.set_mode(url, Mode::Fail);
        orch.run_batch().await;
        orch.run_batch().await;

        let t = orch.registry().get(&id).unwrap();
        assert_eq!(t.status(), TargetStatus::Active);
        assert_eq!(t.counters.process_count, 2);
        assert_eq!(t.counters.last_item_count, 5);
        assert_eq!(t.counters.consecutive_failures, 2);
        assert!(t.last_error.is_some());

        worker.set_mode(url, Mode::Items(5));
        orch.run_batch().await;
        let t = orch.registry().get(&id).unwrap();
        assert_eq!(t.counters.consecutive_failures, 0);
        assert!(t.last_error.is_none());
    }

    #[tokio::test]
    async fn test_timeout_keeps_target_active() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        let url = "https://a.example/1";
        let id = add_active(&mut orch, url).await;

        worker.set_mode(url, Mode::Hang);
        orch.run_batch().await;

        let t = orch.registry().get(&id).unwrap();
        assert_eq!(t.status(), TargetStatus::Active);
        assert_eq!(t.counters.last_item_count, 5);
        assert!(!t.in_flight());
        assert_eq!(orch.status_report().batches.timeouts, 1);
    }

    #[tokio::test]
    async fn test_activation_sweep_waits_for_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);

        let start = Utc::now() + chrono::Duration::seconds(10);
        let mut request = AddTarget::new("https://a.example/1");
        request.start_at = Some(StartAt::At(start));
        let id = orch.add_target(request).unwrap().id;
        orch.drain().await;
        assert_eq!(status(&orch, &id), TargetStatus::Ready);

        assert!(orch.activation_sweep(Utc::now()).is_empty());
        assert_eq!(status(&orch, &id), TargetStatus::Ready);
        assert_eq!(orch.start_batch(), BatchStart::Idle);

        assert_eq!(orch.activation_sweep(start), vec![id.clone()]);
        assert_eq!(status(&orch, &id), TargetStatus::Active);
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let mut orch = orchestrator(dir.path(), worker, 4);
        let id = add_active(&mut orch, "https://a.example/1").await;

        assert_eq!(
            orch.deactivate_target(&id).unwrap().status(),
            TargetStatus::Paused
        );

        // a second deactivate must not write the file again
        let path = dir.path().join("targets.json");
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            orch.deactivate_target(&id).unwrap().status(),
            TargetStatus::Paused
        );
        assert!(!path.exists());

        assert_eq!(orch.start_batch(), BatchStart::Idle);
    }

    #[tokio::test]
    async fn test_deactivate_does_not_cancel_in_flight_run() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(30));
        let url = "https://a.example/1";
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        let id = add_active(&mut orch, url).await;
        worker.set_mode(url, Mode::Items(9));

        orch.start_batch();
        orch.deactivate_target(&id).unwrap();
        orch.drain().await;

        let t = orch.registry().get(&id).unwrap();
        assert_eq!(t.status(), TargetStatus::Paused);
        assert_eq!(t.counters.last_item_count, 9);
        assert!(!t.in_flight());
    }

    #[tokio::test]
    async fn test_activate_while_preparing_goes_active() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(10));
        let mut orch = orchestrator(dir.path(), worker, 4);

        let mut request = AddTarget::new("https://a.example/1");
        request.start_at = Some(StartAt::At(Utc::now() + chrono::Duration::hours(1)));
        let added = orch.add_target(request).unwrap();
        assert_eq!(added.status(), TargetStatus::Preparing);
        assert!(added.in_flight());

        orch.activate_target(&added.id).unwrap();
        orch.drain().await;
        assert_eq!(status(&orch, &added.id), TargetStatus::Active);
    }

    #[tokio::test]
    async fn test_error_requires_retry() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let url = "https://a.example/1";
        worker.set_mode(url, Mode::Fail);
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);

        let id = orch.add_target(AddTarget::new(url)).unwrap().id;
        orch.drain().await;
        assert_eq!(status(&orch, &id), TargetStatus::Error);

        assert!(matches!(
            orch.activate_target(&id),
            Err(OrchestratorError::Registry(RegistryError::InvalidTransition { .. }))
        ));
        assert!(orch.deactivate_target(&id).is_err());

        worker.set_mode(url, Mode::Items(3));
        orch.retry_target(&id).unwrap();
        orch.drain().await;
        let t = orch.registry().get(&id).unwrap();
        assert_eq!(t.status(), TargetStatus::Active);
        assert_eq!(t.counters.last_item_count, 3);
    }

    #[tokio::test]
    async fn test_remove_while_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(20));
        let mut orch = orchestrator(dir.path(), worker, 4);
        let id = add_active(&mut orch, "https://a.example/1").await;

        orch.start_batch();
        orch.remove_target(&id).unwrap();
        orch.drain().await;

        assert!(orch.registry().get(&id).is_none());
        assert!(!orch.batch_in_progress());
        assert!(matches!(
            orch.remove_target(&id),
            Err(OrchestratorError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_invalid_add_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = orchestrator(dir.path(), FakeWorker::new(Duration::ZERO), 4);
        assert!(matches!(
            orch.add_target(AddTarget::new("not-a-url")),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(orch.registry().is_empty());
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let recorder = Arc::new(Recorder::default());
        let url = "https://a.example/1";
        let mut orch = orchestrator_with(dir.path(), worker.clone(), recorder.clone(), 4);
        let id = add_active(&mut orch, url).await;

        worker.set_mode(url, Mode::Items(8));
        orch.run_batch().await;
        orch.run_batch().await;
        worker.set_mode(url, Mode::Fail);
        orch.run_batch().await;

        let notices = recorder.0.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].target_id, id);
        assert_eq!((notices[0].previous, notices[0].current, notices[0].delta), (5, 8, 3));
    }

    #[tokio::test]
    async fn test_crash_mid_batch_recovers_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(50));
        let mut orch = orchestrator(dir.path(), worker.clone(), 4);
        let id = add_active(&mut orch, "https://a.example/1").await;

        orch.start_batch();
        // the dispatch is on disk before the worker returns
        let store = ConfigStore::new(dir.path().join("targets.json"));
        let on_disk = store.read_raw().unwrap().unwrap();
        assert!(on_disk[0].in_flight());
        assert_eq!(on_disk[0].counters.process_count, 1);

        // "crash": drop the orchestrator with the run outstanding
        drop(orch);

        let report = store.load_with_report().unwrap();
        assert_eq!(report.repaired, vec![id.clone()]);
        assert_eq!(report.targets[0].status(), TargetStatus::Ready);

        let mut orch = Orchestrator::new(
            report.targets,
            store,
            worker,
            Arc::new(Notifier::new()),
            settings(dir.path(), 4),
        )
        .unwrap();
        assert_eq!(orch.activation_sweep(Utc::now()), vec![id.clone()]);
        assert!(matches!(orch.run_batch().await, BatchStart::Started { dispatched: 1, .. }));
        assert_eq!(orch.registry().get(&id).unwrap().counters.process_count, 2);
    }

    #[tokio::test]
    async fn test_run_loop_serves_handle_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let worker = FakeWorker::new(Duration::from_millis(5));
        let orch = orchestrator(dir.path(), worker, 4);
        let (handle, commands) = command_channel(16);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(orch.run(commands, async move {
            let _ = stop_rx.await;
        }));

        let added = handle.add(AddTarget::new("https://a.example/1")).await.unwrap();
        let polled = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let t = handle.get(added.id.clone()).await.unwrap().unwrap();
                if t.counters.process_count >= 2 {
                    return t;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(polled.status(), TargetStatus::Active);

        let report = handle.status().await.unwrap();
        assert_eq!(report.total_targets, 1);
        assert_eq!(report.active_targets, 1);
        assert!(report.concurrent_processing);
        assert!(report.batches.batches_started >= 2);

        assert_eq!(handle.list().await.unwrap().len(), 1);
        assert!(matches!(
            handle.activate(TargetId::from("missing")).await,
            Err(OrchestratorError::Registry(RegistryError::NotFound(_)))
        ));

        stop_tx.send(()).unwrap();
        task.await.unwrap();

        let on_disk = ConfigStore::new(dir.path().join("targets.json"))
            .read_raw()
            .unwrap()
            .unwrap();
        assert!(on_disk.iter().all(|t| !t.in_flight()));
        assert!(matches!(handle.list().await, Err(OrchestratorError::Unavailable)));
    }
}
