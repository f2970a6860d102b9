//! Worker pool manager.
//!
//! Owns the worker arena, the table of pending resolutions and the dispatch
//! queue. All coordinating state sits behind one `tokio::sync::Mutex` and is
//! only touched in short critical sections; workers are reached exclusively
//! through their message links.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ComputeTask, HostMessage, TaskId, WorkerMessage};
use super::spawner::{WorkerLink, WorkerSpawner};
use super::{DegradeLevel, WorkerCapabilities, WorkerId, WorkerStatus};
use crate::config::PoolConfig;
use crate::error::{EngineError, EngineResult};
use crate::kernel::OperationKind;
use crate::notice::{EngineNotice, NoticeSink};

/// Resolution of a submitted task.
pub type Reply = oneshot::Receiver<EngineResult<Vec<f32>>>;
type ReplyTx = oneshot::Sender<EngineResult<Vec<f32>>>;

/// Max in-flight shrink applied once more than half the pool is degraded.
const THROTTLE_FACTOR: f64 = 0.7;
/// Evicted worker summaries kept for status reporting.
const RETIRED_HISTORY: usize = 16;
const MIN_HEALTH_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Public snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub capabilities: WorkerCapabilities,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatus {
    pub active_workers: usize,
    pub ready: usize,
    pub busy: usize,
    pub degraded: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub max_in_flight_per_worker: usize,
    pub paused: bool,
    pub evicted_total: u64,
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

struct WorkerRecord {
    id: WorkerId,
    capabilities: WorkerCapabilities,
    degraded: bool,
    in_flight: usize,
    last_used: u64,
    awaiting_pong: Option<u64>,
    tx: mpsc::Sender<HostMessage>,
}

impl WorkerRecord {
    fn new(id: WorkerId, capabilities: WorkerCapabilities, tx: mpsc::Sender<HostMessage>) -> Self {
        Self {
            id,
            capabilities,
            degraded: false,
            in_flight: 0,
            last_used: 0,
            awaiting_pong: None,
            tx,
        }
    }

    fn score(&self, op: OperationKind) -> f64 {
        self.capabilities.performance_score * self.capabilities.bonus(op)
    }

    fn status(&self, max_in_flight: usize) -> WorkerStatus {
        if self.degraded {
            WorkerStatus::Degraded
        } else if self.in_flight >= max_in_flight {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Ready
        }
    }

    fn summary(&self, max_in_flight: usize) -> WorkerSummary {
        WorkerSummary {
            id: self.id,
            status: self.status(max_in_flight),
            capabilities: self.capabilities,
            in_flight: self.in_flight,
        }
    }
}

struct Pending {
    worker: WorkerId,
    reply: ReplyTx,
}

struct Queued {
    task: ComputeTask,
    reply: ReplyTx,
}

struct PoolState {
    workers: BTreeMap<WorkerId, WorkerRecord>,
    pending: HashMap<TaskId, Pending>,
    queue: VecDeque<Queued>,
    retired: VecDeque<WorkerSummary>,
    initializing: bool,
    paused: bool,
    shutting_down: bool,
    throttled: bool,
    max_in_flight: usize,
    rr_cursor: usize,
    clock: u64,
    evicted_total: u64,
}

impl PoolState {
    fn new(max_in_flight: usize) -> Self {
        Self {
            workers: BTreeMap::new(),
            pending: HashMap::new(),
            queue: VecDeque::new(),
            retired: VecDeque::new(),
            initializing: false,
            paused: false,
            shutting_down: false,
            throttled: false,
            max_in_flight: max_in_flight.max(1),
            rr_cursor: 0,
            clock: 0,
            evicted_total: 0,
        }
    }

    /// Highest score among workers with spare capacity, least recently used
    /// on ties; round-robin over all workers when every one is at capacity.
    fn select(&mut self, op: OperationKind) -> Option<WorkerId> {
        let mut best: Option<&WorkerRecord> = None;
        for w in self.workers.values() {
            if w.in_flight >= self.max_in_flight {
                continue;
            }
            best = match best {
                None => Some(w),
                Some(b) => {
                    let (sw, sb) = (w.score(op), b.score(op));
                    if sw > sb || (sw == sb && w.last_used < b.last_used) {
                        Some(w)
                    } else {
                        Some(b)
                    }
                }
            };
        }
        if let Some(w) = best {
            return Some(w.id);
        }

        if self.workers.is_empty() {
            return None;
        }
        let idx = self.rr_cursor % self.workers.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        self.workers.keys().nth(idx).copied()
    }

    fn dispatch(&mut self, worker: WorkerId, task: ComputeTask, reply: ReplyTx) {
        self.clock += 1;
        let clock = self.clock;
        let task_id = task.id;

        let Some(record) = self.workers.get_mut(&worker) else {
            let _ = reply.send(Err(EngineError::WorkerLost {
                worker: worker.0,
                reason: "worker left the pool".to_string(),
            }));
            return;
        };

        match record.tx.try_send(HostMessage::ComputeTask(task)) {
            Ok(()) => {
                record.in_flight += 1;
                record.last_used = clock;
                debug!(task = %task_id, worker = %worker, in_flight = record.in_flight, "task dispatched");
                self.pending.insert(task_id, Pending { worker, reply });
            }
            Err(e) => {
                let reason = match e {
                    TrySendError::Full(_) => "worker link full",
                    TrySendError::Closed(_) => "worker link closed",
                };
                warn!(task = %task_id, worker = %worker, reason, "dispatch rejected");
                let _ = reply.send(Err(EngineError::WorkerLost {
                    worker: worker.0,
                    reason: reason.to_string(),
                }));
            }
        }
    }

    /// Queue by descending priority, FIFO within a priority.
    fn enqueue(&mut self, task: ComputeTask, reply: ReplyTx) {
        let pos = self
            .queue
            .iter()
            .position(|q| q.task.priority < task.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, Queued { task, reply });
    }

    fn drain_queue(&mut self) {
        while !self.paused && !self.workers.is_empty() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            if queued.reply.is_closed() {
                continue;
            }
            match self.select(queued.task.operation) {
                Some(worker) => self.dispatch(worker, queued.task, queued.reply),
                None => {
                    self.queue.push_front(queued);
                    break;
                }
            }
        }
    }

    fn retire(&mut self, summary: WorkerSummary) {
        if self.retired.len() == RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(summary);
    }

    fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            active_workers: self.workers.len(),
            queue_depth: self.queue.len(),
            in_flight: self.pending.len(),
            max_in_flight_per_worker: self.max_in_flight,
            paused: self.paused,
            evicted_total: self.evicted_total,
            ..Default::default()
        };
        for w in self.workers.values() {
            match w.status(self.max_in_flight) {
                WorkerStatus::Ready => status.ready += 1,
                WorkerStatus::Busy => status.busy += 1,
                WorkerStatus::Degraded => status.degraded += 1,
                WorkerStatus::Evicted => {}
            }
        }
        status
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    notices: NoticeSink,
    state: Mutex<PoolState>,
    init: OnceCell<EngineResult<usize>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    stop: CancellationToken,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn WorkerSpawner>, notices: NoticeSink) -> Self {
        let max_in_flight = config.max_in_flight_per_worker;
        Self {
            inner: Arc::new(PoolInner {
                config,
                spawner,
                notices,
                state: Mutex::new(PoolState::new(max_in_flight)),
                init: OnceCell::new(),
                next_id: AtomicU64::new(0),
                next_seq: AtomicU64::new(0),
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the configured number of workers.
    ///
    /// Resolves as soon as one worker is ready (the remaining attempts keep
    /// running in the background) or with `PoolExhausted` once every attempt
    /// has failed. Concurrent and repeated calls share the first outcome.
    pub async fn initialize(&self) -> EngineResult<usize> {
        self.inner
            .init
            .get_or_init(|| self.clone().start())
            .await
            .clone()
    }

    async fn start(self) -> EngineResult<usize> {
        let target = self.inner.config.target_size;
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                return Err(EngineError::ShuttingDown);
            }
            state.initializing = true;
        }
        info!(target, spawner = self.inner.spawner.name(), "initializing worker pool");

        let mut attempts = JoinSet::new();
        for attempt in 0..target {
            let pool = self.clone();
            attempts.spawn(async move { pool.spawn_worker(attempt).await });
        }

        let mut ready = false;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(_)) => {
                    ready = true;
                    break;
                }
                Ok(Err(e)) => debug!(error = %e, "spawn attempt discarded"),
                Err(e) => warn!(error = %e, "spawn attempt panicked"),
            }
        }

        self.spawn_health_monitor();

        if !ready {
            self.inner.state.lock().await.initializing = false;
            warn!(target, "no worker reached ready state");
            return Err(EngineError::PoolExhausted);
        }

        let pool = self.clone();
        let stop = self.inner.stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = async { while attempts.join_next().await.is_some() {} } => {}
            }
            let mut state = pool.inner.state.lock().await;
            state.initializing = false;
            info!(active = state.workers.len(), target, "worker pool initialization settled");
        });

        Ok(self.inner.state.lock().await.workers.len())
    }

    /// One spawn + `ready` handshake under the spawn timeout.
    async fn spawn_worker(&self, attempt: usize) -> EngineResult<WorkerId> {
        let id = WorkerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let timeout = self.inner.config.spawn_timeout();
        let spawner = self.inner.spawner.clone();

        let handshake = async move {
            let mut link = spawner.spawn(id).await?;
            loop {
                match link.rx.recv().await {
                    Some(WorkerMessage::Ready { capabilities }) => {
                        break Ok::<_, EngineError>((link, capabilities))
                    }
                    Some(other) => debug!(worker = %id, ?other, "message before ready ignored"),
                    None => {
                        break Err(EngineError::InitializationFailure {
                            reason: "worker exited before ready".to_string(),
                        })
                    }
                }
            }
        };

        let (link, capabilities) = match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(ready)) => ready,
            Ok(Err(e)) => {
                warn!(worker = %id, attempt, error = %e, "worker spawn failed");
                return Err(e);
            }
            Err(_) => {
                let err = EngineError::WorkerSpawnTimeout {
                    attempt,
                    timeout_ms: timeout.as_millis() as u64,
                };
                warn!(worker = %id, attempt, error = %err, "worker spawn timed out");
                return Err(err);
            }
        };

        self.admit(id, link, capabilities).await
    }

    async fn admit(
        &self,
        id: WorkerId,
        link: WorkerLink,
        capabilities: WorkerCapabilities,
    ) -> EngineResult<WorkerId> {
        let WorkerLink { tx, rx } = link;
        {
            let mut state = self.inner.state.lock().await;
            if state.shutting_down {
                let _ = tx.try_send(HostMessage::Shutdown);
                return Err(EngineError::ShuttingDown);
            }
            if state.paused {
                let _ = tx.try_send(HostMessage::Pause);
            }
            state
                .workers
                .insert(id, WorkerRecord::new(id, capabilities, tx));
            state.drain_queue();
        }
        self.spawn_reader(id, rx);

        info!(
            worker = %id,
            accelerated = capabilities.accelerated_path,
            secondary = capabilities.secondary_path,
            score = capabilities.performance_score,
            "worker ready"
        );
        Ok(id)
    }

    fn spawn_reader(&self, id: WorkerId, mut rx: mpsc::Receiver<WorkerMessage>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let pool = WorkerPool { inner };
                if !pool.on_message(id, msg).await {
                    return;
                }
            }
            if let Some(inner) = weak.upgrade() {
                WorkerPool { inner }
                    .evict(id, "link closed".to_string())
                    .await;
            }
        });
    }

    /// Returns false once the worker has been evicted.
    async fn on_message(&self, worker: WorkerId, msg: WorkerMessage) -> bool {
        match msg {
            WorkerMessage::TaskResult { id, data } => self.complete(id, Ok(data)).await,
            WorkerMessage::TaskError { id, error } => {
                self.complete(id, Err(EngineError::TaskExecutionError { reason: error }))
                    .await
            }
            WorkerMessage::Degraded { level, error } => self.degrade(worker, level, &error).await,
            WorkerMessage::Pong { seq } => {
                let mut state = self.inner.state.lock().await;
                if let Some(record) = state.workers.get_mut(&worker) {
                    if record.awaiting_pong == Some(seq) {
                        record.awaiting_pong = None;
                    }
                }
            }
            WorkerMessage::Fault { error } => {
                self.evict(worker, error).await;
                return false;
            }
            WorkerMessage::Ready { .. } => debug!(worker = %worker, "duplicate ready ignored"),
        }
        true
    }

    async fn complete(&self, task: TaskId, result: EngineResult<Vec<f32>>) {
        let mut state = self.inner.state.lock().await;
        match state.pending.remove(&task) {
            Some(pending) => {
                if let Some(record) = state.workers.get_mut(&pending.worker) {
                    record.in_flight = record.in_flight.saturating_sub(1);
                }
                if pending.reply.send(result).is_err() {
                    debug!(task = %task, "caller went away before result");
                }
            }
            None => debug!(task = %task, "dropping late response"),
        }
        state.drain_queue();
    }

    async fn degrade(&self, worker: WorkerId, level: DegradeLevel, error: &str) {
        let notice = {
            let mut state = self.inner.state.lock().await;
            let Some(record) = state.workers.get_mut(&worker) else {
                return;
            };
            record.capabilities.accelerated_path = false;
            if level == DegradeLevel::Severe {
                record.capabilities.secondary_path = false;
            }
            record.capabilities.performance_score *= level.score_factor();
            record.degraded = true;
            warn!(
                worker = %worker,
                %level,
                error,
                score = record.capabilities.performance_score,
                "worker degraded"
            );

            let total = state.workers.len();
            let degraded = state.workers.values().filter(|w| w.degraded).count();
            if degraded * 2 > total && !state.throttled {
                state.throttled = true;
                let shrunk = (state.max_in_flight as f64 * THROTTLE_FACTOR).floor() as usize;
                state.max_in_flight = shrunk.max(1);
                warn!(
                    degraded,
                    total,
                    max_in_flight = state.max_in_flight,
                    "majority of pool degraded, reducing per-worker concurrency"
                );
                Some(EngineNotice::PoolDegraded {
                    degraded,
                    total,
                    max_in_flight: state.max_in_flight,
                })
            } else {
                None
            }
        };
        if let Some(notice) = notice {
            self.inner.notices.emit(notice);
        }
    }

    /// Remove a worker, reject its pending tasks with `WorkerLost`, and try
    /// one replacement spawn if the pool fell under its floor.
    async fn evict(&self, worker: WorkerId, reason: String) {
        let (lost, replace, attempt) = {
            let mut state = self.inner.state.lock().await;
            let Some(record) = state.workers.remove(&worker) else {
                return;
            };
            let _ = record.tx.try_send(HostMessage::Shutdown);

            let orphaned: Vec<TaskId> = state
                .pending
                .iter()
                .filter(|(_, p)| p.worker == worker)
                .map(|(id, _)| *id)
                .collect();
            for id in &orphaned {
                if let Some(pending) = state.pending.remove(id) {
                    let _ = pending.reply.send(Err(EngineError::WorkerLost {
                        worker: worker.0,
                        reason: reason.clone(),
                    }));
                }
            }

            let mut summary = record.summary(state.max_in_flight);
            summary.status = WorkerStatus::Evicted;
            state.retire(summary);
            state.evicted_total += 1;

            let floor = self
                .inner
                .config
                .min_pool_size
                .min(self.inner.config.target_size);
            let replace = !state.shutting_down && state.workers.len() < floor;
            (orphaned.len(), replace, state.evicted_total as usize)
        };

        warn!(worker = %worker, reason = %reason, lost, "worker evicted");
        self.inner.notices.emit(EngineNotice::WorkerEvicted {
            worker: worker.0,
            reason,
        });

        if replace {
            let pool = self.clone();
            tokio::spawn(async move {
                match pool.spawn_worker(attempt).await {
                    Ok(id) => info!(replaced = %worker, worker = %id, "replacement worker ready"),
                    Err(e) => warn!(replaced = %worker, error = %e, "replacement spawn failed"),
                }
            });
        }
    }

    fn spawn_health_monitor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let stop = self.inner.stop.clone();
        let period = self.inner.config.health_interval().max(MIN_HEALTH_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        WorkerPool { inner }.probe_health().await;
                    }
                }
            }
            debug!("health monitor stopped");
        });
    }

    /// Ping every worker; evict those that left the previous ping unanswered.
    async fn probe_health(&self) {
        let unresponsive: Vec<WorkerId> = {
            let mut state = self.inner.state.lock().await;
            let mut stale = Vec::new();
            for record in state.workers.values_mut() {
                if record.awaiting_pong.is_some() {
                    stale.push(record.id);
                    continue;
                }
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                match record.tx.try_send(HostMessage::Ping { seq }) {
                    Ok(()) => record.awaiting_pong = Some(seq),
                    Err(TrySendError::Full(_)) => {
                        debug!(worker = %record.id, "link full, skipping ping");
                    }
                    Err(TrySendError::Closed(_)) => stale.push(record.id),
                }
            }
            stale
        };

        for worker in unresponsive {
            self.evict(worker, "missed health ping".to_string()).await;
        }
    }

    /// Dispatch `task` to the best eligible worker, or queue it while the
    /// pool is paused or still waiting for its first worker.
    pub async fn submit(&self, task: ComputeTask) -> EngineResult<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(EngineError::ShuttingDown);
        }
        if state.paused || (state.workers.is_empty() && state.initializing) {
            debug!(task = %task.id, paused = state.paused, "task queued");
            state.enqueue(task, tx);
            return Ok(rx);
        }
        let Some(worker) = state.select(task.operation) else {
            return Err(EngineError::PoolExhausted);
        };
        state.dispatch(worker, task, tx);
        Ok(rx)
    }

    /// Submit and wait up to `timeout`. On timeout the pending resolution is
    /// cancelled so a late response is dropped.
    pub async fn execute(&self, task: ComputeTask, timeout: Duration) -> EngineResult<Vec<f32>> {
        let id = task.id;
        let reply = self.submit(task).await?;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::TaskExecutionError {
                reason: "worker pool dropped the task".to_string(),
            }),
            Err(_) => {
                self.cancel(id).await;
                Err(EngineError::TaskTimeout {
                    task: id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Forget a pending or queued task. Returns whether it was found.
    pub async fn cancel(&self, task: TaskId) -> bool {
        let mut state = self.inner.state.lock().await;
        if let Some(pending) = state.pending.remove(&task) {
            if let Some(record) = state.workers.get_mut(&pending.worker) {
                record.in_flight = record.in_flight.saturating_sub(1);
            }
            debug!(task = %task, worker = %pending.worker, "pending task cancelled");
            return true;
        }
        let before = state.queue.len();
        state.queue.retain(|q| q.task.id != task);
        before != state.queue.len()
    }

    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        if state.paused || state.shutting_down {
            return;
        }
        state.paused = true;
        for record in state.workers.values() {
            let _ = record.tx.try_send(HostMessage::Pause);
        }
        info!(workers = state.workers.len(), "worker pool paused");
    }

    pub async fn resume(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.paused || state.shutting_down {
            return;
        }
        state.paused = false;
        for record in state.workers.values() {
            let _ = record.tx.try_send(HostMessage::Resume);
        }
        state.drain_queue();
        info!(workers = state.workers.len(), "worker pool resumed");
    }

    /// Stop every worker and reject all pending and queued tasks with
    /// `ShuttingDown`. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;

        let workers = std::mem::take(&mut state.workers);
        for record in workers.values() {
            let _ = record.tx.try_send(HostMessage::Shutdown);
        }

        let rejected = state.pending.len() + state.queue.len();
        for (_, pending) in state.pending.drain() {
            let _ = pending.reply.send(Err(EngineError::ShuttingDown));
        }
        for queued in state.queue.drain(..) {
            let _ = queued.reply.send(Err(EngineError::ShuttingDown));
        }
        info!(workers = workers.len(), rejected, "worker pool shut down");
    }

    pub async fn status(&self) -> PoolStatus {
        self.inner.state.lock().await.status()
    }

    /// Non-degraded workers, busy ones included. Degraded workers still take
    /// tasks but do not count toward chunk fan-out.
    pub async fn ready_workers(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.workers.values().filter(|w| !w.degraded).count()
    }

    /// Live workers followed by recently evicted ones.
    pub async fn workers(&self) -> Vec<WorkerSummary> {
        let state = self.inner.state.lock().await;
        state
            .workers
            .values()
            .map(|w| w.summary(state.max_in_flight))
            .chain(state.retired.iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{self, ComputeParams};
    use crate::worker::runtime::WorkerRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Behavior {
        Normal(WorkerCapabilities),
        NeverReady,
        Silent,
        FaultOnTask,
        DegradeOnReady(DegradeLevel),
    }

    struct ScriptedSpawner {
        script: std::sync::Mutex<VecDeque<Behavior>>,
        fallback: Behavior,
        spawned: AtomicUsize,
    }

    impl ScriptedSpawner {
        fn new(script: Vec<Behavior>, fallback: Behavior) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                fallback,
                spawned: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl WorkerSpawner for ScriptedSpawner {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn spawn(&self, _id: WorkerId) -> EngineResult<WorkerLink> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            let (link, inbound, outbound) = WorkerLink::pair();
            tokio::spawn(scripted(behavior, inbound, outbound));
            Ok(link)
        }
    }

    async fn scripted(
        behavior: Behavior,
        mut inbound: mpsc::Receiver<HostMessage>,
        outbound: mpsc::Sender<WorkerMessage>,
    ) {
        let ready = WorkerMessage::Ready {
            capabilities: WorkerCapabilities::default(),
        };
        match behavior {
            Behavior::Normal(caps) => WorkerRuntime::new(caps).run(inbound, outbound).await,
            Behavior::NeverReady => while inbound.recv().await.is_some() {},
            Behavior::Silent => {
                let _ = outbound.send(ready).await;
                while inbound.recv().await.is_some() {}
            }
            Behavior::FaultOnTask => {
                let _ = outbound.send(ready).await;
                while let Some(msg) = inbound.recv().await {
                    match msg {
                        HostMessage::ComputeTask(_) => {
                            let _ = outbound
                                .send(WorkerMessage::Fault {
                                    error: "simulated crash".into(),
                                })
                                .await;
                        }
                        HostMessage::Ping { seq } => {
                            let _ = outbound.send(WorkerMessage::Pong { seq }).await;
                        }
                        _ => {}
                    }
                }
            }
            Behavior::DegradeOnReady(level) => {
                let _ = outbound
                    .send(WorkerMessage::Ready {
                        capabilities: WorkerCapabilities {
                            accelerated_path: true,
                            secondary_path: true,
                            performance_score: 1.0,
                        },
                    })
                    .await;
                let _ = outbound
                    .send(WorkerMessage::Degraded {
                        level,
                        error: "simd path lost".into(),
                    })
                    .await;
                while let Some(msg) = inbound.recv().await {
                    match msg {
                        HostMessage::ComputeTask(task) => {
                            let data =
                                kernel::execute(task.operation, &task.params, &task.payload)
                                    .unwrap_or_default();
                            let _ = outbound
                                .send(WorkerMessage::TaskResult { id: task.id, data })
                                .await;
                        }
                        HostMessage::Ping { seq } => {
                            let _ = outbound.send(WorkerMessage::Pong { seq }).await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn config(target_size: usize) -> PoolConfig {
        PoolConfig {
            target_size,
            spawn_timeout_ms: 100,
            health_interval_ms: 1_000,
            ..Default::default()
        }
    }

    fn normal() -> Behavior {
        Behavior::Normal(WorkerCapabilities::default())
    }

    fn transform_task() -> ComputeTask {
        ComputeTask::new(
            OperationKind::Transform,
            vec![1.0, 0.0, 0.0, 1.0],
            ComputeParams::new(0.5, 0),
        )
    }

    fn record(id: u64, caps: WorkerCapabilities) -> WorkerRecord {
        let (tx, _rx) = mpsc::channel(1);
        WorkerRecord::new(WorkerId(id), caps, tx)
    }

    #[test]
    fn test_select_prefers_capability_bonus() {
        let mut state = PoolState::new(2);
        state.workers.insert(WorkerId(0), record(0, WorkerCapabilities::default()));
        state.workers.insert(
            WorkerId(1),
            record(
                1,
                WorkerCapabilities {
                    accelerated_path: true,
                    ..Default::default()
                },
            ),
        );
        state.workers.insert(
            WorkerId(2),
            record(
                2,
                WorkerCapabilities {
                    secondary_path: true,
                    ..Default::default()
                },
            ),
        );

        assert_eq!(state.select(OperationKind::Particles), Some(WorkerId(1)));
        assert_eq!(state.select(OperationKind::Inference), Some(WorkerId(2)));
    }

    #[test]
    fn test_select_breaks_ties_by_least_recently_used() {
        let mut state = PoolState::new(2);
        for id in 0..3 {
            let mut r = record(id, WorkerCapabilities::default());
            r.last_used = 10 - id;
            state.workers.insert(WorkerId(id), r);
        }
        assert_eq!(state.select(OperationKind::Transform), Some(WorkerId(2)));
    }

    #[test]
    fn test_select_round_robins_when_all_busy() {
        let mut state = PoolState::new(1);
        for id in 0..3 {
            let mut r = record(id, WorkerCapabilities::default());
            r.in_flight = 1;
            state.workers.insert(WorkerId(id), r);
        }
        let picks: Vec<_> = (0..4)
            .filter_map(|_| state.select(OperationKind::Particles))
            .collect();
        assert_eq!(picks, vec![WorkerId(0), WorkerId(1), WorkerId(2), WorkerId(0)]);
    }

    #[test]
    fn test_queue_orders_by_priority() {
        let mut state = PoolState::new(1);
        for priority in [0, 5, 0, 9] {
            let (tx, _rx) = oneshot::channel();
            state.enqueue(transform_task().with_priority(priority), tx);
        }
        let order: Vec<i32> = state.queue.iter().map(|q| q.task.priority).collect();
        assert_eq!(order, vec![9, 5, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_timeouts_leave_remaining_workers() {
        let spawner = ScriptedSpawner::new(
            vec![normal(), Behavior::NeverReady, normal(), Behavior::NeverReady],
            normal(),
        );
        let pool = WorkerPool::new(config(4), spawner, NoticeSink::disabled());

        assert!(pool.initialize().await.unwrap() >= 1);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pool.status().await.active_workers, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_spawns_fail_is_exhausted_and_memoized() {
        let spawner = ScriptedSpawner::new(vec![], Behavior::NeverReady);
        let pool = WorkerPool::new(config(3), spawner.clone(), NoticeSink::disabled());

        let (a, b) = tokio::join!(pool.initialize(), pool.initialize());
        assert_eq!(a, Err(EngineError::PoolExhausted));
        assert_eq!(b, Err(EngineError::PoolExhausted));
        assert_eq!(pool.initialize().await, Err(EngineError::PoolExhausted));
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 3);

        assert_eq!(
            pool.submit(transform_task()).await.err(),
            Some(EngineError::PoolExhausted)
        );
    }

    #[tokio::test]
    async fn test_execute_returns_kernel_output() {
        let spawner = ScriptedSpawner::new(vec![], normal());
        let pool = WorkerPool::new(config(2), spawner, NoticeSink::disabled());
        pool.initialize().await.unwrap();

        let task = transform_task();
        let expected = kernel::execute(task.operation, &task.params, &task.payload).unwrap();
        let out = pool.execute(task, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, expected);
        assert_eq!(pool.status().await.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_pending_resolution() {
        let spawner = ScriptedSpawner::new(vec![], Behavior::Silent);
        let cfg = PoolConfig {
            health_interval_ms: 60_000,
            ..config(1)
        };
        let pool = WorkerPool::new(cfg, spawner, NoticeSink::disabled());
        pool.initialize().await.unwrap();

        let start = Instant::now();
        let err = pool
            .execute(transform_task(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskTimeout { timeout_ms: 500, .. }));
        assert!(start.elapsed() < Duration::from_millis(600));

        let status = pool.status().await;
        assert_eq!(status.in_flight, 0);
        assert_eq!(status.ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_worker_is_evicted_and_replaced() {
        let (tx, mut notices) = mpsc::channel(8);
        let spawner = ScriptedSpawner::new(vec![Behavior::Silent], normal());
        let pool = WorkerPool::new(config(1), spawner.clone(), NoticeSink::new(tx));
        pool.initialize().await.unwrap();

        // First tick pings, second tick finds it unanswered.
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert!(matches!(
            notices.recv().await,
            Some(EngineNotice::WorkerEvicted { worker: 0, .. })
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(spawner.spawned.load(Ordering::SeqCst), 2);

        let status = pool.status().await;
        assert_eq!(status.evicted_total, 1);
        assert_eq!(status.active_workers, 1);
        assert!(pool
            .workers()
            .await
            .iter()
            .any(|w| w.status == WorkerStatus::Evicted));
    }

    #[tokio::test]
    async fn test_fault_rejects_pending_with_worker_lost() {
        let spawner = ScriptedSpawner::new(vec![Behavior::FaultOnTask], normal());
        let cfg = PoolConfig {
            min_pool_size: 0,
            ..config(1)
        };
        let pool = WorkerPool::new(cfg, spawner, NoticeSink::disabled());
        pool.initialize().await.unwrap();

        let err = pool
            .execute(transform_task(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkerLost { worker: 0, .. }));
        assert_eq!(pool.status().await.active_workers, 0);
    }

    #[tokio::test]
    async fn test_majority_degraded_shrinks_concurrency() {
        let (tx, mut notices) = mpsc::channel(8);
        let spawner = ScriptedSpawner::new(
            vec![
                Behavior::DegradeOnReady(DegradeLevel::Severe),
                Behavior::DegradeOnReady(DegradeLevel::Minor),
            ],
            normal(),
        );
        let pool = WorkerPool::new(config(2), spawner, NoticeSink::new(tx));
        pool.initialize().await.unwrap();

        let notice = notices.recv().await;
        while pool.status().await.degraded < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        match notice {
            Some(EngineNotice::PoolDegraded {
                degraded,
                max_in_flight,
                ..
            }) => {
                assert!(degraded >= 1);
                assert_eq!(max_in_flight, 1);
            }
            other => panic!("unexpected notice {:?}", other),
        }

        let workers = pool.workers().await;
        let severe = workers
            .iter()
            .find(|w| w.capabilities.performance_score == 0.5)
            .expect("severe worker");
        assert_eq!(severe.status, WorkerStatus::Degraded);
        assert!(!severe.capabilities.accelerated_path);
        assert!(!severe.capabilities.secondary_path);
        assert_eq!(pool.status().await.max_in_flight_per_worker, 1);
        assert_eq!(pool.ready_workers().await, 0);
    }

    #[tokio::test]
    async fn test_pause_queues_until_resume() {
        let spawner = ScriptedSpawner::new(vec![], normal());
        let pool = WorkerPool::new(config(1), spawner, NoticeSink::disabled());
        pool.initialize().await.unwrap();

        pool.pause().await;
        let reply = pool.submit(transform_task()).await.unwrap();
        assert_eq!(pool.status().await.queue_depth, 1);

        pool.resume().await;
        assert!(reply.await.unwrap().is_ok());
        assert_eq!(pool.status().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_and_new_work() {
        let spawner = ScriptedSpawner::new(vec![], Behavior::Silent);
        let pool = WorkerPool::new(config(1), spawner, NoticeSink::disabled());
        pool.initialize().await.unwrap();

        let reply = pool.submit(transform_task()).await.unwrap();
        pool.shutdown().await;
        pool.shutdown().await;

        assert_eq!(reply.await.unwrap(), Err(EngineError::ShuttingDown));
        assert_eq!(
            pool.submit(transform_task()).await.err(),
            Some(EngineError::ShuttingDown)
        );
        assert_eq!(pool.status().await.active_workers, 0);
    }
}
