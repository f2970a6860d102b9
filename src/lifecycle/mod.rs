//! Lifecycle coordinator -- prioritized cleanup and suspend hooks.
//!
//! Components register named hooks with a priority. Shutdown runs cleanup
//! hooks in strictly descending priority under one global time budget; each
//! hook runs in its own task so an error or panic is logged and the next hook
//! still runs. Pause runs suspend hooks in descending priority, resume in
//! ascending priority, and a sustained pause escalates to shutdown after the
//! grace period.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LifecycleConfig;
use crate::error::EngineError;
use crate::notice::{EngineNotice, NoticeSink};

type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Active,
    Paused,
    ShuttingDown,
    Shutdown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Paused => write!(f, "paused"),
            LifecycleState::ShuttingDown => write!(f, "shutting_down"),
            LifecycleState::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Events from the embedding host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// Host no longer visible; pause and start the grace timer.
    Hidden,
    /// Host visible again; resume.
    Visible,
    /// Host is closing; shut down.
    Unload,
}

/// Outcome of one hook phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhaseReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Not run, or cut off, because the budget expired.
    pub skipped: Vec<String>,
    pub elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct CleanupEntry {
    name: String,
    priority: i32,
    seq: u64,
    callback: HookFn,
}

struct SuspendEntry {
    name: String,
    priority: i32,
    seq: u64,
    on_pause: HookFn,
    on_resume: HookFn,
}

#[derive(Default)]
struct Registry {
    cleanup: Vec<CleanupEntry>,
    suspend: Vec<SuspendEntry>,
    next_seq: u64,
}

impl Registry {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Descending priority, earlier registration first on ties.
    fn cleanup_order(&self) -> Vec<(String, HookFn)> {
        let mut entries: Vec<&CleanupEntry> = self.cleanup.iter().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
            .into_iter()
            .map(|e| (e.name.clone(), e.callback.clone()))
            .collect()
    }

    fn pause_order(&self) -> Vec<(String, HookFn)> {
        let mut entries: Vec<&SuspendEntry> = self.suspend.iter().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
            .into_iter()
            .map(|e| (e.name.clone(), e.on_pause.clone()))
            .collect()
    }

    fn resume_order(&self) -> Vec<(String, HookFn)> {
        let mut entries: Vec<&SuspendEntry> = self.suspend.iter().collect();
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.seq.cmp(&b.seq)));
        entries
            .into_iter()
            .map(|e| (e.name.clone(), e.on_resume.clone()))
            .collect()
    }
}

fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Returned by [`LifecycleCoordinator::register_cleanup`].
pub struct CleanupHandle {
    name: String,
    seq: u64,
    inner: Weak<CoordinatorInner>,
}

impl CleanupHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the hook unless it has been replaced by a later registration
    /// under the same name. Returns whether anything was removed.
    pub fn unregister(&self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut registry = inner.registry();
        let before = registry.cleanup.len();
        registry
            .cleanup
            .retain(|e| !(e.name == self.name && e.seq == self.seq));
        let removed = registry.cleanup.len() != before;
        if removed {
            debug!(hook = %self.name, "cleanup hook unregistered");
        }
        removed
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LifecycleCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: LifecycleConfig,
    notices: NoticeSink,
    registry: Mutex<Registry>,
    state: watch::Sender<LifecycleState>,
    shutdown: Mutex<Option<Shared<BoxFuture<'static, PhaseReport>>>>,
    grace: Mutex<Option<CancellationToken>>,
    /// Serializes pause / resume transitions.
    transition: tokio::sync::Mutex<()>,
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CoordinatorInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    fn set_state(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "lifecycle state changed");
            self.notices
                .emit(EngineNotice::LifecycleChanged { state: next });
        }
    }

    /// Move `from -> to` only if the state is still `from`. Shutdown wins
    /// over any pause or resume that was in flight when it started.
    fn advance(&self, from: LifecycleState, to: LifecycleState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            info!(from = %from, to = %to, "lifecycle state changed");
            self.notices.emit(EngineNotice::LifecycleChanged { state: to });
        } else {
            let now = *self.state.borrow();
            debug!(from = %from, to = %to, now = %now, "transition superseded");
        }
        moved
    }

    fn shutting_down(&self) -> bool {
        matches!(
            *self.state.borrow(),
            LifecycleState::ShuttingDown | LifecycleState::Shutdown
        )
    }

    fn cancel_grace(&self) {
        if let Some(token) = lock(&self.grace).take() {
            token.cancel();
        }
    }
}

impl LifecycleCoordinator {
    pub fn new(config: LifecycleConfig, notices: NoticeSink) -> Self {
        let (state, _) = watch::channel(LifecycleState::Active);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                notices,
                registry: Mutex::new(Registry::default()),
                state,
                shutdown: Mutex::new(None),
                grace: Mutex::new(None),
                transition: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Register (or replace, by name) a cleanup hook.
    pub fn register_cleanup<F, Fut>(
        &self,
        name: impl Into<String>,
        priority: i32,
        callback: F,
    ) -> CleanupHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut registry = self.inner.registry();
        let seq = registry.seq();
        let replaced = registry.cleanup.iter().any(|e| e.name == name);
        registry.cleanup.retain(|e| e.name != name);
        registry.cleanup.push(CleanupEntry {
            name: name.clone(),
            priority,
            seq,
            callback: hook(callback),
        });
        debug!(hook = %name, priority, replaced, "cleanup hook registered");

        CleanupHandle {
            name,
            seq,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register (or replace, by name) a pause / resume hook pair.
    pub fn register_suspend<P, PF, R, RF>(
        &self,
        name: impl Into<String>,
        priority: i32,
        on_pause: P,
        on_resume: R,
    ) where
        P: Fn() -> PF + Send + Sync + 'static,
        PF: Future<Output = anyhow::Result<()>> + Send + 'static,
        R: Fn() -> RF + Send + Sync + 'static,
        RF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut registry = self.inner.registry();
        let seq = registry.seq();
        registry.suspend.retain(|e| e.name != name);
        registry.suspend.push(SuspendEntry {
            name: name.clone(),
            priority,
            seq,
            on_pause: hook(on_pause),
            on_resume: hook(on_resume),
        });
        debug!(hook = %name, priority, "suspend hook registered");
    }

    /// Run every cleanup hook once. Concurrent and repeated callers share the
    /// same run and receive the same report.
    pub async fn shutdown(&self) -> PhaseReport {
        let run = {
            let mut slot = lock(&self.inner.shutdown);
            slot.get_or_insert_with(|| {
                let inner = self.inner.clone();
                let task = tokio::spawn(run_shutdown(inner));
                async move {
                    task.await.unwrap_or_else(|e| {
                        warn!(error = %e, "shutdown task aborted");
                        PhaseReport::default()
                    })
                }
                .boxed()
                .shared()
            })
            .clone()
        };
        run.await
    }

    /// Active -> Paused. Starts the grace timer.
    pub async fn pause(&self) {
        let _transition = self.inner.transition.lock().await;
        if self.state() != LifecycleState::Active {
            return;
        }
        let hooks = self.inner.registry().pause_order();
        let deadline = Instant::now() + self.inner.config.shutdown_budget();
        let report = run_phase("pause", hooks, deadline).await;
        if !self.inner.advance(LifecycleState::Active, LifecycleState::Paused) {
            return;
        }
        info!(hooks = report.completed.len(), failed = report.failed.len(), "paused");
        self.start_grace_timer();
    }

    /// Paused -> Active. Cancels the grace timer.
    pub async fn resume(&self) {
        let _transition = self.inner.transition.lock().await;
        if self.state() != LifecycleState::Paused {
            return;
        }
        self.inner.cancel_grace();
        let hooks = self.inner.registry().resume_order();
        let deadline = Instant::now() + self.inner.config.shutdown_budget();
        let report = run_phase("resume", hooks, deadline).await;
        if !self.inner.advance(LifecycleState::Paused, LifecycleState::Active) {
            return;
        }
        info!(hooks = report.completed.len(), failed = report.failed.len(), "resumed");
    }

    pub async fn handle_signal(&self, signal: HostSignal) {
        debug!(?signal, "host signal");
        match signal {
            HostSignal::Hidden => self.pause().await,
            HostSignal::Visible => self.resume().await,
            HostSignal::Unload => {
                self.shutdown().await;
            }
        }
    }

    fn start_grace_timer(&self) {
        if self.inner.shutting_down() {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = lock(&self.inner.grace).replace(token.clone()) {
            previous.cancel();
        }

        let grace = self.inner.config.hidden_grace();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace) => {
                    if let Some(inner) = weak.upgrade() {
                        info!(grace_ms = grace.as_millis() as u64, "pause outlasted grace period, shutting down");
                        LifecycleCoordinator { inner }.shutdown().await;
                    }
                }
            }
        });
    }
}

async fn run_shutdown(inner: Arc<CoordinatorInner>) -> PhaseReport {
    inner.cancel_grace();
    inner.set_state(LifecycleState::ShuttingDown);

    let hooks = inner.registry().cleanup_order();
    let budget = inner.config.shutdown_budget();
    info!(hooks = hooks.len(), budget_ms = budget.as_millis() as u64, "shutdown started");

    let report = run_phase("cleanup", hooks, Instant::now() + budget).await;
    if !report.skipped.is_empty() {
        let err = EngineError::ShutdownTimeout {
            budget_ms: budget.as_millis() as u64,
            skipped: report.skipped.len(),
        };
        warn!(error = %err, skipped = ?report.skipped, "shutdown budget exhausted");
    }

    inner.set_state(LifecycleState::Shutdown);
    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        elapsed_ms = report.elapsed_ms,
        "shutdown complete"
    );
    report
}

/// Run `hooks` in order, each in its own task, until `deadline`.
async fn run_phase(phase: &'static str, hooks: Vec<(String, HookFn)>, deadline: Instant) -> PhaseReport {
    let started = Instant::now();
    let mut report = PhaseReport::default();
    let mut hooks = hooks.into_iter();

    while let Some((name, callback)) = hooks.next() {
        if Instant::now() >= deadline {
            report.skipped.push(name);
            report.skipped.extend(hooks.by_ref().map(|(name, _)| name));
            break;
        }

        let mut task = tokio::spawn(async move { callback().await });
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(()))) => {
                debug!(phase, hook = %name, "hook finished");
                report.completed.push(name);
            }
            Ok(Ok(Err(e))) => {
                warn!(phase, hook = %name, error = %e, "hook failed");
                report.failed.push(name);
            }
            Ok(Err(e)) => {
                warn!(phase, hook = %name, error = %e, "hook panicked");
                report.failed.push(name);
            }
            Err(_) => {
                task.abort();
                warn!(phase, hook = %name, "hook cut off by budget");
                report.skipped.push(name);
                report.skipped.extend(hooks.by_ref().map(|(name, _)| name));
                break;
            }
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn coordinator(budget_ms: u64, grace_ms: u64) -> LifecycleCoordinator {
        LifecycleCoordinator::new(
            LifecycleConfig {
                shutdown_budget_ms: budget_ms,
                hidden_grace_ms: grace_ms,
            },
            NoticeSink::disabled(),
        )
    }

    fn recorder(log: &Log, entry: &str) -> impl Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        let log = log.clone();
        let entry = entry.to_string();
        move || {
            let log = log.clone();
            let entry = entry.clone();
            async move {
                log.lock().unwrap().push(entry);
                Ok(())
            }
            .boxed()
        }
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_cleanup_runs_in_descending_priority() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("ten", 10, recorder(&log, "ten"));
        lc.register_cleanup("five", 5, recorder(&log, "five"));
        lc.register_cleanup("twenty", 20, recorder(&log, "twenty"));

        let report = lc.shutdown().await;
        assert_eq!(entries(&log), vec!["twenty", "ten", "five"]);
        assert_eq!(report.completed, vec!["twenty", "ten", "five"]);
        assert_eq!(lc.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_ties_run_in_registration_order() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("a", 1, recorder(&log, "a"));
        lc.register_cleanup("b", 1, recorder(&log, "b"));
        lc.register_cleanup("c", 1, recorder(&log, "c"));
        lc.shutdown().await;
        assert_eq!(entries(&log), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_by_name() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        let stale = lc.register_cleanup("pool", 10, recorder(&log, "old"));
        let fresh = lc.register_cleanup("pool", 10, recorder(&log, "new"));
        let gone = lc.register_cleanup("metrics", 1, recorder(&log, "metrics"));

        assert!(!stale.unregister());
        assert!(gone.unregister());
        assert_eq!(fresh.name(), "pool");

        lc.shutdown().await;
        assert_eq!(entries(&log), vec!["new"]);
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_runs_hooks_once() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("only", 1, recorder(&log, "only"));

        let (a, b) = tokio::join!(lc.shutdown(), lc.shutdown());
        let c = lc.shutdown().await;
        assert_eq!(entries(&log), vec!["only"]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_skips_remaining_hooks() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("slow", 10, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        lc.register_cleanup("after", 5, recorder(&log, "after"));

        let start = Instant::now();
        let report = lc.shutdown().await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(2_000));
        assert!(elapsed < Duration::from_millis(2_100));
        assert_eq!(report.skipped, vec!["slow", "after"]);
        assert!(entries(&log).is_empty());
        assert_eq!(lc.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_hooks_are_isolated() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("boom", 30, || async {
            if true {
                panic!("hook exploded");
            }
            Ok(())
        });
        lc.register_cleanup("err", 20, || async { Err(anyhow::anyhow!("device busy")) });
        lc.register_cleanup("last", 10, recorder(&log, "last"));

        let report = lc.shutdown().await;
        assert_eq!(report.failed, vec!["boom", "err"]);
        assert_eq!(report.completed, vec!["last"]);
        assert_eq!(entries(&log), vec!["last"]);
    }

    #[tokio::test]
    async fn test_pause_and_resume_hook_order() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        for (name, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            lc.register_suspend(
                name,
                priority,
                recorder(&log, &format!("pause:{name}")),
                recorder(&log, &format!("resume:{name}")),
            );
        }

        lc.pause().await;
        assert_eq!(lc.state(), LifecycleState::Paused);
        lc.resume().await;
        assert_eq!(lc.state(), LifecycleState::Active);

        assert_eq!(
            entries(&log),
            vec![
                "pause:high",
                "pause:mid",
                "pause:low",
                "resume:low",
                "resume:mid",
                "resume:high"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_pause_escalates_to_shutdown() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_cleanup("pool", 1, recorder(&log, "pool"));

        lc.handle_signal(HostSignal::Hidden).await;
        let mut state = lc.subscribe();
        tokio::time::sleep(Duration::from_secs(31)).await;
        state
            .wait_for(|s| *s == LifecycleState::Shutdown)
            .await
            .unwrap();
        assert_eq!(entries(&log), vec!["pool"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_cancels_grace_timer() {
        let lc = coordinator(2_000, 30_000);
        lc.handle_signal(HostSignal::Hidden).await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        lc.handle_signal(HostSignal::Visible).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lc.state(), LifecycleState::Active);
    }

    #[tokio::test]
    async fn test_no_pause_after_shutdown() {
        let lc = coordinator(2_000, 30_000);
        lc.handle_signal(HostSignal::Unload).await;
        lc.handle_signal(HostSignal::Hidden).await;
        assert_eq!(lc.state(), LifecycleState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_pause_stays_terminal() {
        let lc = coordinator(2_000, 30_000);
        let log = Log::default();
        lc.register_suspend(
            "slow",
            1,
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            },
            recorder(&log, "resume:slow"),
        );
        let mut states = lc.subscribe();

        let pausing = tokio::spawn({
            let lc = lc.clone();
            async move { lc.handle_signal(HostSignal::Hidden).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lc.handle_signal(HostSignal::Unload).await;
        pausing.await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Shutdown);

        lc.handle_signal(HostSignal::Visible).await;
        assert_eq!(lc.state(), LifecycleState::Shutdown);
        assert!(entries(&log).is_empty());

        // No grace timer was armed by the superseded pause.
        states.borrow_and_update();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!states.has_changed().unwrap());
        assert_eq!(lc.state(), LifecycleState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_resume_stays_terminal() {
        let lc = coordinator(2_000, 30_000);
        lc.register_suspend(
            "slow",
            1,
            || async { Ok(()) },
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            },
        );
        lc.pause().await;
        assert_eq!(lc.state(), LifecycleState::Paused);

        let resuming = tokio::spawn({
            let lc = lc.clone();
            async move { lc.resume().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        lc.shutdown().await;
        resuming.await.unwrap();
        assert_eq!(lc.state(), LifecycleState::Shutdown);
    }
}
