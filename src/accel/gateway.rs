use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device::{AcceleratorContext, AcceleratorDevice, DeviceLimits};
use super::AcceleratorState;
use crate::error::EngineResult;
use crate::kernel::{ComputeParams, OperationKind};

/// Owner of the single accelerator context.
///
/// Once acquisition fails or the context is lost, every call short-circuits
/// to the caller's fallback until [`AcceleratorGateway::reprobe`] is invoked.
#[derive(Clone)]
pub struct AcceleratorGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    device: Arc<dyn AcceleratorDevice>,
    timeout: Duration,
    state: watch::Sender<AcceleratorState>,
    context: RwLock<Option<Arc<dyn AcceleratorContext>>>,
    limits: RwLock<Option<DeviceLimits>>,
    /// Serializes initialize / reprobe so only one acquisition runs.
    init_lock: Mutex<()>,
    /// Stops the loss watcher of the current context.
    watcher: Mutex<Option<CancellationToken>>,
    closed: AtomicBool,
}

impl AcceleratorGateway {
    pub fn new(device: Arc<dyn AcceleratorDevice>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(AcceleratorState::Uninitialized);
        Self {
            inner: Arc::new(GatewayInner {
                device,
                timeout,
                state,
                context: RwLock::new(None),
                limits: RwLock::new(None),
                init_lock: Mutex::new(()),
                watcher: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Acquire the context if it has never been attempted.
    ///
    /// Returns readiness. A `Failed` gateway is not retried here.
    pub async fn initialize(&self) -> bool {
        let _guard = self.inner.init_lock.lock().await;
        match self.state() {
            AcceleratorState::Ready => true,
            AcceleratorState::Failed => false,
            AcceleratorState::Uninitialized | AcceleratorState::Initializing => {
                self.acquire().await
            }
        }
    }

    /// Manually retry acquisition once, moving `Failed -> Initializing`.
    pub async fn reprobe(&self) -> bool {
        let _guard = self.inner.init_lock.lock().await;
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("re-probe ignored, gateway released");
            return false;
        }
        match self.state() {
            AcceleratorState::Ready => true,
            _ => {
                info!(device = self.inner.device.name(), "re-probing accelerator");
                self.acquire().await
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.state() == AcceleratorState::Ready
    }

    pub fn state(&self) -> AcceleratorState {
        *self.inner.state.borrow()
    }

    /// Receive every state transition without polling.
    pub fn subscribe(&self) -> watch::Receiver<AcceleratorState> {
        self.inner.state.subscribe()
    }

    /// Limits of the last acquired context, if any.
    pub async fn limits(&self) -> Option<DeviceLimits> {
        self.inner.limits.read().await.clone()
    }

    /// Run `op` on the accelerator, resolving through `fallback` when the
    /// gateway is not ready, the dispatch fails, or the timeout expires.
    pub async fn compute<F, Fut>(
        &self,
        op: OperationKind,
        params: ComputeParams,
        data: Vec<f32>,
        fallback: F,
    ) -> EngineResult<Vec<f32>>
    where
        F: FnOnce(Vec<f32>) -> Fut,
        Fut: Future<Output = EngineResult<Vec<f32>>>,
    {
        let Some(ctx) = self.ready_context().await else {
            debug!(state = %self.state(), "accelerator unavailable, using fallback");
            return fallback(data).await;
        };

        let expected = data.len();
        match tokio::time::timeout(self.inner.timeout, ctx.dispatch(op, params, data.clone())).await
        {
            Ok(Ok(out)) if out.len() == expected => Ok(out),
            Ok(Ok(out)) => {
                warn!(expected, got = out.len(), "accelerator returned malformed buffer, using fallback");
                fallback(data).await
            }
            Ok(Err(e)) => {
                warn!(error = %e, "accelerator dispatch failed, using fallback");
                fallback(data).await
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.timeout.as_millis() as u64,
                    "accelerator dispatch timed out, using fallback"
                );
                fallback(data).await
            }
        }
    }

    /// Drop the context for shutdown. No later call reaches the device.
    pub async fn release(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(stop) = self.inner.watcher.lock().await.take() {
            stop.cancel();
        }
        if self.inner.context.write().await.take().is_some() {
            info!("accelerator context released");
        }
        self.set_state(AcceleratorState::Failed);
    }

    async fn ready_context(&self) -> Option<Arc<dyn AcceleratorContext>> {
        if !self.is_available() {
            return None;
        }
        self.inner.context.read().await.clone()
    }

    async fn acquire(&self) -> bool {
        self.set_state(AcceleratorState::Initializing);
        match self.inner.device.acquire().await {
            Ok(ctx) => {
                let ctx: Arc<dyn AcceleratorContext> = Arc::from(ctx);
                *self.inner.limits.write().await = Some(ctx.limits());
                let lost = ctx.lost();
                *self.inner.context.write().await = Some(ctx);
                self.watch_for_loss(lost).await;
                self.set_state(AcceleratorState::Ready);
                true
            }
            Err(e) => {
                warn!(device = self.inner.device.name(), error = %e, "accelerator acquisition failed");
                self.set_state(AcceleratorState::Failed);
                false
            }
        }
    }

    async fn watch_for_loss(&self, lost: CancellationToken) {
        let stop = CancellationToken::new();
        if let Some(previous) = self.inner.watcher.lock().await.replace(stop.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = lost.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        AcceleratorGateway { inner }.on_context_lost().await;
                    }
                }
            }
        });
    }

    async fn on_context_lost(&self) {
        warn!(device = self.inner.device.name(), "accelerator context lost");
        self.inner.context.write().await.take();
        self.set_state(AcceleratorState::Failed);
    }

    fn set_state(&self, next: AcceleratorState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, "accelerator state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::device::NullDevice;
    use crate::error::EngineError;
    use crate::kernel;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct MockDevice {
        acquisitions: AtomicUsize,
        fail_first: usize,
        delay: Duration,
        lost: CancellationToken,
    }

    impl MockDevice {
        fn new(fail_first: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                acquisitions: AtomicUsize::new(0),
                fail_first,
                delay,
                lost: CancellationToken::new(),
            })
        }
    }

    struct MockContext {
        delay: Duration,
        lost: CancellationToken,
    }

    #[async_trait]
    impl AcceleratorDevice for MockDevice {
        fn name(&self) -> &str {
            "mock"
        }

        async fn acquire(&self) -> EngineResult<Box<dyn AcceleratorContext>> {
            let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(EngineError::InitializationFailure {
                    reason: "context creation rejected".into(),
                });
            }
            Ok(Box::new(MockContext {
                delay: self.delay,
                lost: self.lost.clone(),
            }))
        }
    }

    #[async_trait]
    impl AcceleratorContext for MockContext {
        fn limits(&self) -> DeviceLimits {
            DeviceLimits {
                max_buffer_bytes: Some(1 << 20),
                ..Default::default()
            }
        }

        async fn dispatch(
            &self,
            op: OperationKind,
            params: ComputeParams,
            data: Vec<f32>,
        ) -> EngineResult<Vec<f32>> {
            tokio::time::sleep(self.delay).await;
            kernel::execute(op, &params, &data)
        }

        fn lost(&self) -> CancellationToken {
            self.lost.clone()
        }
    }

    fn sentinel(data: Vec<f32>) -> std::future::Ready<EngineResult<Vec<f32>>> {
        std::future::ready(Ok(vec![-1.0; data.len()]))
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready() {
        let device = MockDevice::new(0, Duration::ZERO);
        let gw = AcceleratorGateway::new(device.clone(), Duration::from_secs(1));
        assert_eq!(gw.state(), AcceleratorState::Uninitialized);

        assert!(gw.initialize().await);
        assert!(gw.is_available());
        assert_eq!(gw.limits().await.unwrap().max_buffer_bytes, Some(1 << 20));

        // Second call does not re-acquire.
        assert!(gw.initialize().await);
        assert_eq!(device.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_gateway_short_circuits_without_reacquiring() {
        let device = MockDevice::new(usize::MAX, Duration::ZERO);
        let gw = AcceleratorGateway::new(device.clone(), Duration::from_secs(1));

        assert!(!gw.initialize().await);
        assert_eq!(gw.state(), AcceleratorState::Failed);

        let out = gw
            .compute(OperationKind::Transform, ComputeParams::default(), vec![1.0; 8], sentinel)
            .await
            .unwrap();
        assert_eq!(out, vec![-1.0; 8]);

        assert!(!gw.initialize().await);
        assert_eq!(device.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reprobe_recovers_from_failed() {
        let device = MockDevice::new(1, Duration::ZERO);
        let gw = AcceleratorGateway::new(device.clone(), Duration::from_secs(1));

        assert!(!gw.initialize().await);
        assert!(gw.reprobe().await);
        assert_eq!(gw.state(), AcceleratorState::Ready);
        assert_eq!(device.acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_context_loss_notifies_subscribers() {
        let device = MockDevice::new(0, Duration::ZERO);
        let gw = AcceleratorGateway::new(device.clone(), Duration::from_secs(1));
        assert!(gw.initialize().await);

        let mut rx = gw.subscribe();
        device.lost.cancel();

        rx.wait_for(|s| *s == AcceleratorState::Failed).await.unwrap();
        assert!(!gw.is_available());

        let out = gw
            .compute(OperationKind::Transform, ComputeParams::default(), vec![1.0; 4], sentinel)
            .await
            .unwrap();
        assert_eq!(out, vec![-1.0; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_dispatch_resolves_via_fallback() {
        let device = MockDevice::new(0, Duration::from_secs(60));
        let gw = AcceleratorGateway::new(device, Duration::from_secs(10));
        assert!(gw.initialize().await);

        let start = tokio::time::Instant::now();
        let out = gw
            .compute(OperationKind::Transform, ComputeParams::default(), vec![1.0; 4], sentinel)
            .await
            .unwrap();
        assert_eq!(out, vec![-1.0; 4]);
        assert!(start.elapsed() < Duration::from_secs(11));
        // A timeout alone does not fail the gateway.
        assert!(gw.is_available());
    }

    #[tokio::test]
    async fn test_ready_gateway_uses_exact_kernel() {
        let device = MockDevice::new(0, Duration::ZERO);
        let gw = AcceleratorGateway::new(device, Duration::from_secs(1));
        gw.initialize().await;

        let data = vec![0.5; 8];
        let params = ComputeParams::new(1.0, 0);
        let out = gw
            .compute(OperationKind::Inference, params, data.clone(), sentinel)
            .await
            .unwrap();
        assert_eq!(out, kernel::execute(OperationKind::Inference, &params, &data).unwrap());
    }

    #[tokio::test]
    async fn test_release_is_terminal() {
        let device = MockDevice::new(0, Duration::ZERO);
        let gw = AcceleratorGateway::new(device, Duration::from_secs(1));
        gw.initialize().await;

        gw.release().await;
        assert_eq!(gw.state(), AcceleratorState::Failed);
        assert!(!gw.reprobe().await);
    }

    #[tokio::test]
    async fn test_null_device_fails() {
        let gw = AcceleratorGateway::new(Arc::new(NullDevice), Duration::from_secs(1));
        assert!(!gw.initialize().await);
        assert!(gw.limits().await.is_none());
    }
}
