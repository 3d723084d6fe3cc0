//! Background poller for streaming devices.
//!
//! A [`Poller`] owns one tokio task that repeatedly asks a [`PollSource`] for data and
//! pushes each payload into a bounded [`ResultQueue`]. The queue never blocks the producer:
//! when it is full the oldest result is dropped, so a slow consumer always sees the most
//! recent `max_queue_size` results in production order.
//!
//! Shutdown is cooperative. A stop request is observed at iteration boundaries (or while
//! waiting for the next tick), never in the middle of a transport exchange. If the task does
//! not finish within the caller's deadline the poller is reported unresponsive.
//!
//! A source error ends the task; the error is parked in the queue and handed to the
//! consumer by the next `fetch`.

use crate::backend::{Backend, SharedBackend};
use crate::error::{DeviceError, DeviceResult};
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

// =============================================================================
// Configuration
// =============================================================================

/// How often the source is polled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PollRate {
    /// Fixed period; late ticks are delayed rather than bursted
    Interval(Duration),
    /// As fast as the source produces data
    Continuous,
}

impl PollRate {
    /// Rate in Hz. `None` means continuous.
    pub fn from_hz(hz: Option<f64>) -> DeviceResult<Self> {
        match hz {
            None => Ok(PollRate::Continuous),
            Some(hz) if hz.is_finite() && hz > 0.0 => {
                Ok(PollRate::Interval(Duration::from_secs_f64(1.0 / hz)))
            }
            Some(hz) => Err(DeviceError::Configuration(format!(
                "poll rate must be a positive number of Hz, got {hz}"
            ))),
        }
    }
}

/// Poller settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerConfig {
    /// Polling cadence
    pub poll_rate: PollRate,
    /// Queue capacity; older results are dropped beyond it
    pub max_queue_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_rate: PollRate::Continuous,
            max_queue_size: 1000,
        }
    }
}

// =============================================================================
// Sources and results
// =============================================================================

/// What one poll iteration produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// A payload to enqueue
    Data(Value),
    /// Nothing this time
    Idle,
    /// The stream ended normally; stop polling
    Finished,
}

/// Produces payloads from a backend, one iteration at a time.
#[async_trait]
pub trait PollSource: Send {
    /// Called once by `Device::start` before the task is spawned.
    async fn on_start(&mut self, _backend: &mut dyn Backend) -> DeviceResult<()> {
        Ok(())
    }

    /// One iteration. Errors stop the poller.
    async fn poll(&mut self, backend: &mut dyn Backend) -> DeviceResult<PollOutcome>;

    /// Called by the task after its last iteration.
    async fn on_stop(&mut self, _backend: &mut dyn Backend) {}
}

/// One unit of streamed data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollResult {
    /// When the payload was received
    pub timestamp: DateTime<Utc>,
    /// Position in production order, starting at 0 for each run
    pub sequence: u64,
    /// The data
    pub payload: Value,
}

// =============================================================================
// ResultQueue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<PollResult>,
    dropped: u64,
    fault: Option<DeviceError>,
}

/// Bounded FIFO between the poller and its single consumer. Drops the oldest entry when full.
#[derive(Debug)]
pub struct ResultQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl ResultQueue {
    /// Queue holding at most `capacity` results (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(4096)),
                ..QueueState::default()
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Append a result. Returns `true` if an older result was dropped to make room.
    pub fn push(&self, result: PollResult) -> bool {
        let dropped = {
            let mut state = self.state.lock();
            let dropped = if state.items.len() >= self.capacity {
                state.items.pop_front();
                state.dropped += 1;
                true
            } else {
                false
            };
            state.items.push_back(result);
            dropped
        };
        self.notify.notify_waiters();
        dropped
    }

    /// Remove and return everything queued, oldest first.
    pub fn drain(&self) -> Vec<PollResult> {
        self.state.lock().items.drain(..).collect()
    }

    /// Number of queued results.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Results discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Park a poller error for the consumer.
    pub fn set_fault(&self, error: DeviceError) {
        self.state.lock().fault = Some(error);
        self.notify.notify_waiters();
    }

    /// Take the parked poller error, if any.
    pub fn take_fault(&self) -> Option<DeviceError> {
        self.state.lock().fault.take()
    }

    /// Wake anyone waiting, e.g. because the producer is gone.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Wait until data or a fault is available, or the timeout passes.
    /// Returns whether anything is available.
    pub async fn wait(&self, timeout: Duration, producer_alive: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if !state.items.is_empty() || state.fault.is_some() {
                    return true;
                }
            }
            if !producer_alive() {
                return false;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_empty();
            }
        }
    }
}

// =============================================================================
// Poller
// =============================================================================

/// Handle to a running poll task.
#[derive(Debug)]
pub struct Poller {
    handle: Option<JoinHandle<()>>,
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
}

impl Poller {
    /// Spawn the poll task. The source's `on_start` must already have run.
    pub fn spawn(
        device: &str,
        backend: SharedBackend,
        source: Box<dyn PollSource>,
        config: PollerConfig,
        queue: Arc<ResultQueue>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let span = info_span!("poller", device = %device);
        let handle = tokio::spawn(
            poll_loop(
                backend,
                source,
                config,
                queue,
                Arc::clone(&running),
                stop_rx,
            )
            .instrument(span),
        );
        Self {
            handle: Some(handle),
            stop_tx,
            running,
        }
    }

    /// Whether the task is still producing.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Shared view of the running flag.
    #[must_use]
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Ask the task to finish after its current iteration.
    pub fn request_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Request a stop and wait up to `timeout` for the task to end.
    ///
    /// On timeout the task is left alone and `UnresponsiveWorker` is returned; the caller may
    /// retry or [`abort`](Self::abort).
    pub async fn stop(&mut self, timeout: Duration) -> DeviceResult<()> {
        self.request_stop();
        let Some(handle) = self.handle.as_mut() else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, handle).await {
            Ok(joined) => {
                self.handle = None;
                self.running.store(false, Ordering::SeqCst);
                match joined {
                    Err(e) if e.is_panic() => Err(DeviceError::PollerFault(Box::new(
                        DeviceError::command("poll task panicked"),
                    ))),
                    _ => Ok(()),
                }
            }
            Err(_) => {
                warn!(?timeout, "poller did not stop in time");
                Err(DeviceError::UnresponsiveWorker(timeout))
            }
        }
    }

    /// Cancel the task at its next await point.
    pub fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.request_stop();
    }
}

/// Pause between continuous polls after a source reported nothing.
const IDLE_BACKOFF: Duration = Duration::from_millis(20);

async fn poll_loop(
    backend: SharedBackend,
    mut source: Box<dyn PollSource>,
    config: PollerConfig,
    queue: Arc<ResultQueue>,
    running: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(rate = ?config.poll_rate, capacity = queue.capacity(), "poller started");
    let mut ticker = match config.poll_rate {
        PollRate::Interval(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        }
        PollRate::Continuous => None,
    };
    let mut sequence = 0u64;
    let mut idle = false;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        match ticker.as_mut() {
            Some(ticker) => {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = ticker.tick() => {}
                }
            }
            None if idle => {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                    _ = tokio::time::sleep(IDLE_BACKOFF) => {}
                }
            }
            None => tokio::task::yield_now().await,
        }

        let outcome = {
            let mut guard = backend.lock().await;
            source.poll(&mut **guard).await
        };
        idle = matches!(outcome, Ok(PollOutcome::Idle));
        match outcome {
            Ok(PollOutcome::Data(payload)) => {
                let result = PollResult {
                    timestamp: Utc::now(),
                    sequence,
                    payload,
                };
                if queue.push(result) {
                    trace!(sequence, "queue full, dropped oldest result");
                }
                sequence += 1;
            }
            Ok(PollOutcome::Idle) => {}
            Ok(PollOutcome::Finished) => {
                info!(produced = sequence, "source finished");
                break;
            }
            Err(e) => {
                error!(error = %e, "poll failed, stopping");
                queue.set_fault(e);
                break;
            }
        }
    }

    {
        let mut guard = backend.lock().await;
        source.on_stop(&mut **guard).await;
    }
    running.store(false, Ordering::SeqCst);
    queue.wake();
    debug!(produced = sequence, dropped = queue.dropped(), "poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{wrap_shared, SimulatedBackend, SimulatedInstrument, SimulatedParams};

    fn result(sequence: u64) -> PollResult {
        PollResult {
            timestamp: Utc::now(),
            sequence,
            payload: Value::Int(sequence as i64),
        }
    }

    struct Counter {
        limit: u64,
        next: u64,
    }

    #[async_trait]
    impl PollSource for Counter {
        async fn poll(&mut self, _backend: &mut dyn Backend) -> DeviceResult<PollOutcome> {
            if self.next >= self.limit {
                return Ok(PollOutcome::Finished);
            }
            self.next += 1;
            Ok(PollOutcome::Data(Value::Int(self.next as i64)))
        }
    }

    struct Failing;

    #[async_trait]
    impl PollSource for Failing {
        async fn poll(&mut self, _backend: &mut dyn Backend) -> DeviceResult<PollOutcome> {
            Err(DeviceError::command("transport vanished"))
        }
    }

    async fn backend() -> SharedBackend {
        let mut backend = SimulatedBackend::new(SimulatedParams::new(SimulatedInstrument::new()));
        backend.open().await.unwrap();
        wrap_shared(Box::new(backend))
    }

    #[test]
    fn test_queue_drops_oldest() {
        let queue = ResultQueue::new(3);
        for i in 0..5 {
            queue.push(result(i));
        }
        let kept: Vec<u64> = queue.drain().iter().map(|r| r.sequence).collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(queue.dropped(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_poll_rate_from_hz() {
        assert_eq!(
            PollRate::from_hz(Some(4.0)).unwrap(),
            PollRate::Interval(Duration::from_millis(250))
        );
        assert_eq!(PollRate::from_hz(None).unwrap(), PollRate::Continuous);
        assert!(PollRate::from_hz(Some(0.0)).is_err());
        assert!(PollRate::from_hz(Some(f64::NAN)).is_err());
    }

    #[tokio::test]
    async fn test_wait_times_out_empty() {
        let queue = ResultQueue::new(4);
        let start = Instant::now();
        assert!(!queue.wait(Duration::from_millis(30), || true).await);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(!queue.wait(Duration::from_secs(5), || false).await);
    }

    #[tokio::test]
    async fn test_finished_source_stops_cleanly() {
        let queue = Arc::new(ResultQueue::new(100));
        let mut poller = Poller::spawn(
            "counter",
            backend().await,
            Box::new(Counter { limit: 5, next: 0 }),
            PollerConfig::default(),
            Arc::clone(&queue),
        );
        poller.stop(Duration::from_secs(2)).await.ok();
        let deadline = Instant::now() + Duration::from_secs(2);
        while poller.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!poller.is_running());
        assert!(queue.take_fault().is_none());
        let sequences: Vec<u64> = queue.drain().iter().map(|r| r.sequence).collect();
        assert!(sequences.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[tokio::test]
    async fn test_source_error_parks_fault() {
        let queue = Arc::new(ResultQueue::new(10));
        let poller = Poller::spawn(
            "failing",
            backend().await,
            Box::new(Failing),
            PollerConfig::default(),
            Arc::clone(&queue),
        );
        assert!(queue.wait(Duration::from_secs(2), || true).await);
        let fault = queue.take_fault().unwrap();
        assert!(fault.to_string().contains("transport vanished"));

        let deadline = Instant::now() + Duration::from_secs(2);
        while poller.is_running() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn test_interval_poller_stops_promptly() {
        let queue = Arc::new(ResultQueue::new(10));
        let mut poller = Poller::spawn(
            "slow",
            backend().await,
            Box::new(Counter {
                limit: u64::MAX,
                next: 0,
            }),
            PollerConfig {
                poll_rate: PollRate::Interval(Duration::from_secs(1)),
                max_queue_size: 10,
            },
            Arc::clone(&queue),
        );
        assert!(queue.wait(Duration::from_secs(2), || true).await);
        let started = Instant::now();
        poller.stop(Duration::from_secs(2)).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!poller.is_running());
    }
}
