//! Camera frame source.
//!
//! Pulls frames from the camera on a dedicated blocking context and fans
//! them out to every subscriber. Subscriptions are bounded and lossy: a
//! subscriber that falls behind loses the newest frames (counted per
//! subscriber) instead of stalling the camera.
//!
//! # Poll Loop
//!
//! The camera has no "wait for frame" primitive, so the loop polls:
//!
//! 1. Lock the device, ask how many frames are buffered, pop one if any
//! 2. Release the lock, stamp sequence number and capture time
//! 3. Publish to every subscriber with `try_send`
//! 4. Sleep ~0.5 ms when nothing was buffered
//!
//! Three consecutive failed device calls end the loop with one error event
//! and the `Failed` state.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::HardwareClock;
use crate::config::CameraSettings;
use crate::data::{Frame, RawImage};
use crate::error::{DaqError, DaqResult};
use crate::events::EventSink;
use crate::hardware::DeviceHandle;

/// Sleep between polls when the device buffer is empty.
pub const IDLE_POLL: Duration = Duration::from_micros(500);

/// Consecutive failed device calls that end acquisition.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Lifecycle of the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    /// Never started
    Idle,
    /// Acquiring
    Running,
    /// Stopped on request
    Stopped,
    /// Stopped by repeated device failures
    Failed,
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Idle => write!(f, "Idle"),
            SourceState::Running => write!(f, "Running"),
            SourceState::Stopped => write!(f, "Stopped"),
            SourceState::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Fan-out
// =============================================================================

struct Subscriber {
    label: String,
    tx: mpsc::Sender<Arc<Frame>>,
    dropped: Arc<AtomicU64>,
}

/// Publishes each frame to a changing set of bounded subscriptions.
#[derive(Clone, Default)]
pub struct FanOut {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl FanOut {
    /// Create an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber whose queue holds at most `capacity` frames.
    pub fn subscribe(&self, label: &str, capacity: usize) -> FrameSubscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().push(Subscriber {
            label: label.to_string(),
            tx,
            dropped: dropped.clone(),
        });
        FrameSubscription {
            label: label.to_string(),
            rx,
            dropped,
        }
    }

    /// Offer `frame` to every subscriber without waiting.
    ///
    /// Full queues drop this frame for that subscriber; closed subscriptions
    /// are removed.
    pub fn publish(&self, frame: Arc<Frame>) {
        self.subscribers.lock().retain(|sub| {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        debug!("Subscriber '{}' behind, {} frames dropped", sub.label, dropped);
                    }
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Subscriber '{}' closed", sub.label);
                    false
                }
            }
        });
    }

    /// Live subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// Receiving end of a fan-out subscription. Dropping it unsubscribes.
pub struct FrameSubscription {
    label: String,
    rx: mpsc::Receiver<Arc<Frame>>,
    dropped: Arc<AtomicU64>,
}

impl FrameSubscription {
    /// Next frame; `None` once the producer is gone.
    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<Frame>> {
        self.rx.try_recv().ok()
    }

    /// Frames this subscriber lost because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscriber label.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for FrameSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSubscription")
            .field("label", &self.label)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Anything that hands out frame subscriptions and reports its health.
pub trait FrameProducer: Send + Sync {
    /// Subscribe with a bounded, lossy queue.
    fn subscribe(&self, label: &str, capacity: usize) -> FrameSubscription;

    /// Watch the producer's state.
    fn state(&self) -> watch::Receiver<SourceState>;
}

// =============================================================================
// ManualSource - frames pushed by hand
// =============================================================================

/// Producer fed by the caller, for replaying recorded frames and for tests.
pub struct ManualSource {
    fanout: FanOut,
    state: watch::Sender<SourceState>,
    next_sequence: AtomicU64,
}

impl ManualSource {
    /// Create a source in the `Running` state.
    pub fn new() -> Self {
        let (state, _) = watch::channel(SourceState::Running);
        Self {
            fanout: FanOut::new(),
            state,
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Publish a uniform frame stamped with the next sequence number.
    pub fn push(&self, width: u32, height: u32, value: u16, captured_at: Duration) -> u64 {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let raw = RawImage::filled(width, height, value);
        self.fanout
            .publish(Arc::new(Frame::from_raw(raw, sequence, captured_at)));
        sequence
    }

    /// Publish a prepared frame as is.
    pub fn push_frame(&self, frame: Arc<Frame>) {
        self.fanout.publish(frame);
    }

    /// Change the reported state.
    pub fn set_state(&self, state: SourceState) {
        self.state.send_replace(state);
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameProducer for ManualSource {
    fn subscribe(&self, label: &str, capacity: usize) -> FrameSubscription {
        self.fanout.subscribe(label, capacity)
    }

    fn state(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }
}

// =============================================================================
// CameraSource
// =============================================================================

/// Continuous camera acquisition with fan-out.
pub struct CameraSource {
    device: DeviceHandle,
    clock: Arc<dyn HardwareClock>,
    events: EventSink,
    fanout: FanOut,
    running: Arc<AtomicBool>,
    state: Arc<watch::Sender<SourceState>>,
    acquired: Arc<AtomicU64>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CameraSource {
    /// Wrap a device. Nothing is started.
    pub fn new(device: DeviceHandle, clock: Arc<dyn HardwareClock>, events: EventSink) -> Self {
        let (state, _) = watch::channel(SourceState::Idle);
        Self {
            device,
            clock,
            events,
            fanout: FanOut::new(),
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
            acquired: Arc::new(AtomicU64::new(0)),
            worker: Mutex::new(None),
        }
    }

    /// Apply exposure, ROI, and startup properties.
    ///
    /// Individual failures are published as warnings; returns how many
    /// settings were rejected.
    pub async fn configure(&self, settings: &CameraSettings) -> DaqResult<usize> {
        let device = self.device.clone();
        let events = self.events.clone();
        let settings = settings.clone();
        let rejected = tokio::task::spawn_blocking(move || {
            device.with(|cam| {
                let mut rejected = 0;
                if let Err(e) = cam.set_exposure(settings.exposure_ms) {
                    events.warn(format!("Exposure {} ms rejected: {:#}", settings.exposure_ms, e));
                    rejected += 1;
                }
                if let Some(roi) = settings.roi {
                    if let Err(e) = cam.set_roi(roi) {
                        events.warn(format!("ROI {}x{} rejected: {:#}", roi.width, roi.height, e));
                        rejected += 1;
                    }
                }
                rejected + set_properties(cam, &settings.properties, &events)
            })
        })
        .await?;
        info!("Camera configured ({} settings rejected)", rejected);
        Ok(rejected)
    }

    /// Apply a set of named properties under one lock.
    pub async fn apply_properties(&self, properties: &BTreeMap<String, String>) -> DaqResult<usize> {
        let device = self.device.clone();
        let events = self.events.clone();
        let properties = properties.clone();
        let rejected = tokio::task::spawn_blocking(move || {
            device.with(|cam| set_properties(cam, &properties, &events))
        })
        .await?;
        Ok(rejected)
    }

    /// Start continuous acquisition and the poll loop.
    pub async fn start(&self) -> DaqResult<()> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = self.device.clone();
        let started =
            tokio::task::spawn_blocking(move || device.with(|cam| cam.start_continuous_acquisition()))
                .await?;
        if let Err(e) = started {
            let err = DaqError::device(format!("Failed to start acquisition: {:#}", e));
            self.events.error(err.to_string());
            self.state.send_replace(SourceState::Failed);
            return Err(err);
        }

        self.running.store(true, Ordering::SeqCst);
        self.state.send_replace(SourceState::Running);

        let ctx = LoopContext {
            device: self.device.clone(),
            clock: self.clock.clone(),
            events: self.events.clone(),
            fanout: self.fanout.clone(),
            running: self.running.clone(),
            state: self.state.clone(),
            acquired: self.acquired.clone(),
        };
        let handle = tokio::task::spawn_blocking(move || ctx.run());
        *self.worker.lock() = Some(handle);

        self.events
            .info(format!("Acquisition started on {}", self.device.label()));
        Ok(())
    }

    /// Stop the poll loop, join it, and halt the device.
    pub async fn stop(&self) -> DaqResult<()> {
        self.running.store(false, Ordering::SeqCst);
        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return Ok(());
        };
        worker.await?;

        let device = self.device.clone();
        let stopped =
            tokio::task::spawn_blocking(move || device.with(|cam| cam.stop_acquisition())).await?;

        if *self.state.borrow() != SourceState::Failed {
            self.state.send_replace(SourceState::Stopped);
        }
        stopped.map_err(|e| DaqError::device(format!("Failed to stop acquisition: {:#}", e)))?;
        self.events.info(format!(
            "Acquisition stopped after {} frames",
            self.frames_acquired()
        ));
        Ok(())
    }

    /// Frames retrieved since construction.
    pub fn frames_acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Current state.
    pub fn current_state(&self) -> SourceState {
        *self.state.borrow()
    }

    /// The shared device handle.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }
}

impl FrameProducer for CameraSource {
    fn subscribe(&self, label: &str, capacity: usize) -> FrameSubscription {
        self.fanout.subscribe(label, capacity)
    }

    fn state(&self) -> watch::Receiver<SourceState> {
        self.state.subscribe()
    }
}

fn set_properties(
    cam: &mut dyn crate::hardware::CameraDevice,
    properties: &BTreeMap<String, String>,
    events: &EventSink,
) -> usize {
    let mut rejected = 0;
    for (name, value) in properties {
        match cam.set_property(name, value) {
            Ok(()) => debug!("{} = {}", name, value),
            Err(e) => {
                events.warn(format!("Property {} = {} rejected: {:#}", name, value, e));
                rejected += 1;
            }
        }
    }
    rejected
}

struct LoopContext {
    device: DeviceHandle,
    clock: Arc<dyn HardwareClock>,
    events: EventSink,
    fanout: FanOut,
    running: Arc<AtomicBool>,
    state: Arc<watch::Sender<SourceState>>,
    acquired: Arc<AtomicU64>,
}

impl LoopContext {
    fn run(self) {
        let mut failures = 0u32;
        while self.running.load(Ordering::SeqCst) {
            // Lock held for exactly one count-and-pop.
            let polled = self.device.with(|cam| -> anyhow::Result<Option<RawImage>> {
                if cam.remaining_buffered_count()? > 0 {
                    cam.poll_one_frame()
                } else {
                    Ok(None)
                }
            });

            match polled {
                Ok(Some(raw)) => {
                    failures = 0;
                    let sequence = self.acquired.fetch_add(1, Ordering::SeqCst);
                    let frame = Frame::from_raw(raw, sequence, self.clock.elapsed());
                    self.fanout.publish(Arc::new(frame));
                }
                Ok(None) => {
                    failures = 0;
                    std::thread::sleep(IDLE_POLL);
                }
                Err(e) => {
                    failures += 1;
                    warn!("Frame retrieval failed ({}/{}): {:#}", failures, MAX_CONSECUTIVE_FAILURES, e);
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        let err = DaqError::device(format!(
                            "{} consecutive frame retrievals failed: {:#}",
                            failures, e
                        ));
                        self.events.error(err.to_string());
                        self.state.send_replace(SourceState::Failed);
                        self.running.store(false, Ordering::SeqCst);
                        break;
                    }
                    std::thread::sleep(IDLE_POLL);
                }
            }
        }
        debug!("Acquire loop exited");
    }
}
