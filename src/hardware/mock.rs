//! Mock Hardware Implementations
//!
//! Provides simulated hardware devices for running the pipeline without a rig.
//!
//! # Available Mocks
//!
//! - `MockCamera` - Free-running camera with a bounded circular buffer,
//!   gradient test pattern, and failure injection through `MockCameraControl`
//! - `MockStimulatorOpener` - TTL box that records every command byte and can
//!   refuse to open, observed through `StimulatorRecorder`
//!
//! # Performance Characteristics
//!
//! - MockCamera: frames become available at the configured frame rate
//!   (default 100 fps) measured on the wall clock, like real hardware
//! - Buffer overflow drops the oldest frames, as a circular buffer would

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data::RawImage;
use crate::hardware::capabilities::{
    CameraDevice, LinkOpener, Roi, StimulatorLink, TTL_HIGH, TTL_LOW,
};

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

#[derive(Default)]
struct ControlState {
    fail_polls: AtomicU32,
    fail_start: AtomicBool,
    fail_properties: AtomicBool,
    stalled: AtomicBool,
    polls: AtomicU64,
    overflowed: AtomicU64,
}

/// Remote control for a `MockCamera` after it has been moved into a handle.
#[derive(Clone, Default)]
pub struct MockCameraControl {
    state: Arc<ControlState>,
}

impl MockCameraControl {
    /// Make the next `count` buffer polls fail.
    pub fn fail_next_polls(&self, count: u32) {
        self.state.fail_polls.store(count, Ordering::SeqCst);
    }

    /// Make every buffer poll fail from now on.
    pub fn fail_all_polls(&self) {
        self.state.fail_polls.store(u32::MAX, Ordering::SeqCst);
    }

    /// Make `start_continuous_acquisition` fail.
    pub fn fail_start(&self, fail: bool) {
        self.state.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make every `set_property` call fail.
    pub fn fail_properties(&self, fail: bool) {
        self.state.fail_properties.store(fail, Ordering::SeqCst);
    }

    /// Stop delivering frames without reporting an error.
    pub fn stall(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of buffer polls the camera has served (including failures).
    pub fn polls(&self) -> u64 {
        self.state.polls.load(Ordering::SeqCst)
    }

    /// Frames lost to circular-buffer overflow.
    pub fn overflowed(&self) -> u64 {
        self.state.overflowed.load(Ordering::SeqCst)
    }
}

/// Mock free-running camera
///
/// Simulates a camera with:
/// - Configurable sensor size and frame rate
/// - A circular buffer of `buffer_capacity` frames (2000 by default)
/// - ROI and property bookkeeping
/// - A drifting gradient pattern with a little noise
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(600, 600).with_frame_rate(50.0);
/// let control = camera.control();
/// let handle = DeviceHandle::new(camera);
/// control.fail_next_polls(3);
/// ```
pub struct MockCamera {
    sensor: (u32, u32),
    roi: Roi,
    frame_interval: Duration,
    buffer_capacity: u64,
    exposure_ms: f64,
    properties: BTreeMap<String, String>,
    started: Option<Instant>,
    consumed: u64,
    rng: StdRng,
    control: MockCameraControl,
}

impl MockCamera {
    /// Create a mock camera with the given sensor size, running at 100 fps.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor: (width, height),
            roi: Roi::new(width, height),
            frame_interval: Duration::from_millis(10),
            buffer_capacity: 2000,
            exposure_ms: 10.0,
            properties: BTreeMap::new(),
            started: None,
            consumed: 0,
            rng: StdRng::seed_from_u64(0x5eed),
            control: MockCameraControl::default(),
        }
    }

    /// Set the simulated frame rate.
    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps > 0.0 {
            self.frame_interval = Duration::from_secs_f64(1.0 / fps);
        }
        self
    }

    /// Set the circular buffer capacity in frames.
    pub fn with_buffer_capacity(mut self, frames: u64) -> Self {
        self.buffer_capacity = frames.max(1);
        self
    }

    /// Handle for injecting failures once the camera is owned elsewhere.
    pub fn control(&self) -> MockCameraControl {
        self.control.clone()
    }

    /// Current exposure in milliseconds.
    pub fn exposure_ms(&self) -> f64 {
        self.exposure_ms
    }

    /// Last value written to a property.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    fn frames_available(&mut self) -> u64 {
        let Some(started) = self.started else {
            return 0;
        };
        if self.control.state.stalled.load(Ordering::SeqCst) {
            // A stalled camera produces nothing; pretend everything so far was read.
            let produced = (started.elapsed().as_nanos() / self.frame_interval.as_nanos()) as u64;
            self.consumed = self.consumed.max(produced);
            return 0;
        }
        let produced = (started.elapsed().as_nanos() / self.frame_interval.as_nanos()) as u64;
        let mut waiting = produced.saturating_sub(self.consumed);
        if waiting > self.buffer_capacity {
            let lost = waiting - self.buffer_capacity;
            self.control
                .state
                .overflowed
                .fetch_add(lost, Ordering::SeqCst);
            self.consumed += lost;
            waiting = self.buffer_capacity;
        }
        waiting
    }

    fn render_pattern(&mut self, frame_number: u64) -> Vec<u16> {
        let (w, h) = (self.roi.width, self.roi.height);
        let mut pixels = Vec::with_capacity((w as usize) * (h as usize));
        for y in 0..h {
            for x in 0..w {
                let base = ((x as u64 + y as u64 + frame_number) % 4096) as u16;
                let noise: u16 = self.rng.gen_range(0..16);
                pixels.push(base.saturating_add(100).saturating_add(noise));
            }
        }
        pixels
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(600, 600)
    }
}

impl CameraDevice for MockCamera {
    fn label(&self) -> String {
        format!("MockCamera {}x{}", self.sensor.0, self.sensor.1)
    }

    fn set_exposure(&mut self, exposure_ms: f64) -> Result<()> {
        if !(exposure_ms.is_finite() && exposure_ms > 0.0) {
            bail!("MockCamera: Exposure must be positive");
        }
        self.exposure_ms = exposure_ms;
        Ok(())
    }

    fn set_roi(&mut self, roi: Roi) -> Result<()> {
        if roi.width == 0
            || roi.height == 0
            || roi.x + roi.width > self.sensor.0
            || roi.y + roi.height > self.sensor.1
        {
            bail!(
                "MockCamera: ROI {:?} outside {}x{} sensor",
                roi,
                self.sensor.0,
                self.sensor.1
            );
        }
        self.roi = roi;
        Ok(())
    }

    fn set_property(&mut self, name: &str, value: &str) -> Result<()> {
        if self.control.state.fail_properties.load(Ordering::SeqCst) {
            bail!("MockCamera: property '{}' rejected", name);
        }
        self.properties.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn start_continuous_acquisition(&mut self) -> Result<()> {
        if self.control.state.fail_start.load(Ordering::SeqCst) {
            bail!("MockCamera: sequence acquisition failed to start");
        }
        if self.started.is_none() {
            self.started = Some(Instant::now());
            self.consumed = 0;
        }
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.started = None;
        Ok(())
    }

    fn is_acquiring(&self) -> bool {
        self.started.is_some()
    }

    fn remaining_buffered_count(&mut self) -> Result<usize> {
        self.control.state.polls.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .control
            .state
            .fail_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if fail {
            return Err(anyhow!("MockCamera: buffer query failed"));
        }
        Ok(self.frames_available() as usize)
    }

    fn poll_one_frame(&mut self) -> Result<Option<RawImage>> {
        if self.frames_available() == 0 {
            return Ok(None);
        }
        let frame_number = self.consumed;
        self.consumed += 1;
        let pixels = self.render_pattern(frame_number);
        RawImage::new(self.roi.width, self.roi.height, pixels).map(Some)
    }
}

// =============================================================================
// MockStimulator - Simulated TTL box
// =============================================================================

#[derive(Default)]
struct RecorderState {
    commands: Mutex<Vec<u8>>,
    echo: Mutex<Vec<String>>,
    opens: AtomicUsize,
    refuse_open: AtomicBool,
    fail_writes: AtomicBool,
}

/// Shared view of everything a mock stimulator was asked to do.
#[derive(Clone, Default)]
pub struct StimulatorRecorder {
    state: Arc<RecorderState>,
}

impl StimulatorRecorder {
    /// All command bytes written so far, in order.
    pub fn commands(&self) -> Vec<u8> {
        self.state.commands.lock().clone()
    }

    /// Number of rising edges (`H` commands) seen.
    pub fn high_count(&self) -> usize {
        self.state
            .commands
            .lock()
            .iter()
            .filter(|&&c| c == TTL_HIGH)
            .count()
    }

    /// Number of times a link was opened.
    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Make future `open` calls fail, as if the port were missing.
    pub fn refuse_open(&self, refuse: bool) {
        self.state.refuse_open.store(refuse, Ordering::SeqCst);
    }

    /// Make future writes fail, as if the cable were pulled.
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Forget recorded commands.
    pub fn clear(&self) {
        self.state.commands.lock().clear();
    }
}

/// Opener for mock stimulator links.
#[derive(Clone, Default)]
pub struct MockStimulatorOpener {
    recorder: StimulatorRecorder,
}

impl MockStimulatorOpener {
    /// Create an opener and the recorder observing it.
    pub fn new() -> (Self, StimulatorRecorder) {
        let recorder = StimulatorRecorder::default();
        (
            Self {
                recorder: recorder.clone(),
            },
            recorder,
        )
    }
}

impl LinkOpener for MockStimulatorOpener {
    fn open(&self) -> Result<Box<dyn StimulatorLink>> {
        if self.recorder.state.refuse_open.load(Ordering::SeqCst) {
            bail!("MockStimulator: port unavailable");
        }
        self.recorder.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStimulatorLink {
            recorder: self.recorder.clone(),
        }))
    }

    fn describe(&self) -> String {
        "mock stimulator".to_string()
    }
}

struct MockStimulatorLink {
    recorder: StimulatorRecorder,
}

impl StimulatorLink for MockStimulatorLink {
    fn write_command(&mut self, command: u8) -> Result<()> {
        if self.recorder.state.fail_writes.load(Ordering::SeqCst) {
            bail!("MockStimulator: write failed");
        }
        self.recorder.state.commands.lock().push(command);
        if command == TTL_LOW {
            self.recorder
                .state
                .echo
                .lock()
                .push("Pulse ended".to_string());
        }
        Ok(())
    }

    fn drain_echo(&mut self) -> Result<Vec<String>> {
        Ok(std::mem::take(&mut *self.recorder.state.echo.lock()))
    }
}
