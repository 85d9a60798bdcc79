//! Burst/trigger scheduler.
//!
//! Drives one experiment run as a single async task:
//!
//! ```text
//! for each window 1..=window_count:
//!     subscribe to the frame source, open the window, schedule the pulse
//!     collect frames until the window elapses
//!     seal the window, hand it to the frame sink
//!     rest
//! ```
//!
//! Every wait goes through the [`HardwareClock`] and races the stop signal and
//! the camera's health, so a stop or a camera failure is observed within one
//! scheduling step. Sealing consumes the window, which makes a double submit
//! impossible even if a stop arrives while a window is closing.
//!
//! Fixed-interval plans run one continuous capture instead, keep the newest
//! frame, snap it every interval, write snaps in batches, and merge the
//! batches when the run ends.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::acquisition::camera_source::{FrameProducer, FrameSubscription, SourceState};
use crate::clock::HardwareClock;
use crate::data::Frame;
use crate::error::{DaqError, DaqResult};
use crate::events::EventSink;
use crate::experiment::plan::{AcquisitionMode, ExperimentPlan};
use crate::experiment::state::SchedulerState;
use crate::experiment::window::{CaptureWindow, SealedWindow};
use crate::stimulus::{PulseController, PulseOutcome, PulseSpec};
use crate::storage::{merge_batches, BatchStamper, FrameSink, MergeReport, OutputLayout, WriteJob};

/// Default queue capacity for the capture subscription.
pub const DEFAULT_CAPTURE_CAPACITY: usize = 2000;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    /// Every planned window ran
    Completed,
    /// Stopped on request
    Stopped,
    /// Stopped because the camera failed
    Failed,
}

/// Totals for one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Unique run identifier
    pub run_id: Uuid,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Windows (burst) or snaps (fixed interval) in the plan
    pub planned_windows: u64,
    /// Burst windows sealed, including empty ones
    pub windows_completed: u64,
    /// Burst windows that captured nothing
    pub empty_windows: u64,
    /// Fixed-interval snaps taken
    pub snaps_taken: u64,
    /// Fixed-interval snaps with no new frame available
    pub missed_snaps: u64,
    /// Frames handed to storage
    pub frames_captured: u64,
    /// Frames lost because the capture queue was full
    pub frames_dropped: u64,
    /// Write jobs submitted
    pub jobs_submitted: u64,
    /// Stimuli fully sent
    pub pulses_sent: u64,
    /// Stimuli skipped or failed on the link
    pub pulses_missed: u64,
    /// Stimuli cancelled before their delay elapsed
    pub pulses_cancelled: u64,
    /// Merged output of a fixed-interval run
    pub merged: Option<MergeReport>,
    /// Wall-clock start
    pub started_at: DateTime<Local>,
    /// Wall-clock end
    pub finished_at: DateTime<Local>,
}

impl RunSummary {
    fn new(planned_windows: u64) -> Self {
        let now = Local::now();
        Self {
            run_id: Uuid::new_v4(),
            outcome: RunOutcome::Completed,
            planned_windows,
            windows_completed: 0,
            empty_windows: 0,
            snaps_taken: 0,
            missed_snaps: 0,
            frames_captured: 0,
            frames_dropped: 0,
            jobs_submitted: 0,
            pulses_sent: 0,
            pulses_missed: 0,
            pulses_cancelled: 0,
            merged: None,
            started_at: now,
            finished_at: now,
        }
    }
}

/// Builds and starts experiment runs.
pub struct BurstScheduler {
    source: Arc<dyn FrameProducer>,
    sink: FrameSink,
    layout: OutputLayout,
    clock: Arc<dyn HardwareClock>,
    events: EventSink,
    pulses: Option<PulseController>,
    capture_capacity: usize,
}

impl BurstScheduler {
    /// Scheduler without stimulation.
    pub fn new(
        source: Arc<dyn FrameProducer>,
        sink: FrameSink,
        layout: OutputLayout,
        clock: Arc<dyn HardwareClock>,
        events: EventSink,
    ) -> Self {
        Self {
            source,
            sink,
            layout,
            clock,
            events,
            pulses: None,
            capture_capacity: DEFAULT_CAPTURE_CAPACITY,
        }
    }

    /// Fire the plan's pulses on `pulses`.
    pub fn with_pulses(mut self, pulses: PulseController) -> Self {
        self.pulses = Some(pulses);
        self
    }

    /// Override the capture subscription capacity.
    pub fn with_capture_capacity(mut self, capacity: usize) -> Self {
        self.capture_capacity = capacity.max(1);
        self
    }

    /// Start `plan` on a background task.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(self, plan: ExperimentPlan) -> RunHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        let run = Run {
            source_state: self.source.state(),
            source: self.source,
            sink: self.sink,
            layout: self.layout,
            clock: self.clock,
            events: self.events,
            pulses: self.pulses,
            capture_capacity: self.capture_capacity,
            stop_rx,
            state: state_tx,
            pulse_tasks: Vec::new(),
            summary: RunSummary::new(plan.window_count()),
        };
        let task = tokio::spawn(run.execute(plan));

        RunHandle {
            stop_tx,
            state_rx,
            task,
        }
    }
}

/// Control handle for a running experiment.
pub struct RunHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<SchedulerState>,
    task: JoinHandle<DaqResult<RunSummary>>,
}

impl RunHandle {
    /// Request a stop. Idempotent; safe from any state.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        *self.state_rx.borrow()
    }

    /// Receiver for state changes.
    pub fn watch_state(&self) -> watch::Receiver<SchedulerState> {
        self.state_rx.clone()
    }

    /// Whether the run task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to end.
    pub async fn join(self) -> DaqResult<RunSummary> {
        self.task.await?
    }
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Why a capture wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Elapsed,
    StopRequested,
    SourceFailed,
}

impl WaitEnd {
    fn outcome(self) -> Option<RunOutcome> {
        match self {
            WaitEnd::Elapsed => None,
            WaitEnd::StopRequested => Some(RunOutcome::Stopped),
            WaitEnd::SourceFailed => Some(RunOutcome::Failed),
        }
    }
}

struct PendingPulse {
    fired: Arc<AtomicBool>,
    handle: JoinHandle<Option<PulseOutcome>>,
}

// A dropped sender never resolves: the run simply cannot be stopped that way.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|&stop| stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

async fn source_failed(rx: &mut watch::Receiver<SourceState>) {
    let closed = rx
        .wait_for(|state| *state == SourceState::Failed)
        .await
        .is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

struct Run {
    source: Arc<dyn FrameProducer>,
    sink: FrameSink,
    layout: OutputLayout,
    clock: Arc<dyn HardwareClock>,
    events: EventSink,
    pulses: Option<PulseController>,
    capture_capacity: usize,
    stop_rx: watch::Receiver<bool>,
    source_state: watch::Receiver<SourceState>,
    state: watch::Sender<SchedulerState>,
    pulse_tasks: Vec<PendingPulse>,
    summary: RunSummary,
}

impl Run {
    async fn execute(mut self, plan: ExperimentPlan) -> DaqResult<RunSummary> {
        info!(
            run_id = %self.summary.run_id,
            windows = plan.window_count(),
            expected_frames = plan.expected_frames_per_window(),
            dir = ?self.layout.dir(),
            "Experiment run starting"
        );

        let result = match *plan.mode() {
            AcquisitionMode::Burst { window, rest, .. } => {
                self.run_burst(&plan, window, rest).await
            }
            AcquisitionMode::FixedInterval {
                interval,
                batch_size,
                ..
            } => self.run_fixed_interval(&plan, interval, batch_size).await,
        };

        self.settle_pulses().await;
        self.summary.finished_at = Local::now();

        match result {
            Ok(outcome) => {
                self.summary.outcome = outcome;
                let final_state = match outcome {
                    RunOutcome::Completed => SchedulerState::Done,
                    RunOutcome::Stopped | RunOutcome::Failed => SchedulerState::Stopped,
                };
                self.set_state(final_state);
                match outcome {
                    RunOutcome::Completed => self.events.info(format!(
                        "Experiment complete: {} frames in {} jobs",
                        self.summary.frames_captured, self.summary.jobs_submitted
                    )),
                    RunOutcome::Stopped => self.events.warn(format!(
                        "Experiment stopped: {} frames in {} jobs",
                        self.summary.frames_captured, self.summary.jobs_submitted
                    )),
                    RunOutcome::Failed => self
                        .events
                        .error("Experiment stopped: camera acquisition failed"),
                }
                Ok(self.summary)
            }
            Err(e) => {
                self.set_state(SchedulerState::Stopped);
                self.events
                    .emit(e.severity(), format!("Experiment aborted: {}", e));
                Err(e)
            }
        }
    }

    fn set_state(&self, state: SchedulerState) {
        debug!("Scheduler state: {}", state);
        self.state.send_replace(state);
    }

    fn source_has_failed(&self) -> bool {
        *self.source_state.borrow() == SourceState::Failed
    }

    // -------------------------------------------------------------------------
    // Burst mode
    // -------------------------------------------------------------------------

    async fn run_burst(
        &mut self,
        plan: &ExperimentPlan,
        window: Duration,
        rest: Duration,
    ) -> DaqResult<RunOutcome> {
        let count = plan.window_count();
        if count == 0 {
            self.events
                .warn("Plan fits zero capture windows; nothing to acquire");
            return Ok(RunOutcome::Completed);
        }

        for index in 1..=count {
            if *self.stop_rx.borrow() {
                return Ok(RunOutcome::Stopped);
            }
            if self.source_has_failed() {
                return Ok(RunOutcome::Failed);
            }

            let mut subscription = self
                .source
                .subscribe(&format!("window {}", index), self.capture_capacity);
            let mut open = CaptureWindow::open(index, self.clock.elapsed(), window);
            self.set_state(SchedulerState::WindowOpen { index });
            self.events
                .info(format!("Window {}/{} opened", index, count));
            if let Some(spec) = plan.pulse() {
                self.schedule_pulse(*spec);
            }

            let end = self.collect_window(&mut open, &mut subscription).await;

            self.set_state(SchedulerState::WindowClosing { index });
            while let Some(frame) = subscription.try_recv() {
                open.push(frame);
            }
            self.summary.frames_dropped += subscription.dropped();
            drop(subscription);
            let sealed = open.seal(self.clock.elapsed());
            self.submit_window(sealed).await?;

            if let Some(outcome) = end.outcome() {
                return Ok(outcome);
            }

            self.set_state(SchedulerState::Resting { after: index });
            let rested = self.wait(rest).await;
            if let Some(outcome) = rested.outcome() {
                return Ok(outcome);
            }
        }
        Ok(RunOutcome::Completed)
    }

    async fn collect_window(
        &mut self,
        window: &mut CaptureWindow,
        subscription: &mut FrameSubscription,
    ) -> WaitEnd {
        let remaining = window.deadline().saturating_sub(self.clock.elapsed());
        let mut sleep = self.clock.sleep(remaining);
        let mut producer_gone = false;
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return WaitEnd::StopRequested,
                _ = source_failed(&mut self.source_state) => return WaitEnd::SourceFailed,
                _ = &mut sleep => return WaitEnd::Elapsed,
                frame = subscription.recv(), if !producer_gone => match frame {
                    Some(frame) => window.push(frame),
                    None => producer_gone = true,
                },
            }
        }
    }

    async fn wait(&mut self, duration: Duration) -> WaitEnd {
        tokio::select! {
            biased;
            _ = stop_requested(&mut self.stop_rx) => WaitEnd::StopRequested,
            _ = source_failed(&mut self.source_state) => WaitEnd::SourceFailed,
            _ = self.clock.sleep(duration) => WaitEnd::Elapsed,
        }
    }

    async fn submit_window(&mut self, sealed: SealedWindow) -> DaqResult<()> {
        self.summary.windows_completed += 1;
        let index = sealed.index();
        if sealed.is_empty() {
            self.summary.empty_windows += 1;
            self.events.warn(format!(
                "Window {} captured no frames; no file written",
                index
            ));
            return Ok(());
        }

        debug!(
            "Window {} sealed with {} frames after {:?}",
            index,
            sealed.len(),
            sealed.open_for()
        );
        self.summary.frames_captured += sealed.len() as u64;
        let job = sealed.into_write_job(self.layout.burst_path(index));
        self.sink.enqueue(job).await?;
        self.summary.jobs_submitted += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Fixed-interval mode
    // -------------------------------------------------------------------------

    async fn run_fixed_interval(
        &mut self,
        plan: &ExperimentPlan,
        interval: Duration,
        batch_size: usize,
    ) -> DaqResult<RunOutcome> {
        let count = plan.window_count();
        if count == 0 {
            self.events.warn("Plan fits zero snaps; nothing to acquire");
            return Ok(RunOutcome::Completed);
        }
        if self.source_has_failed() {
            return Ok(RunOutcome::Failed);
        }

        let mut subscription = self
            .source
            .subscribe("fixed interval", self.capture_capacity);
        self.set_state(SchedulerState::WindowOpen { index: 1 });
        self.events.info(format!(
            "Fixed-interval capture started: {} snaps every {:?}",
            count, interval
        ));
        if let Some(spec) = plan.pulse() {
            self.schedule_pulse(*spec);
        }

        let start = self.clock.elapsed();
        let mut latest: Option<Arc<Frame>> = None;
        let mut last_snapped: Option<u64> = None;
        let mut batch: Vec<Arc<Frame>> = Vec::with_capacity(batch_size);
        let mut stamper = BatchStamper::default();
        let mut outcome = RunOutcome::Completed;

        for snap in 1..=count {
            let deadline = start + interval * snap as u32;
            let end = self
                .track_latest(deadline, &mut subscription, &mut latest)
                .await;
            if let Some(early) = end.outcome() {
                outcome = early;
                break;
            }

            while let Some(frame) = subscription.try_recv() {
                latest = Some(frame);
            }
            match &latest {
                Some(frame) if last_snapped != Some(frame.sequence()) => {
                    last_snapped = Some(frame.sequence());
                    batch.push(frame.clone());
                    self.summary.snaps_taken += 1;
                }
                _ => {
                    self.summary.missed_snaps += 1;
                    self.events
                        .warn(format!("Snap {} missed: no new frame since the last snap", snap));
                }
            }

            if batch.len() >= batch_size {
                self.submit_batch(std::mem::take(&mut batch), &mut stamper)
                    .await?;
            }
        }

        self.set_state(SchedulerState::WindowClosing { index: 1 });
        self.summary.frames_dropped += subscription.dropped();
        drop(subscription);
        if !batch.is_empty() {
            self.submit_batch(batch, &mut stamper).await?;
        }

        self.sink.flush().await?;
        let layout = self.layout.clone();
        match tokio::task::spawn_blocking(move || merge_batches(&layout)).await? {
            Ok(Some(report)) => {
                self.events.info(format!(
                    "Merged {} batches ({} frames) into {}",
                    report.inputs.len(),
                    report.frames,
                    report.output.display()
                ));
                self.summary.merged = Some(report);
            }
            Ok(None) => debug!("No batches to merge"),
            Err(e) => self
                .events
                .error(format!("Batch merge failed, batches kept: {}", e)),
        }
        Ok(outcome)
    }

    async fn track_latest(
        &mut self,
        deadline: Duration,
        subscription: &mut FrameSubscription,
        latest: &mut Option<Arc<Frame>>,
    ) -> WaitEnd {
        let remaining = deadline.saturating_sub(self.clock.elapsed());
        let mut sleep = self.clock.sleep(remaining);
        let mut producer_gone = false;
        loop {
            tokio::select! {
                biased;
                _ = stop_requested(&mut self.stop_rx) => return WaitEnd::StopRequested,
                _ = source_failed(&mut self.source_state) => return WaitEnd::SourceFailed,
                _ = &mut sleep => return WaitEnd::Elapsed,
                frame = subscription.recv(), if !producer_gone => match frame {
                    Some(frame) => *latest = Some(frame),
                    None => producer_gone = true,
                },
            }
        }
    }

    async fn submit_batch(
        &mut self,
        frames: Vec<Arc<Frame>>,
        stamper: &mut BatchStamper,
    ) -> DaqResult<()> {
        let path = self.layout.batch_path(stamper.next(Local::now()));
        self.summary.frames_captured += frames.len() as u64;
        self.sink.enqueue(WriteJob::new(path, frames)).await?;
        self.summary.jobs_submitted += 1;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pulses
    // -------------------------------------------------------------------------

    fn schedule_pulse(&mut self, spec: PulseSpec) {
        let Some(pulses) = self.pulses.clone() else {
            return;
        };
        let clock = self.clock.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let handle = tokio::spawn(async move {
            clock.sleep(spec.delay).await;
            flag.store(true, Ordering::SeqCst);
            pulses.fire(spec).await.ok()
        });
        self.pulse_tasks.push(PendingPulse { fired, handle });
    }

    /// Wait for pulses already on the wire; cancel those still waiting out
    /// their delay, whatever the outcome.
    async fn settle_pulses(&mut self) {
        for pending in std::mem::take(&mut self.pulse_tasks) {
            if !pending.fired.load(Ordering::SeqCst) {
                pending.handle.abort();
            }
            match pending.handle.await {
                Ok(Some(PulseOutcome::Sent { .. })) => self.summary.pulses_sent += 1,
                Ok(Some(_)) => self.summary.pulses_missed += 1,
                Ok(None) => {
                    self.summary.pulses_missed += 1;
                    self.events.error("Pulse task failed");
                }
                Err(e) if e.is_cancelled() => self.summary.pulses_cancelled += 1,
                Err(e) => {
                    self.summary.pulses_missed += 1;
                    self.events
                        .error(DaqError::from(e).to_string());
                }
            }
        }
    }
}
