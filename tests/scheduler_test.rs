//! Integration tests for the burst/trigger scheduler.
//!
//! Time is driven by a `ManualClock` and frames by a `ManualSource`, so each
//! test steps the state machine explicitly: open a window, push frames,
//! advance past the window, advance past the rest.

use calcium_daq::acquisition::{ManualSource, SourceState};
use calcium_daq::clock::{HardwareClock, ManualClock};
use calcium_daq::events::{drain, EventSink, Severity};
use calcium_daq::experiment::{
    AcquisitionMode, BurstScheduler, ExperimentPlan, RunHandle, RunOutcome, SchedulerState,
};
use calcium_daq::hardware::MockStimulatorOpener;
use calcium_daq::stimulus::{PulseController, PulseSpec};
use calcium_daq::storage::{list_batches, read_stack, FrameSink, OutputLayout, TiffStackWriter};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

const WINDOW: Duration = Duration::from_secs(2);
const REST: Duration = Duration::from_secs(8);

struct Rig {
    _dir: TempDir,
    layout: OutputLayout,
    clock: Arc<ManualClock>,
    source: Arc<ManualSource>,
    sink: FrameSink,
    events: EventSink,
}

impl Rig {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = OutputLayout::new(dir.path(), "mouse");
        let events = EventSink::new();
        let sink = FrameSink::spawn(Arc::new(TiffStackWriter), 16, events.clone());
        Self {
            _dir: dir,
            layout,
            clock: Arc::new(ManualClock::new()),
            source: Arc::new(ManualSource::new()),
            sink,
            events,
        }
    }

    fn scheduler(&self) -> BurstScheduler {
        BurstScheduler::new(
            self.source.clone(),
            self.sink.clone(),
            self.layout.clone(),
            self.clock.clone(),
            self.events.clone(),
        )
    }

    fn push(&self, count: usize, value: u16) {
        for _ in 0..count {
            self.source.push(4, 4, value, self.clock.elapsed());
        }
    }

    async fn wait_for_sleepers(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.clock.pending_sleepers() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("scheduler never started waiting");
    }

    /// Advance through one window (with `frames` pushed) and its rest.
    async fn run_window(
        &self,
        state: &mut watch::Receiver<SchedulerState>,
        index: u64,
        frames: usize,
    ) {
        wait_for(state, SchedulerState::WindowOpen { index }).await;
        self.push(frames, (index * 100) as u16);
        self.wait_for_sleepers(1).await;
        self.clock.advance(WINDOW);

        wait_for(state, SchedulerState::Resting { after: index }).await;
        self.wait_for_sleepers(1).await;
        self.clock.advance(REST);
    }
}

async fn wait_for(state: &mut watch::Receiver<SchedulerState>, want: SchedulerState) {
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
        .unwrap();
}

fn burst(total_secs: u64) -> ExperimentPlan {
    ExperimentPlan::burst(Duration::from_secs(total_secs), WINDOW, REST, 30.0).unwrap()
}

fn start(rig: &Rig, plan: ExperimentPlan) -> (RunHandle, watch::Receiver<SchedulerState>) {
    let handle = rig.scheduler().start(plan);
    let state = handle.watch_state();
    (handle, state)
}

#[tokio::test]
async fn test_burst_plan_writes_one_stack_per_window() {
    let rig = Rig::new();
    let (handle, mut state) = start(&rig, burst(30));

    for index in 1..=3 {
        rig.run_window(&mut state, index, index as usize + 1).await;
    }
    wait_for(&mut state, SchedulerState::Done).await;

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.planned_windows, 3);
    assert_eq!(summary.windows_completed, 3);
    assert_eq!(summary.jobs_submitted, 3);
    assert_eq!(summary.frames_captured, 2 + 3 + 4);

    let written = rig.sink.shutdown().await.unwrap();
    assert_eq!(written.written, 3);

    let stack = read_stack(&rig.layout.burst_path(2)).unwrap();
    assert_eq!(stack.len(), 3);
    assert!(stack.iter().all(|f| f.pixels().iter().all(|&v| v == 200)));
    assert_eq!(read_stack(&rig.layout.burst_path(3)).unwrap().len(), 4);
}

#[tokio::test]
async fn test_frames_between_windows_are_not_captured() {
    let rig = Rig::new();
    let (handle, mut state) = start(&rig, burst(20));

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.push(2, 1);
    rig.wait_for_sleepers(1).await;
    rig.clock.advance(WINDOW);
    wait_for(&mut state, SchedulerState::Resting { after: 1 }).await;

    // Nobody is subscribed while resting.
    rig.push(50, 9);
    assert_eq!(rig.source.subscriber_count(), 0);
    rig.wait_for_sleepers(1).await;
    rig.clock.advance(REST);

    rig.run_window(&mut state, 2, 1).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.frames_captured, 3);

    rig.sink.shutdown().await.unwrap();
    let second = read_stack(&rig.layout.burst_path(2)).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].get(0, 0), Some(200));
}

#[tokio::test]
async fn test_stop_mid_window_flushes_open_window_once() {
    let rig = Rig::new();
    let (handle, mut state) = start(&rig, burst(300));

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.push(2, 7);
    rig.wait_for_sleepers(1).await;
    handle.stop();
    handle.stop();

    wait_for(&mut state, SchedulerState::Stopped).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.windows_completed, 1);
    assert_eq!(summary.jobs_submitted, 1);
    assert_eq!(summary.frames_captured, 2);

    rig.sink.shutdown().await.unwrap();
    assert_eq!(read_stack(&rig.layout.burst_path(1)).unwrap().len(), 2);
    assert!(!rig.layout.burst_path(2).exists());
}

#[tokio::test]
async fn test_stop_while_resting_writes_nothing_more() {
    let rig = Rig::new();
    let (handle, mut state) = start(&rig, burst(300));

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.push(3, 1);
    rig.wait_for_sleepers(1).await;
    rig.clock.advance(WINDOW);
    wait_for(&mut state, SchedulerState::Resting { after: 1 }).await;

    handle.stop();
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.jobs_submitted, 1);

    let written = rig.sink.shutdown().await.unwrap();
    assert_eq!(written.written, 1);
    assert!(!rig.layout.burst_path(2).exists());
}

#[tokio::test]
async fn test_plan_with_zero_windows_finishes_immediately() {
    let rig = Rig::new();
    let mut events = rig.events.subscribe();
    let (handle, mut state) = start(&rig, burst(5));

    wait_for(&mut state, SchedulerState::Done).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.planned_windows, 0);
    assert_eq!(summary.jobs_submitted, 0);
    assert!(drain(&mut events)
        .iter()
        .any(|e| e.severity == Severity::Warning && e.message.contains("zero capture windows")));
}

#[tokio::test]
async fn test_empty_window_warns_and_writes_no_file() {
    let rig = Rig::new();
    let mut events = rig.events.subscribe();
    let (handle, mut state) = start(&rig, burst(20));

    rig.run_window(&mut state, 1, 0).await;
    rig.run_window(&mut state, 2, 4).await;

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.windows_completed, 2);
    assert_eq!(summary.empty_windows, 1);
    assert_eq!(summary.jobs_submitted, 1);

    rig.sink.shutdown().await.unwrap();
    assert!(!rig.layout.burst_path(1).exists());
    assert_eq!(read_stack(&rig.layout.burst_path(2)).unwrap().len(), 4);
    assert!(drain(&mut events).iter().any(|e| {
        e.severity == Severity::Warning && e.message.contains("Window 1 captured no frames")
    }));
}

#[tokio::test]
async fn test_camera_failure_ends_run_and_keeps_open_window() {
    let rig = Rig::new();
    let (handle, mut state) = start(&rig, burst(300));

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.push(2, 5);
    rig.wait_for_sleepers(1).await;
    rig.source.set_state(SourceState::Failed);

    wait_for(&mut state, SchedulerState::Stopped).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.jobs_submitted, 1);

    rig.sink.shutdown().await.unwrap();
    assert_eq!(read_stack(&rig.layout.burst_path(1)).unwrap().len(), 2);
}

#[tokio::test]
async fn test_pulse_fires_after_delay_inside_window() {
    let rig = Rig::new();
    let (opener, recorder) = MockStimulatorOpener::new();
    // Pulse widths run on their own clock so they do not move the schedule.
    let pulses = PulseController::new(
        Arc::new(opener),
        Arc::new(ManualClock::new()),
        rig.events.clone(),
    );
    let plan = burst(10)
        .with_pulse(PulseSpec::single(Duration::from_secs(1)))
        .unwrap();
    let handle = rig.scheduler().with_pulses(pulses).start(plan);
    let mut state = handle.watch_state();

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.wait_for_sleepers(2).await;
    assert_eq!(rig.clock.next_deadline(), Some(Duration::from_secs(1)));
    rig.clock.advance(Duration::from_secs(1));

    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.high_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert!(state.borrow().is_capturing());

    rig.push(1, 1);
    rig.clock.advance(Duration::from_secs(1));
    wait_for(&mut state, SchedulerState::Resting { after: 1 }).await;
    rig.wait_for_sleepers(1).await;
    rig.clock.advance(REST);

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.pulses_sent, 1);
    assert_eq!(summary.pulses_cancelled, 0);
    assert_eq!(recorder.commands(), b"HL".to_vec());
}

#[tokio::test]
async fn test_stop_cancels_pending_pulse() {
    let rig = Rig::new();
    let (opener, recorder) = MockStimulatorOpener::new();
    let pulses = PulseController::new(
        Arc::new(opener),
        Arc::new(ManualClock::new()),
        rig.events.clone(),
    );
    let plan = burst(300)
        .with_pulse(PulseSpec::single(Duration::from_secs(1)))
        .unwrap();
    let handle = rig.scheduler().with_pulses(pulses).start(plan);
    let mut state = handle.watch_state();

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.wait_for_sleepers(2).await;
    handle.stop();

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Stopped);
    assert_eq!(summary.pulses_cancelled, 1);
    assert_eq!(summary.pulses_sent, 0);
    assert_eq!(recorder.high_count(), 0);
}

#[tokio::test]
async fn test_completed_run_cancels_pulse_still_waiting() {
    let rig = Rig::new();
    let (opener, recorder) = MockStimulatorOpener::new();
    let pulses = PulseController::new(
        Arc::new(opener),
        Arc::new(ManualClock::new()),
        rig.events.clone(),
    );
    // One 10 s cycle; the pulse would land 5 s after the run ends.
    let plan = burst(10)
        .with_pulse(PulseSpec::single(Duration::from_secs(15)))
        .unwrap();
    let handle = rig.scheduler().with_pulses(pulses).start(plan);
    let mut state = handle.watch_state();

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    rig.push(2, 1);
    rig.wait_for_sleepers(2).await;
    rig.clock.advance(WINDOW);
    wait_for(&mut state, SchedulerState::Resting { after: 1 }).await;
    rig.wait_for_sleepers(2).await;
    rig.clock.advance(REST);

    wait_for(&mut state, SchedulerState::Done).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.pulses_cancelled, 1);
    assert_eq!(summary.pulses_sent, 0);
    assert_eq!(recorder.high_count(), 0);
    assert_eq!(rig.clock.pending_sleepers(), 0);
    rig.sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fixed_interval_snaps_batches_and_merges() {
    let rig = Rig::new();
    let plan = ExperimentPlan::new(
        AcquisitionMode::FixedInterval {
            total: Duration::from_secs(6),
            interval: Duration::from_secs(1),
            batch_size: 4,
        },
        None,
        30.0,
    )
    .unwrap();
    let (handle, mut state) = start(&rig, plan);

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    for snap in 1..=6u16 {
        rig.wait_for_sleepers(1).await;
        // Older frames in the same interval are superseded by the newest.
        rig.push(1, snap * 1000);
        rig.push(1, snap);
        rig.clock.advance(Duration::from_secs(1));
    }

    wait_for(&mut state, SchedulerState::Done).await;
    let summary = handle.join().await.unwrap();
    assert_eq!(summary.snaps_taken, 6);
    assert_eq!(summary.missed_snaps, 0);
    assert_eq!(summary.jobs_submitted, 2);

    let merged = summary.merged.expect("batches merged");
    assert_eq!(merged.inputs.len(), 2);
    assert_eq!(merged.frames, 6);
    assert_eq!(merged.output, rig.layout.dir().join("mouse.tif"));
    assert!(list_batches(&rig.layout).unwrap().is_empty());

    let stack = read_stack(&merged.output).unwrap();
    let values: Vec<u16> = stack.iter().map(|f| f.get(0, 0).unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6]);
    rig.sink.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fixed_interval_counts_missed_snaps() {
    let rig = Rig::new();
    let plan = ExperimentPlan::new(
        AcquisitionMode::FixedInterval {
            total: Duration::from_secs(3),
            interval: Duration::from_secs(1),
            batch_size: 10,
        },
        None,
        30.0,
    )
    .unwrap();
    let (handle, mut state) = start(&rig, plan);

    wait_for(&mut state, SchedulerState::WindowOpen { index: 1 }).await;
    for snap in 1..=3u16 {
        rig.wait_for_sleepers(1).await;
        if snap != 2 {
            rig.push(1, snap);
        }
        rig.clock.advance(Duration::from_secs(1));
    }

    let summary = handle.join().await.unwrap();
    assert_eq!(summary.snaps_taken, 2);
    assert_eq!(summary.missed_snaps, 1);
    assert_eq!(summary.merged.map(|m| m.frames), Some(2));
    rig.sink.shutdown().await.unwrap();
}
