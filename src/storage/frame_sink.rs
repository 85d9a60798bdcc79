//! Ordered, lossless frame persistence.
//!
//! `FrameSink` owns a bounded job queue and one writer worker on a blocking
//! context. Jobs are written strictly in submission order. Submitting is
//! non-blocking until `queue_depth` jobs are pending, after which `enqueue`
//! waits for the worker to catch up; frames are never dropped on this path.
//!
//! A job that fails to write is reported once and abandoned; the worker moves
//! on to the next job.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::data::Frame;
use crate::error::{DaqError, DaqResult};
use crate::events::EventSink;
use crate::storage::tiff_stack::StackWriter;

/// Default number of jobs that may be pending before `enqueue` waits.
pub const DEFAULT_QUEUE_DEPTH: usize = 2000;

/// One stack to persist: destination path plus its frames, in order.
#[derive(Debug, Clone)]
pub struct WriteJob {
    path: PathBuf,
    frames: Vec<Arc<Frame>>,
}

impl WriteJob {
    /// Create a job.
    pub fn new(path: PathBuf, frames: Vec<Arc<Frame>>) -> Self {
        Self { path, frames }
    }

    /// Destination file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames to write.
    pub fn frames(&self) -> &[Arc<Frame>] {
        &self.frames
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the job carries no frames.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Totals reported by the writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    /// Jobs written successfully
    pub written: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Frames written across all successful jobs
    pub frames_written: usize,
    /// Frames lost to failed jobs
    pub frames_lost: usize,
    /// Destinations of failed jobs
    pub failed_paths: Vec<PathBuf>,
}

enum SinkMessage {
    Job(WriteJob),
    Shutdown,
}

struct SinkShared {
    closed: AtomicBool,
    submitted: AtomicU64,
    completed: watch::Sender<u64>,
    summary: Mutex<SinkSummary>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the writer. Clones share one queue and one worker.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<SinkMessage>,
    shared: Arc<SinkShared>,
}

impl FrameSink {
    /// Start a writer with the given queue depth.
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn(writer: Arc<dyn StackWriter>, queue_depth: usize, events: EventSink) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (completed, _) = watch::channel(0);
        let shared = Arc::new(SinkShared {
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed,
            summary: Mutex::new(SinkSummary::default()),
            worker: Mutex::new(None),
        });

        let worker_shared = shared.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_worker(rx, writer, events, worker_shared);
        });
        *shared.worker.lock() = Some(handle);

        Self { tx, shared }
    }

    /// Submit a job, waiting only while the queue is full.
    ///
    /// Cancel safe: dropping the future before it resolves submits nothing.
    pub async fn enqueue(&self, job: WriteJob) -> DaqResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(DaqError::SinkClosed);
        }
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| DaqError::SinkClosed)?;
        self.shared.submitted.fetch_add(1, Ordering::SeqCst);
        permit.send(SinkMessage::Job(job));
        Ok(())
    }

    /// Jobs accepted but not yet written or failed.
    pub fn pending(&self) -> u64 {
        let done = *self.shared.completed.borrow();
        self.shared
            .submitted
            .load(Ordering::SeqCst)
            .saturating_sub(done)
    }

    /// Wait until every job submitted so far has been processed.
    pub async fn flush(&self) -> DaqResult<()> {
        let target = self.shared.submitted.load(Ordering::SeqCst);
        let mut completed = self.shared.completed.subscribe();
        completed
            .wait_for(|&done| done >= target)
            .await
            .map_err(|_| DaqError::SinkClosed)?;
        Ok(())
    }

    /// Snapshot of the totals so far.
    pub fn summary(&self) -> SinkSummary {
        self.shared.summary.lock().clone()
    }

    /// Stop accepting jobs, write everything already queued, and join the worker.
    ///
    /// Safe to call more than once; later calls return the same totals.
    pub async fn shutdown(&self) -> DaqResult<SinkSummary> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            // The worker may already be gone if every sender was dropped.
            let _ = self.tx.send(SinkMessage::Shutdown).await;
        }
        let worker = self.shared.worker.lock().take();
        if let Some(worker) = worker {
            worker.await?;
        }
        Ok(self.summary())
    }
}

impl std::fmt::Debug for FrameSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSink")
            .field("pending", &self.pending())
            .field("closed", &self.shared.closed.load(Ordering::SeqCst))
            .finish()
    }
}

fn run_worker(
    mut rx: mpsc::Receiver<SinkMessage>,
    writer: Arc<dyn StackWriter>,
    events: EventSink,
    shared: Arc<SinkShared>,
) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            SinkMessage::Job(job) => {
                write_job(&job, writer.as_ref(), &events, &shared);
                shared.completed.send_modify(|done| *done += 1);
            }
            SinkMessage::Shutdown => {
                // Drain whatever is already queued, then recv yields None.
                rx.close();
            }
        }
    }
    debug!("Frame writer stopped");
}

fn write_job(job: &WriteJob, writer: &dyn StackWriter, events: &EventSink, shared: &SinkShared) {
    match writer.write_stack(job.path(), job.frames()) {
        Ok(()) => {
            {
                let mut summary = shared.summary.lock();
                summary.written += 1;
                summary.frames_written += job.len();
            }
            events.info(format!(
                "Saved {} ({} frames)",
                job.path().display(),
                job.len()
            ));
        }
        Err(e) => {
            {
                let mut summary = shared.summary.lock();
                summary.failed += 1;
                summary.frames_lost += job.len();
                summary.failed_paths.push(job.path().to_path_buf());
            }
            let err = DaqError::Write {
                path: job.path().to_path_buf(),
                frames: job.len(),
                reason: format!("{:#}", e),
            };
            events.emit(err.severity(), err.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{drain, Severity};

    #[derive(Default)]
    struct RecordingWriter {
        written: Mutex<Vec<PathBuf>>,
    }

    impl StackWriter for RecordingWriter {
        fn write_stack(&self, path: &Path, frames: &[Arc<Frame>]) -> anyhow::Result<()> {
            if path.to_string_lossy().contains("bad") {
                anyhow::bail!("disk full");
            }
            assert!(!frames.is_empty());
            self.written.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    fn job(name: &str, frames: usize) -> WriteJob {
        let frames = (0..frames)
            .map(|i| Arc::new(Frame::from_pixels(2, 2, i as u64, vec![0; 4])))
            .collect();
        WriteJob::new(PathBuf::from(name), frames)
    }

    #[tokio::test]
    async fn failed_job_is_reported_and_worker_continues() {
        let writer = Arc::new(RecordingWriter::default());
        let events = EventSink::new();
        let mut rx = events.subscribe();
        let sink = FrameSink::spawn(writer.clone(), 8, events);

        sink.enqueue(job("burst_001.tif", 3)).await.unwrap();
        sink.enqueue(job("bad_002.tif", 4)).await.unwrap();
        sink.enqueue(job("burst_003.tif", 5)).await.unwrap();
        let summary = sink.shutdown().await.unwrap();

        assert_eq!(summary.written, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.frames_written, 8);
        assert_eq!(summary.frames_lost, 4);
        assert_eq!(summary.failed_paths, vec![PathBuf::from("bad_002.tif")]);
        assert_eq!(
            *writer.written.lock(),
            vec![PathBuf::from("burst_001.tif"), PathBuf::from("burst_003.tif")]
        );

        let errors: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| e.severity == Severity::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("4 frames lost"));
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let sink = FrameSink::spawn(Arc::new(RecordingWriter::default()), 4, EventSink::new());
        let first = sink.shutdown().await.unwrap();
        let second = sink.shutdown().await.unwrap();
        assert_eq!(first, second);
        assert!(matches!(
            sink.enqueue(job("late.tif", 1)).await,
            Err(DaqError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn flush_waits_for_submitted_jobs() {
        let writer = Arc::new(RecordingWriter::default());
        let sink = FrameSink::spawn(writer.clone(), 4, EventSink::new());
        for i in 0..3 {
            sink.enqueue(job(&format!("burst_{:03}.tif", i + 1), 1)).await.unwrap();
        }
        sink.flush().await.unwrap();
        assert_eq!(sink.pending(), 0);
        assert_eq!(writer.written.lock().len(), 3);
        sink.shutdown().await.unwrap();
    }
}
