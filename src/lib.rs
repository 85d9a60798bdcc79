//! # Calcium DAQ Core Library
//!
//! Acquisition and TTL-trigger pipeline for synchronized calcium-imaging
//! experiments. A camera streams frames continuously; a scheduler opens timed
//! capture windows, fires electrical stimuli through a serial TTL box at a
//! configured delay inside each window, and hands captured frames to an
//! ordered, lossless TIFF writer.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: `CameraSource` (poll loop and fan-out to bounded,
//!   drop-newest subscriptions) and the rate-limited live `PreviewSink`.
//! - **`clock`**: the `HardwareClock` seam; `SystemClock` in production,
//!   `ManualClock` in tests.
//! - **`config`**: layered configuration (defaults, TOML, environment) via Figment.
//! - **`data`**: `Frame`, the immutable unit shared across the pipeline.
//! - **`error`**: the `DaqError` enum.
//! - **`events`**: `EventSink`, the status channel every component reports to.
//! - **`experiment`**: plans, capture windows, and the `BurstScheduler` state machine.
//! - **`hardware`**: camera and stimulator traits, mock devices, and the serial stimulator.
//! - **`logging`**: tracing subscriber setup.
//! - **`stimulus`**: pulse specifications and the `PulseController`.
//! - **`storage`**: `FrameSink`, multi-page TIFF stacks, output layout, and batch merging.

pub mod acquisition;
pub mod clock;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod experiment;
pub mod hardware;
pub mod logging;
pub mod stimulus;
pub mod storage;
