//! Frame acquisition: the camera poll loop, its fan-out, and the live preview.

pub mod camera_source;
pub mod preview;

pub use camera_source::{
    CameraSource, FanOut, FrameProducer, FrameSubscription, ManualSource, SourceState,
};
pub use preview::{render, render_scaled, DisplayAdjust, PreviewRate, PreviewSink, PreviewThrottle};
