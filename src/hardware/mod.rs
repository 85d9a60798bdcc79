//! Hardware layer.
//!
//! - `capabilities`: traits for the camera and the TTL stimulator
//! - `device`: lock-guarded camera handle shared by acquisition and configuration
//! - `mock`: simulated camera and stimulator
//! - `serial`: serial-port stimulator (feature `instrument_serial`)
//!
//! Vendor camera SDKs plug in by implementing [`CameraDevice`].

pub mod capabilities;
pub mod device;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use capabilities::{CameraDevice, LinkOpener, Roi, StimulatorLink, TTL_HIGH, TTL_LOW};
pub use device::DeviceHandle;
pub use mock::{MockCamera, MockCameraControl, MockStimulatorOpener, StimulatorRecorder};
#[cfg(feature = "instrument_serial")]
pub use serial::{SerialOpener, SerialStimulator};
