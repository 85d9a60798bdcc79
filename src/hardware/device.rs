//! Owned camera handle with a scoped lock.
//!
//! The camera handle is the only shared mutable hardware resource. Instead of a
//! global mutex, the handle is an owned value that is cloned into the components
//! that need it (the acquire loop and reconfiguration). The lock is taken for a
//! single closure at a time, so no caller can hold it across a loop iteration.

use parking_lot::Mutex;
use std::sync::Arc;

use super::capabilities::CameraDevice;

/// Shared, lock-guarded camera.
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<Mutex<Box<dyn CameraDevice>>>,
}

impl DeviceHandle {
    /// Wrap a camera driver.
    pub fn new(device: impl CameraDevice + 'static) -> Self {
        Self {
            device: Arc::new(Mutex::new(Box::new(device))),
        }
    }

    /// Run one operation with exclusive access to the device.
    ///
    /// The lock is released as soon as `op` returns.
    pub fn with<R>(&self, op: impl FnOnce(&mut dyn CameraDevice) -> R) -> R {
        let mut guard = self.device.lock();
        op(guard.as_mut())
    }

    /// Device label, taken under the lock.
    pub fn label(&self) -> String {
        self.with(|dev| dev.label())
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("busy", &self.device.is_locked())
            .finish()
    }
}
