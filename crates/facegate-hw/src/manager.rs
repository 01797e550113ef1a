//! Shared ownership of the single physical camera.
//!
//! Enrollment and identification both stream from the same device. The
//! manager opens it lazily on the first [`CameraManager::acquire`] and hands
//! out the same handle until [`CameraManager::release`] closes it. Open,
//! close, reads and the "is it open" check all go through the handle's mutex,
//! so at most one device is ever live.

use crate::camera::{Camera, CameraDevice, CameraError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Handle to the camera slot, shared by whoever is currently streaming.
///
/// `None` once the manager has released the device; readers holding a clone
/// must treat that as end of stream.
pub type SharedCamera = Arc<Mutex<Option<Box<dyn CameraDevice>>>>;

/// Opens the underlying device.
pub type CameraOpener = Box<dyn Fn() -> Result<Box<dyn CameraDevice>, CameraError> + Send + Sync>;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

pub struct CameraManager {
    opener: CameraOpener,
    settle: Duration,
    handle: SharedCamera,
}

impl CameraManager {
    pub fn new(opener: CameraOpener, settle: Duration) -> Self {
        Self {
            opener,
            settle,
            handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Manager for a V4L2 device path.
    pub fn v4l2(device_path: impl Into<String>, width: u32, height: u32, settle: Duration) -> Self {
        let path = device_path.into();
        Self::new(
            Box::new(move || {
                Camera::open(&path, width, height).map(|cam| Box::new(cam) as Box<dyn CameraDevice>)
            }),
            settle,
        )
    }

    /// Return the open camera, opening it first if needed.
    ///
    /// After a fresh open the call sleeps for the settle delay so exposure can
    /// adjust before the first frame is read.
    pub fn acquire(&self) -> Result<SharedCamera, CameraError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Ok(Arc::clone(&self.handle));
        }

        let device = (self.opener)().map_err(|err| {
            tracing::error!(error = %err, "camera open failed");
            match err {
                CameraError::Unavailable(msg) => CameraError::Unavailable(msg),
                other => CameraError::Unavailable(other.to_string()),
            }
        })?;
        tracing::info!(settle_ms = self.settle.as_millis() as u64, "camera opened");
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }

        *slot = Some(device);
        Ok(Arc::clone(&self.handle))
    }

    /// Close the device. Waits for a read in progress on another thread to
    /// finish; streams still holding the handle see an empty slot afterwards.
    /// Releasing an unopened camera is a no-op.
    pub fn release(&self) {
        let mut slot = self.lock();
        // Dropped under the lock so a concurrent acquire cannot open a second device first.
        if let Some(device) = slot.take() {
            drop(device);
            tracing::info!("camera released");
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn CameraDevice>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
