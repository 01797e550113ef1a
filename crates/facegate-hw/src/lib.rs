//! facegate-hw: camera capture for facegate.
//!
//! V4L2 access, RGB frame conversion and the manager that shares one open
//! camera between the enrollment and identification streams.

pub mod camera;
pub mod frame;
pub mod manager;

pub use camera::{Camera, CameraDevice, CameraError, DeviceInfo};
pub use frame::Frame;
pub use manager::{CameraManager, SharedCamera};
