//! presence-hw: camera capture for the attendance session loop.
//!
//! Opens a V4L2 device, negotiates a pixel format, and hands out grayscale
//! frames through `presence_core::FrameSource`.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
