//! attend-hw — Hardware abstraction for the attendance kiosk.
//!
//! Provides V4L2-based front-camera capture and line-oriented card reader
//! input (HID keyboard-wedge NFC readers present as a character device
//! emitting one identifier per line).

pub mod camera;
pub mod frame;
pub mod tag;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
pub use frame::Frame;
pub use tag::{TagEvent, TagQueue, TagReader};
