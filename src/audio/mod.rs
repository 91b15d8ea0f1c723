//! Audio capture: device selection and the frame-producing capture stream.

pub mod capture;
pub mod device;

pub use capture::CaptureStream;
pub use device::{DeviceInfo, diagnose_report, list_devices};
