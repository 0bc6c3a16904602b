pub mod decode;
pub mod device;
pub mod frame;
pub mod reader;
pub mod source;
pub mod synthetic;
pub mod v4l2;

pub use device::{
    CameraBackend, CameraDevice, CaptureRequest, CaptureSession, DeviceEvent, DeviceEvents,
    DeviceId, SessionOutputs,
};
pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use reader::{FrameBuffer, FrameReader, FrameWriter};
pub use source::{FrameSource, SourceEvent, SourceHandler, SourceOptions, StreamInfo};
pub use synthetic::{SyntheticBackend, SyntheticCamera};
pub use v4l2::V4l2Backend;
