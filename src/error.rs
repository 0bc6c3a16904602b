//! Pipeline error taxonomy

use thiserror::Error;

/// Camera-stack device error codes reported through `DeviceEvent::Error`
pub mod device_codes {
    /// Device is already open by a higher-priority client
    pub const CAMERA_IN_USE: i32 = 1;
    /// System-wide limit of open cameras reached
    pub const MAX_CAMERAS_IN_USE: i32 = 2;
    /// Device disabled by policy; treated as lost permission
    pub const CAMERA_DISABLED: i32 = 3;
    /// Fatal fault inside the device
    pub const CAMERA_DEVICE: i32 = 4;
    /// Fatal fault in the camera service
    pub const CAMERA_SERVICE: i32 = 5;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("no camera device available")]
    NoDeviceAvailable,

    #[error("camera authorization denied")]
    AuthorizationDenied,

    #[error("capture session configuration failed: {0}")]
    SessionConfigFailed(String),

    #[error("camera device disconnected")]
    DeviceDisconnected,

    #[error("camera device error (code {0})")]
    DeviceError(i32),

    #[error("external texture import failed: {0}")]
    GpuImportFailed(String),

    #[error("frame transform failed: {0}")]
    TransformFailed(String),

    #[error("timed out waiting for the capture session to start")]
    StartTimedOut,

    #[error("presentation target already has a capture producer")]
    SurfaceBusy,

    #[error("no presentation surface has been created")]
    NoSurface,

    #[error("GPU context error: {0}")]
    GpuContext(String),

    #[error("render thread is not running")]
    RenderThreadGone,
}

/// How the pipeline reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Logged and swallowed, streaming continues
    Recover,
    /// Current start attempt fails, coordinator moves to `Failed`
    FailStart,
    /// Streaming stops, coordinator returns to `Idle`
    ForceIdle,
    /// Unrecoverable, coordinator moves to `Failed` from any state
    Fatal,
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::TransformFailed(_) | Self::GpuImportFailed(_) => Disposition::Recover,
            Self::NoDeviceAvailable
            | Self::AuthorizationDenied
            | Self::SessionConfigFailed(_)
            | Self::StartTimedOut
            | Self::SurfaceBusy
            | Self::NoSurface => Disposition::FailStart,
            Self::DeviceDisconnected => Disposition::ForceIdle,
            Self::DeviceError(code) if *code == device_codes::CAMERA_DISABLED => {
                Disposition::Fatal
            }
            Self::DeviceError(_) => Disposition::ForceIdle,
            Self::GpuContext(_) | Self::RenderThreadGone => Disposition::Fatal,
        }
    }

    /// Error state presented to the host once the coordinator has failed
    pub fn into_failure(self) -> PipelineError {
        match self {
            Self::DeviceError(code) if code == device_codes::CAMERA_DISABLED => {
                Self::AuthorizationDenied
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_recover() {
        assert_eq!(
            PipelineError::TransformFailed("boom".into()).disposition(),
            Disposition::Recover
        );
        assert_eq!(
            PipelineError::GpuImportFailed("stale".into()).disposition(),
            Disposition::Recover
        );
    }

    #[test]
    fn test_device_loss_forces_idle() {
        assert_eq!(
            PipelineError::DeviceDisconnected.disposition(),
            Disposition::ForceIdle
        );
        assert_eq!(
            PipelineError::DeviceError(device_codes::CAMERA_DEVICE).disposition(),
            Disposition::ForceIdle
        );
    }

    #[test]
    fn test_disabled_camera_is_permission_failure() {
        let err = PipelineError::DeviceError(device_codes::CAMERA_DISABLED);
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert_eq!(err.into_failure(), PipelineError::AuthorizationDenied);
    }
}
