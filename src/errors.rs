use std::io;
use thiserror::Error;

use crate::sequencer::TransitionError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Print sequence error: {0}")]
    Sequencer(#[from] TransitionError),

    #[error("Print not found: {id}")]
    NotFound { id: String },
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("Camera permission denied: {device}")]
    PermissionDenied { device: String },

    #[error("Camera device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Camera constraints unsatisfiable: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("Failed to open camera device: {0}")]
    OpenFailed(String),

    #[error("Failed to start camera stream: {0}")]
    StreamStartError(String),

    #[error("Failed to decode camera frame: {0}")]
    FrameDecode(String),

    #[error("No frame available")]
    NoFrameAvailable,

    #[error("No active camera session")]
    NoActiveSession,

    #[error("Camera I/O error: {0}")]
    IoError(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Frame has no pixels ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("Failed to decode still: {0}")]
    DecodeFailed(String),

    #[error("Failed to encode still: {0}")]
    EncodeFailed(String),

    #[error("Capture task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to load image: {0}")]
    ImageLoadError(String),

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Failed to encode export: {0}")]
    EncodeFailed(String),

    #[error("Export task failed: {0}")]
    TaskFailed(String),
}

#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("Caption service is not configured")]
    Disabled,

    #[error("Caption request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Caption service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed caption response: {0}")]
    MalformedResponse(String),

    #[error("Caption service returned no text")]
    EmptyText,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Storage quota exceeded: {size} bytes > {quota} bytes")]
    QuotaExceeded { size: usize, quota: usize },

    #[error("Failed to create storage directory: {path}")]
    CreateDirectoryFailed { path: String },

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid port number")]
    InvalidPort,

    #[error("Invalid camera size: {value}")]
    InvalidCameraSize { value: String },

    #[error("Invalid facing mode: {value}")]
    InvalidFacing { value: String },

    #[error("Invalid camera backend: {value}")]
    InvalidCameraBackend { value: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },

    #[error("Invalid export scale: {value}")]
    InvalidScale { value: u32 },

    #[error("Invalid persona rule: {entry}")]
    InvalidPersona { entry: String },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Camera(_) => 503,
            AppError::Capture(_) => 500,
            AppError::Export(ExportError::InvalidDimensions(_)) => 400,
            AppError::Export(_) => 500,
            AppError::Persistence(PersistenceError::QuotaExceeded { .. }) => 507,
            AppError::Persistence(_) => 503,
            AppError::Config(_) => 500,
            AppError::Sequencer(_) => 409,
            AppError::NotFound { .. } => 404,
        }
    }

    pub fn error_response(&self) -> serde_json::Value {
        serde_json::json!({
            "ok": false,
            "error": self.to_string(),
            "error_type": self.error_type()
        })
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Camera(_) => "camera_error",
            AppError::Capture(_) => "capture_error",
            AppError::Export(_) => "export_error",
            AppError::Persistence(_) => "persistence_error",
            AppError::Config(_) => "config_error",
            AppError::Sequencer(_) => "sequencer_error",
            AppError::NotFound { .. } => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_error_display() {
        let err = CameraError::PermissionDenied {
            device: "/dev/video1".to_string(),
        };
        assert_eq!(err.to_string(), "Camera permission denied: /dev/video1");
    }

    #[test]
    fn test_app_error_status_codes() {
        let err = AppError::NotFound {
            id: "abc".to_string(),
        };
        assert_eq!(err.status_code(), 404);

        let err = AppError::Camera(CameraError::NoFrameAvailable);
        assert_eq!(err.status_code(), 503);

        let err = AppError::Export(ExportError::InvalidDimensions("scale 0".to_string()));
        assert_eq!(err.status_code(), 400);

        let err: AppError = PersistenceError::QuotaExceeded {
            size: 10,
            quota: 5,
        }
        .into();
        assert_eq!(err.status_code(), 507);
        assert_eq!(err.error_response()["error_type"], "persistence_error");

        let err: AppError = PersistenceError::MigrationFailed("locked".to_string()).into();
        assert_eq!(err.status_code(), 503);

        let err: AppError = ConfigError::InvalidPort.into();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.error_response()["error_type"], "config_error");
    }

    #[test]
    fn test_error_response_json() {
        let err = AppError::Capture(CaptureError::EmptyFrame {
            width: 0,
            height: 720,
        });
        let json = err.error_response();

        assert_eq!(json["ok"], false);
        assert_eq!(
            json["error"],
            "Capture error: Frame has no pixels (0x720)"
        );
        assert_eq!(json["error_type"], "capture_error");
    }
}
