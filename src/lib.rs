// Library module organization

pub mod config;
pub mod errors;

// Capture pipeline
pub mod camera;
pub mod compositor;
pub mod entry;
pub mod scheduler;
pub mod sequencer;
pub mod vintage;

// Services around committed prints
pub mod caption;
pub mod export;
pub mod gallery;

pub mod booth;

// Re-export commonly used types for convenience
pub use booth::{BoothEvent, BoothParts, BoothStatus, PhotoBooth, ShutterOutcome};
pub use camera::{new_camera_device, CameraSessionManager, Facing};
pub use config::Config;
pub use entry::{Caption, PrintEntry};
pub use errors::{AppError, AppResult};
