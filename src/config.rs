use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::camera::Facing;
use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub storage: StorageConfig,
    pub print: PrintConfig,
    pub caption: CaptionConfig,
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraBackend {
    V4l,
    Synthetic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub back_device: String,
    pub front_device: String,
    /// Square resolution hint passed to the device; drivers may pick another size.
    pub ideal_size: u32,
    pub default_facing: Facing,
    pub backend: CameraBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub storage_key: String,
    pub quota_bytes: usize,
}

impl StorageConfig {
    pub fn connection_string(&self) -> String {
        format!("sqlite://{}", self.database_path.display())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrintConfig {
    pub eject_duration_ms: u64,
    pub flash_duration_ms: u64,
    pub shutter_depress_ms: u64,
    pub frame_interval_ms: u64,
    pub max_tilt_deg: f32,
}

impl PrintConfig {
    pub fn eject_duration(&self) -> Duration {
        Duration::from_millis(self.eject_duration_ms)
    }

    pub fn flash_duration(&self) -> Duration {
        Duration::from_millis(self.flash_duration_ms)
    }

    pub fn shutter_depress(&self) -> Duration {
        Duration::from_millis(self.shutter_depress_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for PrintConfig {
    fn default() -> Self {
        Self {
            eject_duration_ms: 3500,
            flash_duration_ms: 300,
            shutter_depress_ms: 150,
            frame_interval_ms: 16,
            max_tilt_deg: 3.0,
        }
    }
}

/// A recognized-person category and the name the caption must use for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersonaRule {
    pub category: String,
    pub name: String,
}

impl FromStr for PersonaRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPersona {
            entry: s.to_string(),
        };
        let (category, name) = s.split_once('=').ok_or_else(invalid)?;
        let (category, name) = (category.trim(), name.trim());
        if category.is_empty() || name.is_empty() {
            return Err(invalid());
        }
        Ok(PersonaRule {
            category: category.to_string(),
            name: name.to_string(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptionConfig {
    pub api_key: Option<String>,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
    pub placeholder: String,
    pub fallback: String,
    pub language: String,
    pub max_chars: usize,
    pub personas: Vec<PersonaRule>,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            timeout_secs: 30,
            placeholder: "developing…".to_string(),
            fallback: "A lovely moment".to_string(),
            language: "English".to_string(),
            max_chars: 20,
            personas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub scale: u32,
    pub font_path: Option<PathBuf>,
}

pub const MAX_EXPORT_SCALE: u32 = 8;

const FALLBACK_FONT_PATH: &str = "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf";

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_number<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: env_or("HOST", "0.0.0.0"),
            port: env_or("PORT", "8080")
                .parse()
                .map_err(|_| ConfigError::InvalidPort)?,
        };

        let ideal_size = env_or("CAMERA_IDEAL_SIZE", "1280");
        let camera = CameraConfig {
            back_device: env_or("CAMERA_BACK_DEVICE", "/dev/video0"),
            front_device: env_or("CAMERA_FRONT_DEVICE", "/dev/video1"),
            ideal_size: ideal_size
                .parse()
                .map_err(|_| ConfigError::InvalidCameraSize { value: ideal_size })?,
            default_facing: env_or("CAMERA_DEFAULT_FACING", "back").parse()?,
            backend: match env_or("CAMERA_BACKEND", "v4l").to_lowercase().as_str() {
                "v4l" => CameraBackend::V4l,
                "synthetic" => CameraBackend::Synthetic,
                other => {
                    return Err(ConfigError::InvalidCameraBackend {
                        value: other.to_string(),
                    })
                }
            },
        };

        let base_path =
            std::env::var("STORAGE_PATH").unwrap_or_else(|_| "/usr/local/share/instant_cam".into());
        let storage = StorageConfig {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| format!("{}/instant_cam.db", base_path))
                .into(),
            storage_key: env_or("GALLERY_STORAGE_KEY", "retro-photos"),
            quota_bytes: env_number("GALLERY_QUOTA_BYTES", 5 * 1024 * 1024)?,
        };

        let defaults = PrintConfig::default();
        let print = PrintConfig {
            eject_duration_ms: env_number("EJECT_DURATION_MS", defaults.eject_duration_ms)?,
            flash_duration_ms: env_number("FLASH_DURATION_MS", defaults.flash_duration_ms)?,
            shutter_depress_ms: env_number("SHUTTER_DEPRESS_MS", defaults.shutter_depress_ms)?,
            frame_interval_ms: env_number("FRAME_INTERVAL_MS", defaults.frame_interval_ms)?,
            max_tilt_deg: env_number("MAX_TILT_DEG", defaults.max_tilt_deg)?,
        };

        let defaults = CaptionConfig::default();
        let caption = CaptionConfig {
            api_key: std::env::var("CAPTION_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            endpoint: env_or("CAPTION_ENDPOINT", &defaults.endpoint),
            model: env_or("CAPTION_MODEL", &defaults.model),
            timeout_secs: env_number("CAPTION_TIMEOUT_SECS", defaults.timeout_secs)?,
            placeholder: env_or("CAPTION_PLACEHOLDER", &defaults.placeholder),
            fallback: env_or("CAPTION_FALLBACK", &defaults.fallback),
            language: env_or("CAPTION_LANGUAGE", &defaults.language),
            max_chars: env_number("CAPTION_MAX_CHARS", defaults.max_chars)?,
            personas: parse_personas(&env_or("CAPTION_PERSONAS", ""))?,
        };

        let export = ExportConfig {
            scale: env_number("EXPORT_SCALE", 4)?,
            font_path: Some(
                std::env::var("EXPORT_FONT_PATH")
                    .unwrap_or_else(|_| FALLBACK_FONT_PATH.to_string())
                    .into(),
            ),
        };

        let config = Config {
            server,
            camera,
            storage,
            print,
            caption,
            export,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.camera.ideal_size == 0 {
            return Err(ConfigError::InvalidCameraSize {
                value: self.camera.ideal_size.to_string(),
            });
        }

        if self.export.scale == 0 || self.export.scale > MAX_EXPORT_SCALE {
            return Err(ConfigError::InvalidScale {
                value: self.export.scale,
            });
        }

        if !(0.0..=45.0).contains(&self.print.max_tilt_deg) {
            return Err(ConfigError::InvalidNumber {
                name: "MAX_TILT_DEG",
                value: self.print.max_tilt_deg.to_string(),
            });
        }

        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.server.port)
    }
}

/// Parses `category=Name;category=Name` into persona rules, skipping blank entries.
pub fn parse_personas(raw: &str) -> Result<Vec<PersonaRule>, ConfigError> {
    raw.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse)
        .collect()
}
