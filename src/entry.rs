use chrono::{DateTime, Local};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compositor::StillImage;

/// Caption lifecycle: developing until exactly one final text is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "text", rename_all = "snake_case")]
pub enum Caption {
    Developing,
    Final(String),
}

impl Caption {
    pub fn is_final(&self) -> bool {
        matches!(self, Caption::Final(_))
    }

    /// Display text, using `placeholder` while developing.
    pub fn text<'a>(&'a self, placeholder: &'a str) -> &'a str {
        match self {
            Caption::Developing => placeholder,
            Caption::Final(text) => text,
        }
    }
}

/// A developed photo card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintEntry {
    id: String,
    #[serde(with = "base64_bytes")]
    image_data: Vec<u8>,
    captured_at: String,
    caption: Caption,
    rotation_deg: f32,
}

impl PrintEntry {
    pub fn new(
        id: impl Into<String>,
        image_data: Vec<u8>,
        captured_at: DateTime<Local>,
        rotation_deg: f32,
    ) -> Self {
        Self {
            id: id.into(),
            image_data,
            captured_at: format_captured_at(captured_at),
            caption: Caption::Developing,
            rotation_deg,
        }
    }

    /// Creates the card for a fresh still: new id, random tilt within `±max_tilt_deg`.
    pub fn develop(still: StillImage, captured_at: DateTime<Local>, max_tilt_deg: f32) -> Self {
        let rotation_deg = if max_tilt_deg > 0.0 {
            rand::thread_rng().gen_range(-max_tilt_deg..=max_tilt_deg)
        } else {
            0.0
        };
        Self::new(
            Uuid::now_v7().to_string(),
            still.into_jpeg(),
            captured_at,
            rotation_deg,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image_data(&self) -> &[u8] {
        &self.image_data
    }

    pub fn captured_at(&self) -> &str {
        &self.captured_at
    }

    pub fn caption(&self) -> &Caption {
        &self.caption
    }

    pub fn rotation_deg(&self) -> f32 {
        self.rotation_deg
    }

    /// Sets the final caption. Returns false if one was already set.
    pub fn resolve_caption(&mut self, text: impl Into<String>) -> bool {
        if self.caption.is_final() {
            return false;
        }
        self.caption = Caption::Final(text.into());
        true
    }
}

pub fn format_captured_at(at: DateTime<Local>) -> String {
    at.format("%b %-d, %Y").to_string()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
