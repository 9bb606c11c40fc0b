// Caption generation against a remote vision model.
// Failures never leave this module: every request resolves to some text.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CaptionConfig;
use crate::errors::CaptionError;

#[async_trait]
pub trait CaptionService: Send + Sync {
    async fn describe(&self, jpeg: &[u8], instruction: &str) -> Result<String, CaptionError>;
    fn type_name(&self) -> &'static str;
}

/// Local time as embedded in the instruction, e.g. `14:30`.
pub fn caption_time(at: DateTime<Local>) -> String {
    at.format("%H:%M").to_string()
}

pub fn build_instruction(config: &CaptionConfig, local_time: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Look carefully at this photo.\n");
    prompt.push_str(&format!(
        "Write a short caption in {}, like a handwritten note on an instant print.\n",
        config.language
    ));

    if config.personas.is_empty() {
        prompt.push_str("Describe any people generically, without guessing names.\n");
    } else {
        prompt.push_str("Follow these naming rules strictly:\n");
        for (i, rule) in config.personas.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. If you see {}, call them \"{}\".\n",
                i + 1,
                rule.category,
                rule.name
            ));
        }
        prompt.push_str(&format!(
            "{}. If nobody is visible, describe the scenery or objects.\n",
            config.personas.len() + 1
        ));
    }

    prompt.push_str("Output format: \"[time] [place] [activity]\"\n");
    prompt.push_str(&format!(
        "The current time is {}. Identify the place from the scene (bedroom, living room, street, beach...).\n",
        local_time
    ));
    prompt.push_str(&format!(
        "Keep it warm and natural, at most {} characters. Reply with the caption only.",
        config.max_chars
    ));
    prompt
}

/// Trims whitespace and wrapping quotes. `None` if nothing is left.
pub fn clean_caption(raw: &str) -> Option<String> {
    let text = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '“' | '”' | '「' | '」'))
        .trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

// ============================================================================
// Gemini generateContent client
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    InlineData { inline_data: InlineData },
    Text { text: &'a str },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

fn response_text(body: &str) -> Result<String, CaptionError> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| CaptionError::MalformedResponse(e.to_string()))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(CaptionError::EmptyText);
    }
    Ok(text)
}

pub struct GeminiCaptionService {
    http: Client,
    url: String,
    api_key: String,
}

impl GeminiCaptionService {
    pub fn new(config: &CaptionConfig, api_key: String) -> Result<Self, CaptionError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            url: format!(
                "{}/models/{}:generateContent",
                config.endpoint.trim_end_matches('/'),
                config.model
            ),
            api_key,
        })
    }
}

#[async_trait]
impl CaptionService for GeminiCaptionService {
    async fn describe(&self, jpeg: &[u8], instruction: &str) -> Result<String, CaptionError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type: "image/jpeg",
                            data: STANDARD.encode(jpeg),
                        },
                    },
                    RequestPart::Text { text: instruction },
                ],
            }],
        };

        let response = self
            .http
            .post(&self.url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CaptionError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        response_text(&body)
    }

    fn type_name(&self) -> &'static str {
        "Gemini"
    }
}

/// Used when no API key is configured; every caption becomes the fallback.
pub struct DisabledCaptionService;

#[async_trait]
impl CaptionService for DisabledCaptionService {
    async fn describe(&self, _jpeg: &[u8], _instruction: &str) -> Result<String, CaptionError> {
        Err(CaptionError::Disabled)
    }

    fn type_name(&self) -> &'static str {
        "Disabled"
    }
}

// Factory function to create the configured caption service
pub fn new_caption_service(config: &CaptionConfig) -> Arc<dyn CaptionService> {
    match &config.api_key {
        Some(key) => match GeminiCaptionService::new(config, key.clone()) {
            Ok(service) => {
                info!("Caption service: {} ({})", service.type_name(), config.model);
                Arc::new(service)
            }
            Err(e) => {
                warn!("Failed to build caption client, captions will use the fallback: {}", e);
                Arc::new(DisabledCaptionService)
            }
        },
        None => {
            info!("No caption API key configured, captions will use the fallback");
            Arc::new(DisabledCaptionService)
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Turns a still into final caption text, absorbing every service failure.
pub struct CaptionAdapter {
    service: Arc<dyn CaptionService>,
    config: CaptionConfig,
}

impl CaptionAdapter {
    pub fn new(service: Arc<dyn CaptionService>, config: CaptionConfig) -> Self {
        Self { service, config }
    }

    pub fn placeholder(&self) -> &str {
        &self.config.placeholder
    }

    pub async fn describe(&self, jpeg: &[u8], captured_at: DateTime<Local>) -> String {
        let instruction = build_instruction(&self.config, &caption_time(captured_at));

        match self.service.describe(jpeg, &instruction).await {
            Ok(raw) => match clean_caption(&raw) {
                Some(text) => {
                    debug!("Caption from {}: {}", self.service.type_name(), text);
                    text
                }
                None => {
                    warn!("Caption service returned blank text, using fallback");
                    self.config.fallback.clone()
                }
            },
            Err(CaptionError::Disabled) => self.config.fallback.clone(),
            Err(e) => {
                warn!("Caption generation failed, using fallback: {}", e);
                self.config.fallback.clone()
            }
        }
    }
}
