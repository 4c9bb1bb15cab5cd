//! Boundary to the generative model.
//!
//! Requests are built as typed values; the raw JSON payload returned by a
//! model is never trusted until [`ModelResponse::parse`] has accepted it.

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    InlineData { mime_type: String, data: Vec<u8> },
    Text(String),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn image(mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self::InlineData {
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::InlineData { .. })
    }

    /// Wire form: `{"inlineData": {...}}` or `{"text": ...}`.
    pub fn to_wire(&self) -> Value {
        match self {
            Self::InlineData { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": BASE64.encode(data),
                }
            }),
            Self::Text(text) => json!({ "text": text }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Image,
    Text,
}

impl Modality {
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub response_mime_type: Option<String>,
    pub response_schema: Option<Value>,
    pub aspect_ratio: Option<String>,
}

impl GenerationConfig {
    pub fn image(temperature: f64) -> Self {
        Self {
            response_modalities: vec![Modality::Image, Modality::Text],
            temperature,
            top_p: None,
            response_mime_type: None,
            response_schema: None,
            aspect_ratio: None,
        }
    }

    pub fn structured_json(schema: Value, temperature: f64) -> Self {
        Self {
            response_modalities: vec![Modality::Text],
            temperature,
            top_p: Some(0.95),
            response_mime_type: Some("application/json".to_string()),
            response_schema: Some(schema),
            aspect_ratio: None,
        }
    }

    pub fn wants_image(&self) -> bool {
        self.response_modalities.contains(&Modality::Image)
    }

    pub fn to_wire(&self) -> Map<String, Value> {
        let mut config = Map::new();
        config.insert(
            "responseModalities".to_string(),
            Value::Array(
                self.response_modalities
                    .iter()
                    .map(|modality| Value::String(modality.as_wire().to_string()))
                    .collect(),
            ),
        );
        config.insert("temperature".to_string(), json!(self.temperature));
        if let Some(top_p) = self.top_p {
            config.insert("topP".to_string(), json!(top_p));
        }
        if let Some(mime) = self.response_mime_type.as_ref() {
            config.insert("responseMimeType".to_string(), json!(mime));
        }
        if let Some(schema) = self.response_schema.as_ref() {
            config.insert("responseSchema".to_string(), schema.clone());
        }
        if let Some(ratio) = self.aspect_ratio.as_ref() {
            config.insert("imageConfig".to_string(), json!({ "aspectRatio": ratio }));
        }
        config
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    pub contents: Vec<ContentPart>,
    pub config: GenerationConfig,
}

impl ModelRequest {
    /// Last text part, which by convention carries the instruction.
    pub fn prompt_text(&self) -> Option<&str> {
        self.contents.iter().rev().find_map(|part| match part {
            ContentPart::Text(text) => Some(text.as_str()),
            ContentPart::InlineData { .. } => None,
        })
    }

    pub fn image_count(&self) -> usize {
        self.contents.iter().filter(|part| part.is_image()).count()
    }
}

/// Opaque, possibly slow, possibly empty-handed generator. Returns the raw
/// response payload; transport and HTTP failures are errors.
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &ModelRequest) -> Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("model response has an unexpected shape: {0}")]
    Malformed(String),
    #[error("model response contained no candidates")]
    NoCandidates,
    #[error("model response contained no image{}", finish_reason_suffix(.finish_reason))]
    NoImage { finish_reason: Option<String> },
    #[error("model image payload is not valid base64: {0}")]
    BadImageData(String),
    #[error("model response contained no text")]
    NoText,
}

fn finish_reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|reason| format!(" (finish reason: {reason})"))
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InlineDataWire {
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PartWire {
    #[serde(default, rename = "inlineData", alias = "inline_data")]
    inline_data: Option<InlineDataWire>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ContentWire {
    #[serde(default)]
    parts: Vec<PartWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CandidateWire {
    #[serde(default)]
    content: Option<ContentWire>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResponseWire {
    #[serde(default)]
    candidates: Vec<CandidateWire>,
    #[serde(default)]
    text: Option<String>,
}

/// Validated view over a model payload.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    wire: ResponseWire,
}

impl ModelResponse {
    pub fn parse(payload: Value) -> Result<Self, ResponseError> {
        if !payload.is_object() {
            return Err(ResponseError::Malformed("payload is not an object".to_string()));
        }
        let wire: ResponseWire = serde_json::from_value(payload)
            .map_err(|err| ResponseError::Malformed(err.to_string()))?;
        Ok(Self { wire })
    }

    pub fn candidate_count(&self) -> usize {
        self.wire.candidates.len()
    }

    fn parts(&self) -> impl Iterator<Item = &PartWire> {
        self.wire
            .candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
    }

    /// First inline image across candidates, in order.
    pub fn first_image(&self) -> Result<ImageBytes, ResponseError> {
        if self.wire.candidates.is_empty() {
            return Err(ResponseError::NoCandidates);
        }
        let inline = self
            .parts()
            .filter_map(|part| part.inline_data.as_ref())
            .find(|inline| !inline.data.is_empty());
        let Some(inline) = inline else {
            return Err(ResponseError::NoImage {
                finish_reason: self
                    .wire
                    .candidates
                    .iter()
                    .find_map(|candidate| candidate.finish_reason.clone()),
            });
        };
        let bytes = BASE64
            .decode(inline.data.as_bytes())
            .map_err(|err| ResponseError::BadImageData(err.to_string()))?;
        Ok(ImageBytes {
            bytes,
            mime_type: inline
                .mime_type
                .clone()
                .filter(|mime| !mime.trim().is_empty())
                .unwrap_or_else(|| "image/png".to_string()),
        })
    }

    /// Top-level `text` if present, otherwise the text parts of the first
    /// candidate joined together.
    pub fn text(&self) -> Result<String, ResponseError> {
        if let Some(text) = self.wire.text.as_ref().filter(|text| !text.trim().is_empty()) {
            return Ok(text.clone());
        }
        let joined = self
            .wire
            .candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default();
        if joined.trim().is_empty() {
            return Err(ResponseError::NoText);
        }
        Ok(joined)
    }
}
