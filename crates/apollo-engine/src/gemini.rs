use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};

use crate::model::{GenerativeModel, ModelRequest};
use crate::settings::Settings;

/// `generateContent` over REST.
pub struct GeminiModel {
    api_base: String,
    api_key: Option<String>,
    timeout_s: f64,
    transport_retries: usize,
    retry_backoff_s: f64,
    http: HttpClient,
}

impl GeminiModel {
    pub fn new(settings: &Settings) -> Self {
        Self {
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            timeout_s: settings.request_timeout_s,
            transport_retries: settings.transport_retries,
            retry_backoff_s: settings.retry_backoff_s,
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &ModelRequest) -> Value {
        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": request
                    .contents
                    .iter()
                    .map(|part| part.to_wire())
                    .collect::<Vec<_>>(),
            })]),
        );
        if let Some(system) = request.system_instruction.as_ref() {
            payload.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }
        payload.insert(
            "generationConfig".to_string(),
            Value::Object(request.config.to_wire()),
        );
        Value::Object(payload)
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
    ) -> Result<HttpResponse> {
        let mut attempt = 0usize;
        loop {
            let response = self
                .http
                .post(endpoint)
                .header("x-goog-api-key", api_key)
                .timeout(Duration::from_secs_f64(self.timeout_s))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= self.transport_retries {
                        return Err(err);
                    }
                    let delay_s = self.retry_backoff_s * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                    attempt += 1;
                }
            }
        }
    }
}

impl GenerativeModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(&self, request: &ModelRequest) -> Result<Value> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        let response = self.post_with_transport_retries(&endpoint, api_key, &payload)?;
        response_json_or_error("Gemini", response)
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
