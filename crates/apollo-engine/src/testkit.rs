//! In-process fakes shared by the handler tests.

use std::fs;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use apollo_contracts::clock::ManualClock;
use apollo_contracts::episodes::paths::EPISODES;
use apollo_contracts::episodes::{Episode, FinalPrompt, GlobalStyle, PanelPrompt};
use apollo_contracts::events::EventWriter;
use apollo_contracts::stores::{BlobStore, DocumentStore, MemoryBlobStore, MemoryDocumentStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::model::{GenerativeModel, ModelRequest};
use crate::settings::Settings;
use crate::{CallContext, Service};

pub const TEST_IP: &str = "203.0.113.7";

type Handler = Box<dyn Fn(&ModelRequest) -> Result<Value> + Send + Sync>;

/// Model double that records every request and answers from a closure.
pub struct ScriptedModel {
    handler: Handler,
    calls: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(handler: impl Fn(&ModelRequest) -> Result<Value> + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answers every request with a small inline image.
    pub fn images() -> Self {
        Self::new(|_| Ok(image_payload(b"\x89PNG-test")))
    }

    pub fn calls(&self) -> Vec<ModelRequest> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or_default()
    }
}

impl GenerativeModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn generate(&self, request: &ModelRequest) -> Result<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        (self.handler)(request)
    }
}

/// Image model that errors whenever the prompt contains one of `needles`.
pub fn failing_model_for(needles: &[&str]) -> ScriptedModel {
    let needles: Vec<String> = needles.iter().map(|needle| needle.to_string()).collect();
    ScriptedModel::new(move |request| {
        let prompt = request.prompt_text().unwrap_or_default();
        if needles.iter().any(|needle| prompt.contains(needle.as_str())) {
            bail!("simulated model failure");
        }
        Ok(image_payload(b"\x89PNG-test"))
    })
}

pub fn image_payload(bytes: &[u8]) -> Value {
    json!({
        "candidates": [{
            "content": {"parts": [
                {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(bytes)}}
            ]}
        }]
    })
}

pub fn text_payload(text: &str) -> Value {
    json!({"candidates": [{"content": {"parts": [{"text": text}]}}]})
}

/// Memory blob store that can be told to reject writes.
#[derive(Default)]
pub struct TestBlobs {
    inner: MemoryBlobStore,
    failing: Mutex<Vec<String>>,
}

impl TestBlobs {
    pub fn fail_puts_matching(&self, needle: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(needle.to_string());
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.inner.is_public(path)
    }

    pub fn content_type(&self, path: &str) -> Option<String> {
        self.inner.content_type(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.inner.paths()
    }
}

impl BlobStore for TestBlobs {
    fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.inner.get(path)
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<()> {
        let rejected = self
            .failing
            .lock()
            .map(|failing| failing.iter().any(|needle| path.contains(needle.as_str())))
            .unwrap_or(false);
        if rejected {
            bail!("simulated upload failure for {path}");
        }
        self.inner.put(path, bytes, content_type)
    }

    fn make_public(&self, path: &str) -> Result<String> {
        self.inner.make_public(path)
    }
}

pub struct Harness {
    pub service: Service,
    pub documents: Arc<MemoryDocumentStore>,
    pub blobs: Arc<TestBlobs>,
    pub model: Arc<ScriptedModel>,
    pub clock: Arc<ManualClock>,
    temp: TempDir,
}

impl Harness {
    pub fn events(&self) -> Vec<Value> {
        let path = self.temp.path().join("events.jsonl");
        fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    pub fn events_of(&self, event_type: &str) -> Vec<Value> {
        self.events()
            .into_iter()
            .filter(|event| event["type"] == json!(event_type))
            .collect()
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_750_000_000, 0).unwrap()
}

pub fn harness(model: ScriptedModel) -> Harness {
    harness_with(model, Settings::default())
}

pub fn harness_with(model: ScriptedModel, settings: Settings) -> Harness {
    harness_on(Arc::new(MemoryDocumentStore::new()), model, settings)
}

pub fn harness_on(
    documents: Arc<MemoryDocumentStore>,
    model: ScriptedModel,
    settings: Settings,
) -> Harness {
    let temp = tempfile::tempdir().expect("tempdir");
    let blobs = Arc::new(TestBlobs::default());
    let model = Arc::new(model);
    let clock = Arc::new(ManualClock::new(start_time()));
    let events = EventWriter::new(temp.path().join("events.jsonl"), "test-invocation");
    let service = Service::new(
        documents.clone(),
        blobs.clone(),
        model.clone(),
        clock.clone(),
        settings,
        events,
    );
    Harness {
        service,
        documents,
        blobs,
        model,
        clock,
        temp,
    }
}

pub fn ctx(uid: &str) -> CallContext {
    CallContext::authenticated(uid, TEST_IP)
}

pub fn sample_style() -> GlobalStyle {
    GlobalStyle {
        art_style: "cute chibi webtoon".to_string(),
        color_palette: "warm pastel".to_string(),
        camera_rules: "vary shots".to_string(),
        typography_rules: "short".to_string(),
        negatives: "realistic style".to_string(),
    }
}

pub fn sample_plan(count: usize) -> FinalPrompt {
    FinalPrompt {
        title: "Rainy Monday".to_string(),
        summary: "A long day.".to_string(),
        global: sample_style(),
        panels: (0..count)
            .map(|index| PanelPrompt {
                index,
                scene: format!("scene {index}"),
                prompt: format!("girl with a yellow raincoat, panel {index} of {count}"),
                caption_draft: format!("cap {index}"),
            })
            .collect(),
        character_sheet_digest: "0123456789abcdef".to_string(),
        generated_at: start_time(),
    }
}

/// Stores a draft episode with a `count`-panel plan and no images.
pub fn seed_planned_episode(
    documents: &dyn DocumentStore,
    episode_id: &str,
    uid: &str,
    count: usize,
) -> Result<Episode> {
    let mut episode = Episode::new_draft(episode_id, uid, "a diary entry long enough", count, start_time());
    episode.apply_plan(sample_plan(count), start_time());
    documents.set(EPISODES, episode_id, episode.to_document()?)?;
    Ok(episode)
}

pub fn read_episode(documents: &dyn DocumentStore, episode_id: &str) -> Result<Episode> {
    let doc = documents
        .get(EPISODES, episode_id)?
        .with_context(|| format!("episode {episode_id} missing"))?;
    Episode::from_document(episode_id, doc)
}
