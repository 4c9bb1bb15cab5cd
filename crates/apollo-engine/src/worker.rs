use apollo_contracts::episodes::GlobalStyle;

use crate::error_chain_text;
use crate::model::{ContentPart, GenerationConfig, GenerativeModel, ModelRequest, ModelResponse};
use crate::prompt::{compose_panel_prompt, AspectRatio};

const PANEL_TEMPERATURE: f64 = 1.0;

/// Result of one panel attempt. A missing image is an expected outcome,
/// not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelOutcome {
    Generated {
        index: usize,
        bytes: Vec<u8>,
        mime_type: String,
    },
    Failed {
        index: usize,
        error: String,
    },
}

impl PanelOutcome {
    pub fn index(&self) -> usize {
        match self {
            Self::Generated { index, .. } | Self::Failed { index, .. } => *index,
        }
    }

    pub fn failed(index: usize, error: impl Into<String>) -> Self {
        Self::Failed {
            index,
            error: error.into(),
        }
    }
}

/// Shared, read-only inputs for every panel of one batch.
pub struct PanelWorker<'a> {
    model: &'a dyn GenerativeModel,
    model_name: &'a str,
    global: &'a GlobalStyle,
    aspect_ratio: AspectRatio,
    reference_parts: &'a [ContentPart],
}

impl<'a> PanelWorker<'a> {
    pub fn new(
        model: &'a dyn GenerativeModel,
        model_name: &'a str,
        global: &'a GlobalStyle,
        aspect_ratio: AspectRatio,
        reference_parts: &'a [ContentPart],
    ) -> Self {
        Self {
            model,
            model_name,
            global,
            aspect_ratio,
            reference_parts,
        }
    }

    pub fn build_request(&self, panel_prompt: &str) -> ModelRequest {
        let with_references = self.reference_parts.iter().any(ContentPart::is_image);
        let text = compose_panel_prompt(panel_prompt, self.global, self.aspect_ratio, with_references);
        let mut contents = self.reference_parts.to_vec();
        contents.push(ContentPart::text(text));
        let mut config = GenerationConfig::image(PANEL_TEMPERATURE);
        config.aspect_ratio = Some(self.aspect_ratio.as_str().to_string());
        ModelRequest {
            model: self.model_name.to_string(),
            system_instruction: None,
            contents,
            config,
        }
    }

    /// Never returns an error: transport failures, unparseable payloads and
    /// image-less responses all become `PanelOutcome::Failed`.
    pub fn generate(&self, index: usize, panel_prompt: &str) -> PanelOutcome {
        let request = self.build_request(panel_prompt);
        let payload = match self.model.generate(&request) {
            Ok(payload) => payload,
            Err(err) => return PanelOutcome::failed(index, error_chain_text(&err, 512)),
        };
        let image = ModelResponse::parse(payload).and_then(|response| response.first_image());
        match image {
            Ok(image) => PanelOutcome::Generated {
                index,
                bytes: image.bytes,
                mime_type: image.mime_type,
            },
            Err(err) => PanelOutcome::failed(index, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{bail, Result};
    use serde_json::{json, Value};

    use super::*;

    struct Scripted(fn(&ModelRequest) -> Result<Value>);

    impl GenerativeModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(&self, request: &ModelRequest) -> Result<Value> {
            (self.0)(request)
        }
    }

    fn style() -> GlobalStyle {
        GlobalStyle {
            art_style: "chibi".to_string(),
            color_palette: "pastel".to_string(),
            camera_rules: "close-up".to_string(),
            typography_rules: "short".to_string(),
            negatives: "gore".to_string(),
        }
    }

    #[test]
    fn references_precede_prompt_text() {
        let model = Scripted(|_| Ok(json!({})));
        let global = style();
        let refs = vec![
            ContentPart::text("framing"),
            ContentPart::image("image/png", vec![9]),
        ];
        let worker = PanelWorker::new(&model, "img-model", &global, AspectRatio::Square, &refs);
        let request = worker.build_request("hero waves");
        assert_eq!(request.contents.len(), 3);
        assert_eq!(request.contents[0], ContentPart::text("framing"));
        assert!(request.contents[1].is_image());
        let prompt = request.prompt_text().unwrap_or_default();
        assert!(prompt.contains("hero waves"));
        assert!(prompt.contains("must match the reference images"));
        assert_eq!(request.config.aspect_ratio.as_deref(), Some("1:1"));
        assert!(request.config.wants_image());
        assert_eq!(request.model, "img-model");
    }

    #[test]
    fn extracts_first_inline_image() {
        let model = Scripted(|_| {
            Ok(json!({"candidates": [{"content": {"parts": [
                {"text": "ok"},
                {"inlineData": {"mimeType": "image/jpeg", "data": "AQID"}}
            ]}}]}))
        });
        let global = style();
        let worker = PanelWorker::new(&model, "m", &global, AspectRatio::default(), &[]);
        assert_eq!(
            worker.generate(3, "scene"),
            PanelOutcome::Generated {
                index: 3,
                bytes: vec![1, 2, 3],
                mime_type: "image/jpeg".to_string()
            }
        );
    }

    #[test]
    fn model_errors_and_empty_responses_become_failures() {
        let global = style();
        let throwing = Scripted(|_| bail!("quota exceeded"));
        let worker = PanelWorker::new(&throwing, "m", &global, AspectRatio::default(), &[]);
        let outcome = worker.generate(1, "scene");
        assert_eq!(outcome.index(), 1);
        assert!(matches!(&outcome, PanelOutcome::Failed { error, .. } if error.contains("quota")));

        let text_only = Scripted(|_| Ok(json!({"candidates": [{"content": {"parts": [{"text": "no"}]}}]})));
        let worker = PanelWorker::new(&text_only, "m", &global, AspectRatio::default(), &[]);
        assert!(matches!(
            worker.generate(2, "scene"),
            PanelOutcome::Failed { index: 2, .. }
        ));

        let empty = Scripted(|_| Ok(json!({"candidates": []})));
        let worker = PanelWorker::new(&empty, "m", &global, AspectRatio::default(), &[]);
        assert!(matches!(
            worker.generate(0, "scene"),
            PanelOutcome::Failed { error, .. } if error.contains("no candidates")
        ));
    }
}
