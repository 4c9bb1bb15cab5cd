use std::io::Cursor;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::model::{GenerativeModel, ModelRequest};
use crate::prompt::AspectRatio;

/// Offline model. Image requests get a solid-colour PNG derived from the
/// prompt; schema-constrained text requests get a deterministic plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunModel;

const PREVIEW_SCALE: u32 = 8;

impl GenerativeModel for DryrunModel {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &ModelRequest) -> Result<Value> {
        let prompt = request.prompt_text().unwrap_or_default();
        if request.config.wants_image() {
            let ratio = request
                .config
                .aspect_ratio
                .as_deref()
                .and_then(AspectRatio::parse)
                .unwrap_or_default();
            let (width, height) = ratio.dimensions();
            let png = render_dryrun_png(
                width / PREVIEW_SCALE,
                height / PREVIEW_SCALE,
                prompt,
                request.image_count() as u64,
            )?;
            return Ok(json!({
                "candidates": [{
                    "content": {"parts": [
                        {"inlineData": {"mimeType": "image/png", "data": BASE64.encode(png)}}
                    ]},
                    "finishReason": "STOP"
                }]
            }));
        }

        let panel_count = request
            .config
            .response_schema
            .as_ref()
            .and_then(|schema| schema.pointer("/properties/panels/minItems"))
            .and_then(|value| {
                value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|raw| raw.parse().ok()))
            })
            .unwrap_or(4) as usize;
        let plan = dryrun_plan(prompt, panel_count);
        Ok(json!({
            "candidates": [{
                "content": {"parts": [{"text": plan.to_string()}]},
                "finishReason": "STOP"
            }]
        }))
    }
}

fn dryrun_plan(prompt: &str, panel_count: usize) -> Value {
    let tag = &short_digest(prompt)[..6];
    let panels = (0..panel_count)
        .map(|index| {
            json!({
                "index": index,
                "scene": format!("Scene {} of the day", index + 1),
                "prompt": format!(
                    "The same character from the sheet, panel {} of {panel_count}, medium shot, {tag}",
                    index + 1
                ),
                "captionDraft": format!("Moment {}", index + 1),
            })
        })
        .collect::<Vec<_>>();
    json!({
        "title": format!("Dry run {tag}"),
        "summary": "An offline storyboard.",
        "global": {
            "artStyle": "cute chibi webtoon style, soft shading",
            "colorPalette": "warm pastel colors",
            "cameraRules": "vary between close-up, medium and wide shots",
            "typographyRules": "short and witty",
            "negatives": "realistic style, dark colors, complex backgrounds"
        },
        "panels": panels,
    })
}

fn render_dryrun_png(width: u32, height: u32, prompt: &str, seed: u64) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt, seed);
    let mut image = RgbImage::new(width.max(1), height.max(1));
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode dry-run PNG")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_digest(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher
        .finalize()
        .iter()
        .take(4)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
