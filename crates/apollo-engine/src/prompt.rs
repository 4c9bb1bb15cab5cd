//! Per-panel prompt composition. Pure; no I/O.

use apollo_contracts::episodes::GlobalStyle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "4:5")]
    Portrait,
    #[serde(rename = "9:16")]
    Story,
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "4:5" => Some(Self::Portrait),
            "9:16" => Some(Self::Story),
            "1:1" => Some(Self::Square),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Portrait => "4:5",
            Self::Story => "9:16",
            Self::Square => "1:1",
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Portrait => (896, 1120),
            Self::Story => (768, 1344),
            Self::Square => (1024, 1024),
        }
    }
}

/// Framing text placed ahead of reference images so the model treats them
/// as an identity lock rather than generic input.
pub const REFERENCE_FRAMING: &str = "These are character reference images. The generated image MUST depict the SAME character with identical appearance (hair style, hair color, face shape, eye shape, clothing style):";

const ALWAYS_AVOID: &str = "text, watermarks, signatures, blurry, low quality";

pub fn compose_panel_prompt(
    panel_prompt: &str,
    global: &GlobalStyle,
    aspect_ratio: AspectRatio,
    with_references: bool,
) -> String {
    let (width, height) = aspect_ratio.dimensions();
    let mut requirements = vec![
        "Clean, professional webtoon illustration style".to_string(),
        "No text, speech bubbles, or captions in the image".to_string(),
        format!(
            "Aspect ratio: {} ({width}x{height})",
            aspect_ratio.as_str()
        ),
        "High quality, vibrant colors matching the palette".to_string(),
        "Expressive character emotions and poses".to_string(),
        "Simple, clean background that doesn't distract from the character".to_string(),
    ];
    if with_references {
        requirements.push(
            "CRITICAL: The character must match the reference images provided exactly (same hair, eyes, face shape, clothing)"
                .to_string(),
        );
    } else {
        requirements.push(
            "Keep the character's appearance consistent with the scene description".to_string(),
        );
    }
    let numbered = requirements
        .iter()
        .enumerate()
        .map(|(idx, line)| format!("{}. {line}", idx + 1))
        .collect::<Vec<_>>()
        .join("\n");

    let negatives = global.negatives.trim();
    let avoid = if negatives.is_empty() {
        ALWAYS_AVOID.to_string()
    } else {
        format!("{negatives}, {ALWAYS_AVOID}")
    };

    format!(
        "Generate a single panel image for an Instagram webtoon.\n\n\
         STYLE: {}\n\
         COLOR PALETTE: {}\n\
         CAMERA GUIDANCE: {}\n\n\
         SCENE DESCRIPTION:\n{}\n\n\
         REQUIREMENTS:\n{numbered}\n\n\
         AVOID: {avoid}",
        global.art_style.trim(),
        global.color_palette.trim(),
        global.camera_rules.trim(),
        panel_prompt.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style() -> GlobalStyle {
        GlobalStyle {
            art_style: "cute chibi".to_string(),
            color_palette: "warm pastel".to_string(),
            camera_rules: "vary shots".to_string(),
            typography_rules: "short".to_string(),
            negatives: "realistic style".to_string(),
        }
    }

    #[test]
    fn prompt_carries_every_style_field() {
        let prompt = compose_panel_prompt("girl with bob hair eats ramen", &style(), AspectRatio::Story, false);
        for needle in [
            "STYLE: cute chibi",
            "COLOR PALETTE: warm pastel",
            "CAMERA GUIDANCE: vary shots",
            "girl with bob hair eats ramen",
            "Aspect ratio: 9:16 (768x1344)",
            "No text, speech bubbles",
            "AVOID: realistic style, text, watermarks",
        ] {
            assert!(prompt.contains(needle), "missing {needle:?} in {prompt}");
        }
        assert!(!prompt.contains("reference images"));
    }

    #[test]
    fn reference_directive_only_with_references() {
        let prompt = compose_panel_prompt("scene", &style(), AspectRatio::default(), true);
        assert!(prompt.contains("must match the reference images"));
        assert!(prompt.contains("Aspect ratio: 4:5 (896x1120)"));
    }

    #[test]
    fn empty_negatives_still_forbid_text() {
        let mut global = style();
        global.negatives = "  ".to_string();
        let prompt = compose_panel_prompt("scene", &global, AspectRatio::Square, false);
        assert!(prompt.contains("AVOID: text, watermarks"));
    }

    #[test]
    fn aspect_ratio_parses_wire_names() -> anyhow::Result<()> {
        assert_eq!(AspectRatio::parse("1:1"), Some(AspectRatio::Square));
        assert_eq!(AspectRatio::parse("16:9"), None);
        let parsed: AspectRatio = serde_json::from_str("\"9:16\"")?;
        assert_eq!(parsed, AspectRatio::Story);
        Ok(())
    }
}
