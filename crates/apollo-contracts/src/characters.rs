use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterTraits {
    pub age: String,
    pub gender: String,
    pub hair_style: String,
    pub hair_color: String,
    pub eye_color: String,
    pub skin_tone: String,
    pub height: String,
    pub body_type: String,
    pub clothing: String,
    pub accessories: Vec<String>,
    pub distinctive_features: Vec<String>,
}

/// Library entry used to pin a recurring character across episodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reference_image_paths: Vec<String>,
    #[serde(default)]
    pub default_style: String,
    #[serde(default)]
    pub traits: CharacterTraits,
}

impl Character {
    pub fn from_document(id: &str, doc: Value) -> anyhow::Result<Self> {
        let mut character: Character = serde_json::from_value(doc)
            .with_context(|| format!("character document {id} has an unexpected shape"))?;
        if character.id.is_empty() {
            character.id = id.to_string();
        }
        Ok(character)
    }
}

/// Renders the character sheet text handed to storyboard planning.
pub fn render_character_sheet(character: &Character) -> String {
    let traits = &character.traits;
    format!(
        "CHARACTER NAME: {name}

PHYSICAL APPEARANCE (MUST BE CONSISTENT IN EVERY IMAGE):
- Age: {age}
- Gender: {gender}
- Hair: {hair_style}, {hair_color}
- Eyes: {eye_color}
- Skin: {skin_tone}
- Height: {height}
- Body Type: {body_type}
- Default Clothing: {clothing}
- Accessories: {accessories}
- Distinctive Features: {features}

DETAILED DESCRIPTION:
{description}

ART STYLE: {style}
",
        name = character.name,
        age = traits.age,
        gender = traits.gender,
        hair_style = traits.hair_style,
        hair_color = traits.hair_color,
        eye_color = traits.eye_color,
        skin_tone = traits.skin_tone,
        height = traits.height,
        body_type = traits.body_type,
        clothing = traits.clothing,
        accessories = traits.accessories.join(", "),
        features = traits.distinctive_features.join(", "),
        description = character.description.trim(),
        style = character.default_style,
    )
}
