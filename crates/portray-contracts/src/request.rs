use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::images::ImageData;

/// Rendering style vocabulary. Unknown strings degrade to the
/// photorealistic default rather than failing the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    Cinematic,
    OilPainting,
    Watercolor,
    Neon,
    ThreeDRender,
    Photorealistic,
}

impl Style {
    pub fn parse(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        match normalized.as_str() {
            "cinematic" => Self::Cinematic,
            "oilpainting" => Self::OilPainting,
            "watercolor" | "watercolour" => Self::Watercolor,
            "neon" => Self::Neon,
            "3drender" | "3d" => Self::ThreeDRender,
            _ => Self::Photorealistic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cinematic => "cinematic",
            Self::OilPainting => "oil_painting",
            Self::Watercolor => "watercolor",
            Self::Neon => "neon",
            Self::ThreeDRender => "3d_render",
            Self::Photorealistic => "photorealistic",
        }
    }
}

/// One synthesis call's input, immutable for the duration of the call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub base_image: Option<ImageData>,
    pub reference_images: Vec<ImageData>,
    pub reference_tags: Vec<String>,
    pub identity_notes: Option<String>,
    pub scene_description: String,
    pub title_text: Option<String>,
    pub embedded_text: Option<String>,
    pub style: Option<Style>,
    pub aspect_ratio: Option<String>,
    pub premium: bool,
}

impl SynthesisRequest {
    pub fn new(scene_description: impl Into<String>) -> Self {
        Self {
            base_image: None,
            reference_images: Vec::new(),
            reference_tags: Vec::new(),
            identity_notes: None,
            scene_description: scene_description.into(),
            title_text: None,
            embedded_text: None,
            style: None,
            aspect_ratio: None,
            premium: false,
        }
    }

    /// Parses the handler-facing JSON shape. With more than one entry in
    /// `images` the first is the base (primary likeness anchor); a single
    /// image is kept as a reference so its tag stays index-aligned.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self> {
        let scene_description = payload
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .context("request payload is missing 'prompt'")?
            .to_string();

        let raw_images = payload
            .get("images")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut images = Vec::with_capacity(raw_images.len());
        for (idx, row) in raw_images.iter().enumerate() {
            let Some(text) = row.as_str() else {
                bail!("images[{idx}] is not a string");
            };
            let image = ImageData::from_payload_string(text)
                .with_context(|| format!("images[{idx}] could not be decoded"))?;
            images.push(image);
        }
        let (base_image, reference_images) = if images.len() > 1 {
            let base = images.remove(0);
            (Some(base), images)
        } else {
            (None, images)
        };

        let reference_tags = payload
            .get("referenceImageTags")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            base_image,
            reference_images,
            reference_tags,
            identity_notes: optional_text(payload, "identityPrompt"),
            scene_description,
            title_text: optional_text(payload, "titleText"),
            embedded_text: optional_text(payload, "embeddedText"),
            style: optional_text(payload, "style")
                .map(|value| Style::parse(&value)),
            aspect_ratio: optional_text(payload, "aspectRatio"),
            premium: payload
                .get("premium")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    pub fn has_reference_material(&self) -> bool {
        self.base_image.is_some() || !self.reference_images.is_empty()
    }

    /// Base image first, then references, in caller order.
    pub fn all_images(&self) -> Vec<&ImageData> {
        self.base_image
            .iter()
            .chain(self.reference_images.iter())
            .collect()
    }

    /// One label per reference image. Missing or short tag lists degrade to
    /// generic `Person N` labels instead of failing.
    pub fn person_labels(&self) -> Vec<String> {
        (0..self.reference_images.len())
            .map(|idx| {
                self.reference_tags
                    .get(idx)
                    .map(|tag| tag.trim())
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("Person {}", idx + 1))
            })
            .collect()
    }

    /// Identity notes split into per-person paragraphs (blank-line
    /// separated), index-aligned with `person_labels`.
    pub fn identity_note_paragraphs(&self) -> Vec<String> {
        let Some(notes) = self.identity_notes.as_deref() else {
            return Vec::new();
        };
        notes
            .split("\n\n")
            .map(str::trim)
            .filter(|paragraph| !paragraph.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn optional_text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
