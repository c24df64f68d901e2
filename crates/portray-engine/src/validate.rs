use portray_contracts::events::{EventLog, EventPayload};
use portray_contracts::images::ImageData;
use portray_contracts::result::{ValidationReport, ValidationResult};
use serde_json::{json, Value};

use crate::backend::{Reply, SynthesisBackend};
use crate::{truncate_text, FallbackConfig};

const RUBRIC: &str = "Compare the reference photos above against the final generated image. \
Judge, for the people shown: whether facial structure and features match, whether skin tone \
and complexion match, whether apparent age matches, whether body type matches, and whether \
each person is recognizable overall as the same person. Respond with only a JSON object of \
this exact shape: {\"likeness_score\": <number between 0 and 1>, \"face_match\": <bool>, \
\"skin_tone_match\": <bool>, \"age_match\": <bool>, \"body_type_match\": <bool>, \
\"overall_recognizable\": <bool>, \"explanation\": <short string>, \
\"issues\": [<strings>], \"suggestions\": [<strings>]}";

/// Independent QA pass: scores how well an already-produced image matches
/// the reference photos. Runs after synthesis, never inside it, and never
/// hard-fails the call; an unreadable verdict is reported as a soft miss.
pub struct LikenessValidator<'a, B: SynthesisBackend> {
    config: &'a FallbackConfig,
    backend: &'a B,
    events: Option<&'a EventLog>,
}

impl<'a, B: SynthesisBackend> LikenessValidator<'a, B> {
    pub fn new(config: &'a FallbackConfig, backend: &'a B) -> Self {
        Self {
            config,
            backend,
            events: None,
        }
    }

    pub fn with_events(mut self, events: &'a EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn validate(
        &self,
        references: &[ImageData],
        descriptions: &[String],
        candidate: &ImageData,
    ) -> ValidationReport {
        if references.is_empty() {
            self.emit("validation_skipped", json!({ "reason": "no reference images" }));
            return ValidationReport::skipped();
        }

        let payload = validation_request(references, descriptions, candidate);
        self.emit(
            "validation_started",
            json!({
                "model": self.config.validation_model,
                "references": references.len(),
            }),
        );

        let model = self.config.validation_model.clone();
        match self.backend.invoke(&model, &payload) {
            Reply::Text(text) => match parse_verdict(&text) {
                Some(verdict) => {
                    self.emit(
                        "validation_completed",
                        json!({
                            "model": model,
                            "likeness_score": verdict.likeness_score,
                            "overall_recognizable": verdict.overall_recognizable,
                        }),
                    );
                    ValidationReport {
                        validation: Some(verdict),
                        model_used: Some(model),
                        skipped: false,
                        raw_text: None,
                    }
                }
                None => self.unparseable(model, truncate_text(&text, 1024)),
            },
            Reply::Image(_) => {
                self.unparseable(model, "model returned an image instead of a verdict".to_string())
            }
            Reply::Failure(reason) => self.unparseable(model, truncate_text(&reason, 1024)),
        }
    }

    fn unparseable(&self, model: String, raw_text: String) -> ValidationReport {
        self.emit(
            "validation_unparseable",
            json!({ "model": model, "raw_text": raw_text }),
        );
        ValidationReport {
            validation: None,
            model_used: Some(model),
            skipped: false,
            raw_text: Some(raw_text),
        }
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(events) = self.events {
            let payload = payload
                .as_object()
                .cloned()
                .unwrap_or_else(EventPayload::new);
            let _ = events.emit(event_type, payload);
        }
    }
}

/// Single-turn comparison request: each reference preceded by its label,
/// then the candidate, then the rubric. Low temperature and a JSON response
/// type because this is an evaluation, not a creative task.
pub fn validation_request(
    references: &[ImageData],
    descriptions: &[String],
    candidate: &ImageData,
) -> Value {
    let mut parts = Vec::new();
    for (idx, reference) in references.iter().enumerate() {
        let label = match descriptions.get(idx).map(|text| text.trim()) {
            Some(description) if !description.is_empty() => {
                format!("Reference photo {} ({description}):", idx + 1)
            }
            _ => format!("Reference photo {}:", idx + 1),
        };
        parts.push(json!({ "text": label }));
        parts.push(reference.to_inline_part());
    }
    parts.push(json!({ "text": "Final generated image to evaluate:" }));
    parts.push(candidate.to_inline_part());
    parts.push(json!({ "text": RUBRIC }));

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": 0.2,
            "responseMimeType": "application/json",
        },
    })
}

/// Tolerates markdown code fences and leading prose around the JSON object.
fn parse_verdict(text: &str) -> Option<ValidationResult> {
    let trimmed = text.trim();
    if let Ok(verdict) = serde_json::from_str::<ValidationResult>(trimmed) {
        return Some(verdict);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<ValidationResult>(&trimmed[start..=end]).ok()
}
