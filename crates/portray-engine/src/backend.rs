use std::collections::BTreeSet;
use std::io::Cursor;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::{Rgb, RgbImage};
use portray_contracts::images::ImageData;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::orchestrate::failure_hint;
use crate::{error_chain_text, non_empty_env, truncate_text, FallbackConfig};

/// Normalized outcome of one backend call. `Text` means the model answered
/// with prose instead of drawing; whether that is a failure depends on the
/// caller (the orchestrator treats it as one, the validator expects it).
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Image(ImageData),
    Text(String),
    Failure(String),
}

/// One call to one backend model with one already-built payload. No retries,
/// no request mutation; retrying is the orchestrator's decision.
pub trait SynthesisBackend {
    fn invoke(&self, model: &str, payload: &Value) -> Reply;
}

pub struct GeminiBackend {
    api_base: String,
    api_key: Option<String>,
    timeout: Duration,
    http: reqwest::blocking::Client,
}

impl GeminiBackend {
    pub fn new(config: &FallbackConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            timeout: Duration::from_secs_f64(config.request_timeout_s),
            http: reqwest::blocking::Client::new(),
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

    fn call(&self, api_key: &str, model: &str, payload: &Value) -> Result<Value> {
        let endpoint = self.endpoint_for_model(model);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(payload)
            .send()
            .with_context(|| format!("request to {model} failed"))?;
        let status = response.status();
        let code = status.as_u16();
        let body = response
            .text()
            .with_context(|| format!("{model} response body read failed"))?;
        if !status.is_success() {
            bail!(
                "{model} request failed (status {code}): {}",
                truncate_text(&body, 512)
            );
        }
        let parsed: Value = serde_json::from_str(&body)
            .with_context(|| format!("{model} returned invalid JSON"))?;
        Ok(parsed)
    }

    /// Scans a generateContent response for an inline image; falls back to
    /// text, an abnormal completion reason, or a block verdict.
    fn reply_from_payload(payload: &Value) -> Reply {
        if let Some(block_reason) = payload
            .get("promptFeedback")
            .and_then(|feedback| feedback.get("blockReason"))
            .and_then(Value::as_str)
        {
            return Reply::Failure(format!("request blocked (blockReason: {block_reason})"));
        }

        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut text_pieces = Vec::new();
        let mut abnormal_finish = None;

        for candidate in &candidates {
            if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
                if reason != "STOP" {
                    abnormal_finish.get_or_insert_with(|| reason.to_string());
                }
            }
            let parts = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if !data.is_empty() {
                    let mime = inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(Value::as_str);
                    match ImageData::from_base64(data, mime) {
                        Ok(image) => return Reply::Image(image),
                        Err(err) => {
                            return Reply::Failure(format!(
                                "inline image decode failed: {err:#}"
                            ))
                        }
                    }
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    if !text.trim().is_empty() {
                        text_pieces.push(text.trim().to_string());
                    }
                }
            }
        }

        if let Some(reason) = abnormal_finish {
            let mut message = format!("generation ended abnormally (finishReason: {reason})");
            if !text_pieces.is_empty() {
                message.push_str(&format!(
                    ": {}",
                    truncate_text(&text_pieces.join(" "), 512)
                ));
            }
            return Reply::Failure(message);
        }
        if !text_pieces.is_empty() {
            return Reply::Text(text_pieces.join("\n"));
        }
        Reply::Failure("model returned an empty response".to_string())
    }
}

impl SynthesisBackend for GeminiBackend {
    fn invoke(&self, model: &str, payload: &Value) -> Reply {
        let Some(api_key) = self.api_key.as_deref() else {
            return Reply::Failure("GEMINI_API_KEY or GOOGLE_API_KEY not set".to_string());
        };
        match self.call(api_key, model, payload) {
            Ok(parsed) => Self::reply_from_payload(&parsed),
            Err(err) => Reply::Failure(with_hint(error_chain_text(&err, 2048))),
        }
    }
}

fn with_hint(message: String) -> String {
    match failure_hint(&message) {
        Some(hint) => format!("{message} ({hint})"),
        None => message,
    }
}

/// Offline backend: renders a deterministic flat-color PNG derived from the
/// payload digest. Lets the CLI and tests exercise the whole fallback
/// machinery without credentials. Listed models fail instead.
pub struct StubBackend {
    failing: BTreeSet<String>,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            failing: BTreeSet::new(),
        }
    }

    pub fn failing(models: impl IntoIterator<Item = String>) -> Self {
        Self {
            failing: models.into_iter().collect(),
        }
    }

    fn render(model: &str, payload: &Value) -> Result<ImageData> {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update(serde_json::to_vec(payload).unwrap_or_default());
        let digest = hasher.finalize();

        let mut canvas = RgbImage::new(64, 64);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb([digest[0], digest[1], digest[2]]);
        }
        let mut buffer = Cursor::new(Vec::new());
        canvas
            .write_to(&mut buffer, image::ImageFormat::Png)
            .context("stub image encode failed")?;
        Ok(ImageData::new(buffer.into_inner(), "image/png"))
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SynthesisBackend for StubBackend {
    fn invoke(&self, model: &str, payload: &Value) -> Reply {
        if self.failing.contains(model) {
            return Reply::Failure(format!("stub failure injected for {model}"));
        }
        match Self::render(model, payload) {
            Ok(image) => Reply::Image(image),
            Err(err) => Reply::Failure(error_chain_text(&err, 512)),
        }
    }
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde_json::json;

    use super::{GeminiBackend, Reply, StubBackend, SynthesisBackend};

    #[test]
    fn inline_image_wins_over_text() {
        let payload = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [
                    { "text": "Here is your image." },
                    { "inlineData": { "mimeType": "image/png", "data": BASE64.encode(b"img") } },
                ]},
            }],
        });
        match GeminiBackend::reply_from_payload(&payload) {
            Reply::Image(image) => {
                assert_eq!(image.bytes(), b"img");
                assert_eq!(image.mime_type(), "image/png");
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn snake_case_inline_data_is_accepted() {
        let payload = json!({
            "candidates": [{
                "content": { "parts": [
                    { "inline_data": { "mime_type": "image/webp", "data": BASE64.encode(b"img") } },
                ]},
            }],
        });
        match GeminiBackend::reply_from_payload(&payload) {
            Reply::Image(image) => assert_eq!(image.mime_type(), "image/webp"),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn text_without_image_is_a_text_reply() {
        let payload = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [{ "text": "I cannot draw that." }] },
            }],
        });
        assert_eq!(
            GeminiBackend::reply_from_payload(&payload),
            Reply::Text("I cannot draw that.".to_string())
        );
    }

    #[test]
    fn abnormal_finish_reason_is_surfaced_verbatim() {
        let payload = json!({
            "candidates": [{
                "finishReason": "SAFETY",
                "content": { "parts": [{ "text": "blocked" }] },
            }],
        });
        match GeminiBackend::reply_from_payload(&payload) {
            Reply::Failure(message) => {
                assert!(message.contains("finishReason: SAFETY"));
                assert!(message.contains("blocked"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn prompt_block_is_a_failure() {
        let payload = json!({
            "promptFeedback": { "blockReason": "PROHIBITED_CONTENT" },
        });
        match GeminiBackend::reply_from_payload(&payload) {
            Reply::Failure(message) => assert!(message.contains("PROHIBITED_CONTENT")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn empty_response_is_a_failure() {
        let payload = json!({ "candidates": [] });
        match GeminiBackend::reply_from_payload(&payload) {
            Reply::Failure(message) => assert!(message.contains("empty response")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn stub_backend_is_deterministic_per_payload() {
        let stub = StubBackend::new();
        let payload = json!({ "contents": [] });
        let first = stub.invoke("model-a", &payload);
        let second = stub.invoke("model-a", &payload);
        assert_eq!(first, second);
        match first {
            Reply::Image(image) => assert_eq!(image.mime_type(), "image/png"),
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn stub_backend_injects_failures() {
        let stub = StubBackend::failing(["model-a".to_string()]);
        match stub.invoke("model-a", &json!({})) {
            Reply::Failure(message) => assert!(message.contains("model-a")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(stub.invoke("model-b", &json!({})), Reply::Image(_)));
    }
}
