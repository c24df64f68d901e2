use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_MIME_TYPE: &str = "image/png";

/// An opaque image payload plus its MIME type.
///
/// Callers hand images over either as self-describing data URIs or as raw
/// base64 with an explicit MIME type; both arrive here as the same
/// `(bytes, mime)` pair, so everything downstream builds identical request
/// payloads regardless of the input form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    bytes: Vec<u8>,
    mime_type: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let mime_type = mime_type.into();
        let mime_type = if mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            mime_type.trim().to_ascii_lowercase()
        };
        Self { bytes, mime_type }
    }

    pub fn from_base64(data: &str, mime_type: Option<&str>) -> Result<Self> {
        let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(cleaned.as_bytes())
            .context("image base64 decode failed")?;
        Ok(Self::new(bytes, mime_type.unwrap_or(DEFAULT_MIME_TYPE)))
    }

    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let trimmed = uri.trim();
        let Some(rest) = trimmed.strip_prefix("data:") else {
            bail!("not a data URI");
        };
        let Some((header, payload)) = rest.split_once(',') else {
            bail!("data URI missing payload separator");
        };
        if !header
            .split(';')
            .any(|token| token.eq_ignore_ascii_case("base64"))
        {
            bail!("data URI is not base64-encoded");
        }
        let mime = header.split(';').next().unwrap_or_default();
        Self::from_base64(payload, Some(mime).filter(|value| !value.is_empty()))
    }

    /// Accepts either a data URI or a bare base64 string.
    pub fn from_payload_string(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            bail!("empty image payload");
        }
        if trimmed.starts_with("data:") {
            return Self::from_data_uri(trimmed);
        }
        Self::from_base64(trimmed, None)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            BASE64.encode(&self.bytes)
        )
    }

    /// Gemini `inlineData` request part.
    pub fn to_inline_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}
