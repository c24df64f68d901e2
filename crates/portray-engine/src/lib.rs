mod backend;
mod orchestrate;
mod prompt;
mod validate;

pub use backend::{GeminiBackend, Reply, StubBackend, SynthesisBackend};
pub use orchestrate::{Orchestrator, LAST_RESORT_WARNING};
pub use prompt::{identity_lock_request, natural_request, text_only_request};
pub use validate::{validation_request, LikenessValidator};

use std::env;

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Hand-curated fallback order. The 2.0 flash preview sits ahead of the pro
/// preview because it succeeds more often on reference-image requests.
pub const DEFAULT_MODEL_PRIORITY: [&str; 3] = [
    "gemini-2.5-flash-image-preview",
    "gemini-2.0-flash-preview-image-generation",
    "gemini-2.5-pro-image-preview",
];

pub const DEFAULT_LAST_RESORT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_VALIDATION_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_REQUEST_TIMEOUT_S: f64 = 90.0;

/// Resolved once at process start and injected into the orchestrator; the
/// fallback sequence is deterministic for a fixed configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    pub model_priority: Vec<String>,
    pub last_resort_model: String,
    pub validation_model: String,
    pub api_base: String,
    pub request_timeout_s: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            model_priority: DEFAULT_MODEL_PRIORITY
                .iter()
                .map(|model| (*model).to_string())
                .collect(),
            last_resort_model: DEFAULT_LAST_RESORT_MODEL.to_string(),
            validation_model: DEFAULT_VALIDATION_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_s: DEFAULT_REQUEST_TIMEOUT_S,
        }
    }
}

impl FallbackConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(raw) = non_empty_env("PORTRAY_MODEL_PRIORITY") {
            let models = parse_model_list(&raw);
            if !models.is_empty() {
                config.model_priority = models;
            }
        }
        if let Some(model) = non_empty_env("PORTRAY_LAST_RESORT_MODEL") {
            config.last_resort_model = model;
        }
        if let Some(model) = non_empty_env("PORTRAY_VALIDATION_MODEL") {
            config.validation_model = model;
        }
        if let Some(base) = non_empty_env("GEMINI_API_BASE") {
            config.api_base = base.trim_end_matches('/').to_string();
        }
        config
    }
}

pub(crate) fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

#[cfg(test)]
mod tests {
    use super::{parse_model_list, truncate_text, FallbackConfig};

    #[test]
    fn default_config_has_distinct_last_resort() {
        let config = FallbackConfig::default();
        assert_eq!(config.model_priority.len(), 3);
        assert!(!config
            .model_priority
            .contains(&config.last_resort_model));
    }

    #[test]
    fn model_list_parsing_skips_blanks() {
        assert_eq!(
            parse_model_list(" model-a , ,model-b,"),
            vec!["model-a".to_string(), "model-b".to_string()]
        );
        assert!(parse_model_list("  ,  ").is_empty());
    }

    #[test]
    fn truncation_appends_ellipsis_only_when_needed() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("0123456789", 4), "0123…");
    }
}
