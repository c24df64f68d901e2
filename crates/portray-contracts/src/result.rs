use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::images::ImageData;

/// Prompt-construction shape tried against a backend model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    MultiTurnIdentityLock,
    SingleTurnNatural,
    TextOnlyFallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MultiTurnIdentityLock => "multi_turn_identity_lock",
            Self::SingleTurnNatural => "single_turn_natural",
            Self::TextOnlyFallback => "text_only_fallback",
        }
    }
}

/// One `(model, strategy)` pair tried during a call. Lives only for the
/// duration of that call; never persisted.
#[derive(Debug, Clone)]
pub struct SynthesisAttempt {
    pub model: String,
    pub strategy: Strategy,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// The single image a successful call returns, plus metadata disclosing
/// whether identity preservation was actually honored.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub image: ImageData,
    pub model_used: String,
    pub strategy_used: Strategy,
    pub likeness_optimized: bool,
    pub warning: Option<String>,
}

/// Total exhaustion: every model and strategy failed, last resort included.
/// `failures` preserves fallback order (one entry per tried model).
#[derive(Debug, Clone)]
pub struct SynthesisFailure {
    pub message: String,
    pub failures: IndexMap<String, String>,
}

impl std::fmt::Display for SynthesisFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for (model, reason) in &self.failures {
            write!(f, "\n  {model}: {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SynthesisFailure {}

/// Structured verdict from the likeness validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub likeness_score: f64,
    #[serde(default)]
    pub face_match: bool,
    #[serde(default)]
    pub skin_tone_match: bool,
    #[serde(default)]
    pub age_match: bool,
    #[serde(default)]
    pub body_type_match: bool,
    #[serde(default)]
    pub overall_recognizable: bool,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Validator output wrapper. `validation` is `None` both when the pass was
/// skipped (no references) and when the model's reply could not be parsed;
/// `skipped` and `raw_text` tell those cases apart.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub validation: Option<ValidationResult>,
    pub model_used: Option<String>,
    pub skipped: bool,
    pub raw_text: Option<String>,
}

impl ValidationReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;
    use serde_json::json;

    use super::{Strategy, SynthesisFailure, ValidationReport, ValidationResult};

    #[test]
    fn strategy_names_match_wire_vocabulary() {
        assert_eq!(
            Strategy::MultiTurnIdentityLock.as_str(),
            "multi_turn_identity_lock"
        );
        assert_eq!(Strategy::SingleTurnNatural.as_str(), "single_turn_natural");
        assert_eq!(Strategy::TextOnlyFallback.as_str(), "text_only_fallback");
    }

    #[test]
    fn failure_display_lists_every_model() {
        let mut failures = IndexMap::new();
        failures.insert("model-a".to_string(), "quota exceeded".to_string());
        failures.insert("model-b".to_string(), "safety block".to_string());
        let failure = SynthesisFailure {
            message: "all models failed".to_string(),
            failures,
        };
        let rendered = failure.to_string();
        assert!(rendered.contains("model-a"));
        assert!(rendered.contains("model-b"));
        assert!(rendered.starts_with("all models failed"));
    }

    #[test]
    fn validation_result_tolerates_partial_objects() -> anyhow::Result<()> {
        let parsed: ValidationResult = serde_json::from_value(json!({
            "likeness_score": 0.8,
            "overall_recognizable": true,
        }))?;
        assert_eq!(parsed.likeness_score, 0.8);
        assert!(parsed.overall_recognizable);
        assert!(!parsed.face_match);
        assert!(parsed.issues.is_empty());
        Ok(())
    }

    #[test]
    fn skipped_report_has_no_verdict() {
        let report = ValidationReport::skipped();
        assert!(report.skipped);
        assert!(report.validation.is_none());
        assert!(report.model_used.is_none());
    }
}
