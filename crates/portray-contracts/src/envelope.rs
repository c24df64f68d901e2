use serde_json::{Map, Value};

use crate::result::{SynthesisFailure, SynthesisResult, ValidationReport};

/// Uniform success envelope consumed by the calling web handler.
pub fn synthesis_success(result: &SynthesisResult) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(true));
    out.insert(
        "image".to_string(),
        Value::String(result.image.to_data_uri()),
    );
    out.insert(
        "model_used".to_string(),
        Value::String(result.model_used.clone()),
    );
    out.insert(
        "strategy_used".to_string(),
        Value::String(result.strategy_used.as_str().to_string()),
    );
    out.insert(
        "likeness_optimized".to_string(),
        Value::Bool(result.likeness_optimized),
    );
    if let Some(warning) = result.warning.as_ref() {
        out.insert("warning".to_string(), Value::String(warning.clone()));
    }
    out
}

/// Exhaustion envelope: a single human-readable recommendation plus the
/// per-model failure map for operators, in fallback order.
pub fn synthesis_failure(failure: &SynthesisFailure) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert("success".to_string(), Value::Bool(false));
    // Display renders the recommendation plus one line per tried model, so
    // the error string alone identifies every model that was attempted.
    out.insert("error".to_string(), Value::String(failure.to_string()));
    let mut failures = Map::new();
    for (model, reason) in &failure.failures {
        failures.insert(model.clone(), Value::String(reason.clone()));
    }
    out.insert("failures".to_string(), Value::Object(failures));
    out
}

pub fn validation_report(report: &ValidationReport) -> Map<String, Value> {
    let mut out = Map::new();
    out.insert(
        "validation".to_string(),
        report
            .validation
            .as_ref()
            .and_then(|verdict| serde_json::to_value(verdict).ok())
            .unwrap_or(Value::Null),
    );
    if let Some(model) = report.model_used.as_ref() {
        out.insert("model_used".to_string(), Value::String(model.clone()));
    }
    if report.skipped {
        out.insert("skipped".to_string(), Value::Bool(true));
    }
    if let Some(raw) = report.raw_text.as_ref() {
        out.insert("raw_text".to_string(), Value::String(raw.clone()));
    }
    out
}
