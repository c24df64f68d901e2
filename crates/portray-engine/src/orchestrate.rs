use indexmap::IndexMap;
use portray_contracts::events::{EventLog, EventPayload};
use portray_contracts::request::SynthesisRequest;
use portray_contracts::result::{Strategy, SynthesisAttempt, SynthesisFailure, SynthesisResult};
use serde_json::{json, Value};

use crate::backend::{Reply, SynthesisBackend};
use crate::{prompt, truncate_text, FallbackConfig};

pub const LAST_RESORT_WARNING: &str =
    "Reference photos were not used for this image; likeness may not be preserved.";

/// Best-effort diagnostics: ordered substring rules evaluated over the
/// collected error text, first match wins. When several failure categories
/// co-occur the hint reflects whichever rule matched first.
const FAILURE_HINTS: &[(&[&str], &str)] = &[
    (
        &[
            "api key not valid",
            "api_key_invalid",
            "invalid api key",
            "unauthenticated",
            "api key expired",
            "status 401",
        ],
        "check that GEMINI_API_KEY or GOOGLE_API_KEY holds a valid key",
    ),
    (
        &[
            "permission_denied",
            "permission denied",
            "not_found",
            "not found",
            "status 403",
            "status 404",
        ],
        "verify the configured models are enabled for this API key",
    ),
    (
        &[
            "resource_exhausted",
            "quota",
            "rate limit",
            "status 429",
        ],
        "request quota is exhausted; retry later",
    ),
];

pub(crate) fn failure_hint(text: &str) -> Option<&'static str> {
    let lowered = text.to_ascii_lowercase();
    for (patterns, hint) in FAILURE_HINTS {
        if patterns.iter().any(|pattern| lowered.contains(pattern)) {
            return Some(hint);
        }
    }
    None
}

/// Sequential fallback over a fixed model list: multi-turn then single-turn
/// per model, then a text-only last resort. The first image obtained
/// anywhere in the sequence is returned immediately; each `(model,
/// strategy)` pair is attempted exactly once per call.
pub struct Orchestrator<'a, B: SynthesisBackend> {
    config: &'a FallbackConfig,
    backend: &'a B,
    events: Option<&'a EventLog>,
}

impl<'a, B: SynthesisBackend> Orchestrator<'a, B> {
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

    pub fn synthesize(
        &self,
        request: &SynthesisRequest,
    ) -> Result<SynthesisResult, SynthesisFailure> {
        self.emit(
            "synthesis_started",
            json!({
                "images": request.all_images().len(),
                "models": self.config.model_priority,
                "last_resort": self.config.last_resort_model,
            }),
        );

        let mut attempts: Vec<SynthesisAttempt> = Vec::new();

        // Without a single usable photo neither image-bearing strategy has
        // anything to anchor, so the model loop is skipped entirely.
        if request.has_reference_material() {
            let identity_lock = prompt::identity_lock_request(request);
            let natural = prompt::natural_request(request);
            for model in &self.config.model_priority {
                for (strategy, payload) in [
                    (Strategy::MultiTurnIdentityLock, &identity_lock),
                    (Strategy::SingleTurnNatural, &natural),
                ] {
                    if let Some(result) = self.attempt(model, strategy, payload, &mut attempts) {
                        return Ok(result);
                    }
                }
            }
        }

        let text_only = prompt::text_only_request(request);
        if let Some(result) = self.attempt(
            &self.config.last_resort_model,
            Strategy::TextOnlyFallback,
            &text_only,
            &mut attempts,
        ) {
            return Ok(result);
        }

        let failures = collect_failures(&attempts);
        let message = exhaustion_message(&failures);
        self.emit(
            "fallback_exhausted",
            json!({
                "message": message,
                "failures": failures,
            }),
        );
        Err(SynthesisFailure { message, failures })
    }

    fn attempt(
        &self,
        model: &str,
        strategy: Strategy,
        payload: &Value,
        attempts: &mut Vec<SynthesisAttempt>,
    ) -> Option<SynthesisResult> {
        self.emit(
            "attempt_started",
            json!({ "model": model, "strategy": strategy.as_str() }),
        );

        let error = match self.backend.invoke(model, payload) {
            Reply::Image(image) => {
                attempts.push(SynthesisAttempt {
                    model: model.to_string(),
                    strategy,
                    succeeded: true,
                    error: None,
                });
                self.emit(
                    "attempt_succeeded",
                    json!({
                        "model": model,
                        "strategy": strategy.as_str(),
                        "attempts": attempts.len(),
                    }),
                );
                let likeness_optimized = strategy != Strategy::TextOnlyFallback;
                return Some(SynthesisResult {
                    image,
                    model_used: model.to_string(),
                    strategy_used: strategy,
                    likeness_optimized,
                    warning: (!likeness_optimized).then(|| LAST_RESORT_WARNING.to_string()),
                });
            }
            Reply::Text(text) => format!(
                "model returned text instead of an image: {}",
                truncate_text(&text, 512)
            ),
            Reply::Failure(reason) => reason,
        };

        attempts.push(SynthesisAttempt {
            model: model.to_string(),
            strategy,
            succeeded: false,
            error: Some(error.clone()),
        });
        self.emit(
            "attempt_failed",
            json!({
                "model": model,
                "strategy": strategy.as_str(),
                "error": error,
            }),
        );
        None
    }

    fn emit(&self, event_type: &str, payload: Value) {
        // The event trail is diagnostics, never load-bearing: a failed
        // write must not fail the synthesis call.
        if let Some(events) = self.events {
            let payload = payload
                .as_object()
                .cloned()
                .unwrap_or_else(EventPayload::new);
            let _ = events.emit(event_type, payload);
        }
    }
}

/// One entry per tried model, in fallback order; both strategy errors for a
/// model fold into its entry.
fn collect_failures(attempts: &[SynthesisAttempt]) -> IndexMap<String, String> {
    let mut failures: IndexMap<String, String> = IndexMap::new();
    for attempt in attempts {
        let Some(error) = attempt.error.as_deref() else {
            continue;
        };
        let labeled = format!("{}: {}", attempt.strategy.as_str(), error);
        match failures.get_mut(&attempt.model) {
            Some(existing) => {
                existing.push_str(" | ");
                existing.push_str(&labeled);
            }
            None => {
                failures.insert(attempt.model.clone(), labeled);
            }
        }
    }
    failures
}

fn exhaustion_message(failures: &IndexMap<String, String>) -> String {
    let combined = failures
        .values()
        .map(String::as_str)
        .collect::<Vec<&str>>()
        .join(" | ");
    let hint = failure_hint(&combined)
        .unwrap_or("every configured model declined this request; inspect the per-model failures");
    let models = failures
        .keys()
        .map(String::as_str)
        .collect::<Vec<&str>>()
        .join(", ");
    format!("image synthesis failed after trying {models}: {hint}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use portray_contracts::events::EventLog;
    use portray_contracts::images::ImageData;
    use portray_contracts::request::SynthesisRequest;
    use portray_contracts::result::Strategy;
    use serde_json::Value;

    use crate::backend::{Reply, SynthesisBackend};
    use crate::FallbackConfig;

    use super::{failure_hint, Orchestrator, LAST_RESORT_WARNING};

    enum Script {
        Image,
        Text(&'static str),
        Fail(&'static str),
        FailMultiTurnOnly,
    }

    struct FakeBackend {
        scripts: Vec<(String, Script)>,
        calls: Mutex<Vec<(String, usize)>>,
    }

    impl FakeBackend {
        fn new(scripts: Vec<(&str, Script)>) -> Self {
            Self {
                scripts: scripts
                    .into_iter()
                    .map(|(model, script)| (model.to_string(), script))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, usize)> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }

        fn models_called(&self) -> Vec<String> {
            self.calls().into_iter().map(|(model, _)| model).collect()
        }
    }

    fn turn_count(payload: &Value) -> usize {
        payload["contents"].as_array().map(Vec::len).unwrap_or(0)
    }

    impl SynthesisBackend for FakeBackend {
        fn invoke(&self, model: &str, payload: &Value) -> Reply {
            let turns = turn_count(payload);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((model.to_string(), turns));
            }
            let script = self
                .scripts
                .iter()
                .find(|(name, _)| name == model)
                .map(|(_, script)| script);
            match script {
                Some(Script::Image) => {
                    Reply::Image(ImageData::new(b"fake".to_vec(), "image/png"))
                }
                Some(Script::Text(text)) => Reply::Text((*text).to_string()),
                Some(Script::Fail(reason)) => Reply::Failure((*reason).to_string()),
                Some(Script::FailMultiTurnOnly) => {
                    if turns > 1 {
                        Reply::Failure("multi-turn form rejected".to_string())
                    } else {
                        Reply::Image(ImageData::new(b"fake".to_vec(), "image/png"))
                    }
                }
                None => Reply::Failure(format!("unscripted model {model}")),
            }
        }
    }

    fn test_config() -> FallbackConfig {
        FallbackConfig {
            model_priority: vec![
                "model-a".to_string(),
                "model-b".to_string(),
                "model-c".to_string(),
            ],
            last_resort_model: "text-model".to_string(),
            validation_model: "vision-model".to_string(),
            api_base: "http://localhost".to_string(),
            request_timeout_s: 5.0,
        }
    }

    fn request_with_base() -> SynthesisRequest {
        let mut request = SynthesisRequest::new("a beach at sunset");
        request.base_image = Some(ImageData::new(b"base".to_vec(), "image/png"));
        request
    }

    #[test]
    fn first_success_short_circuits_everything_else() -> anyhow::Result<()> {
        let config = test_config();
        let backend = FakeBackend::new(vec![("model-a", Script::Image)]);
        let result = Orchestrator::new(&config, &backend)
            .synthesize(&request_with_base())
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;

        assert_eq!(result.model_used, "model-a");
        assert_eq!(result.strategy_used, Strategy::MultiTurnIdentityLock);
        assert!(result.likeness_optimized);
        assert!(result.warning.is_none());
        assert_eq!(backend.calls().len(), 1);
        Ok(())
    }

    #[test]
    fn single_turn_is_tried_on_the_same_model_before_moving_on() -> anyhow::Result<()> {
        let config = test_config();
        let backend = FakeBackend::new(vec![("model-a", Script::FailMultiTurnOnly)]);
        let result = Orchestrator::new(&config, &backend)
            .synthesize(&request_with_base())
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;

        assert_eq!(result.model_used, "model-a");
        assert_eq!(result.strategy_used, Strategy::SingleTurnNatural);
        assert!(result.likeness_optimized);
        assert_eq!(
            backend.calls(),
            vec![("model-a".to_string(), 3), ("model-a".to_string(), 1)]
        );
        Ok(())
    }

    #[test]
    fn zero_images_reaches_only_the_last_resort() -> anyhow::Result<()> {
        let config = test_config();
        let backend = FakeBackend::new(vec![("text-model", Script::Image)]);
        let result = Orchestrator::new(&config, &backend)
            .synthesize(&SynthesisRequest::new("a beach at sunset"))
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;

        assert_eq!(backend.models_called(), vec!["text-model".to_string()]);
        assert_eq!(result.model_used, "text-model");
        assert_eq!(result.strategy_used, Strategy::TextOnlyFallback);
        assert!(!result.likeness_optimized);
        assert_eq!(result.warning.as_deref(), Some(LAST_RESORT_WARNING));
        Ok(())
    }

    #[test]
    fn exhaustion_error_names_every_model_including_last_resort() {
        let config = test_config();
        let backend = FakeBackend::new(vec![
            ("model-a", Script::Fail("status 500")),
            ("model-b", Script::Text("sorry, I can only describe it")),
            ("model-c", Script::Fail("status 500")),
            ("text-model", Script::Fail("status 500")),
        ]);
        let failure = Orchestrator::new(&config, &backend)
            .synthesize(&request_with_base())
            .expect_err("all models fail");

        let keys: Vec<&String> = failure.failures.keys().collect();
        assert_eq!(keys, vec!["model-a", "model-b", "model-c", "text-model"]);
        let rendered = failure.to_string();
        for model in ["model-a", "model-b", "model-c", "text-model"] {
            assert!(rendered.contains(model), "missing {model} in {rendered}");
        }
        assert!(failure.failures["model-b"].contains("text instead of an image"));
        assert!(failure.failures["model-a"].contains("multi_turn_identity_lock"));
        assert!(failure.failures["model-a"].contains("single_turn_natural"));
        // Seven attempts: two strategies per listed model plus the last resort.
        assert_eq!(backend.calls().len(), 7);
    }

    #[test]
    fn quota_failures_classify_to_a_retry_hint() {
        let config = test_config();
        let backend = FakeBackend::new(vec![
            ("model-a", Script::Fail("status 429: RESOURCE_EXHAUSTED")),
            ("model-b", Script::Fail("status 429: RESOURCE_EXHAUSTED")),
            ("model-c", Script::Fail("status 429: RESOURCE_EXHAUSTED")),
            ("text-model", Script::Fail("status 429: RESOURCE_EXHAUSTED")),
        ]);
        let failure = Orchestrator::new(&config, &backend)
            .synthesize(&request_with_base())
            .expect_err("all models fail");
        assert!(failure.message.contains("retry later"));
    }

    #[test]
    fn classification_rules_are_ordered_and_best_effort() {
        assert_eq!(
            failure_hint("API key not valid. Please pass a valid API key."),
            Some("check that GEMINI_API_KEY or GOOGLE_API_KEY holds a valid key")
        );
        assert_eq!(
            failure_hint("models/x is not found for API version v1beta"),
            Some("verify the configured models are enabled for this API key")
        );
        assert_eq!(
            failure_hint("RESOURCE_EXHAUSTED: quota exceeded"),
            Some("request quota is exhausted; retry later")
        );
        // Credential wording wins over quota wording when both co-occur.
        assert_eq!(
            failure_hint("api_key_invalid while checking quota"),
            Some("check that GEMINI_API_KEY or GOOGLE_API_KEY holds a valid key")
        );
        assert_eq!(failure_hint("connection reset by peer"), None);
    }

    #[test]
    fn event_trail_records_the_attempt_sequence() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let events = EventLog::new(&events_path, "call-1");
        let config = test_config();
        let backend = FakeBackend::new(vec![("model-b", Script::Image)]);

        let result = Orchestrator::new(&config, &backend)
            .with_events(&events)
            .synthesize(&request_with_base())
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;
        assert_eq!(result.model_used, "model-b");

        let raw = std::fs::read_to_string(&events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("synthesis_started"));
        assert_eq!(
            types
                .iter()
                .filter(|event| event.as_str() == "attempt_failed")
                .count(),
            2
        );
        assert_eq!(types.last().map(String::as_str), Some("attempt_succeeded"));
        Ok(())
    }

    #[test]
    fn every_model_strategy_pair_is_attempted_exactly_once() {
        let config = test_config();
        let backend = FakeBackend::new(vec![
            ("model-a", Script::Fail("x")),
            ("model-b", Script::Fail("x")),
            ("model-c", Script::Fail("x")),
            ("text-model", Script::Fail("x")),
        ]);
        let _ = Orchestrator::new(&config, &backend).synthesize(&request_with_base());

        let mut seen = BTreeSet::new();
        for call in backend.calls() {
            assert!(seen.insert(call), "duplicate (model, shape) attempt");
        }
    }
}
