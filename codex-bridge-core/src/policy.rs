//! Auth-mode inference, model catalogue/resolution, and default injection.
//! None of this talks to a model provider — it only decides which model
//! string and which defaults this gateway hands the upstream CLI.

use crate::session::SessionRecord;
use serde_json::Value;

/// Models that only exist on the API auth mode. Observing any of these in
/// the session store is treated as strong evidence the user is on API auth
/// rather than ChatGPT auth.
const API_ONLY_MODELS: &[&str] = &["gpt-5.2-mini", "gpt-5.2-nano", "o3", "o4-mini"];

const CHATGPT_MODELS: &[&str] = &["gpt-5.2", "gpt-5.2-codex"];
const API_MODELS: &[&str] = &[
    "gpt-5.2",
    "gpt-5.2-codex",
    "gpt-5.2-mini",
    "gpt-5.2-nano",
    "o3",
    "o4-mini",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ChatGpt,
    Api,
}

impl AuthMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthMode::ChatGpt => "chatgpt",
            AuthMode::Api => "api",
        }
    }
}

/// Infers the auth mode from every model ever observed across the session
/// store. A heuristic: treat the result as advisory, not gating — it may be
/// wrong on a fresh store with no sessions yet.
pub fn infer_auth_mode<'a>(observed_models: impl Iterator<Item = &'a str>) -> AuthMode {
    for model in observed_models {
        if API_ONLY_MODELS.contains(&model) {
            return AuthMode::Api;
        }
    }
    AuthMode::ChatGpt
}

/// Deterministic static catalogue for `mode`, extended with any models
/// actually observed in the store (deduplicated, catalogue entries first).
pub fn model_catalogue(mode: AuthMode, observed: &[SessionRecord]) -> Vec<String> {
    let base: &[&str] = match mode {
        AuthMode::ChatGpt => CHATGPT_MODELS,
        AuthMode::Api => API_MODELS,
    };
    let mut catalogue: Vec<String> = base.iter().map(|s| s.to_string()).collect();
    for record in observed {
        if let Some(model) = &record.model {
            if !catalogue.contains(model) {
                catalogue.push(model.clone());
            }
        }
    }
    catalogue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Coding,
    Discussion,
    Research,
}

impl TaskType {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("discussion") => TaskType::Discussion,
            Some("research") => TaskType::Research,
            _ => TaskType::Coding,
        }
    }

    fn default_model(self) -> &'static str {
        match self {
            TaskType::Coding => "gpt-5.2-codex",
            TaskType::Discussion | TaskType::Research => "gpt-5.2",
        }
    }
}

pub struct ModelResolution {
    pub model: String,
    pub warning: Option<String>,
}

/// Resolves the effective model for a call. The catalogue itself is never
/// mutated by user input — an unrecognized request only ever produces a
/// fallback plus a warning, never a new catalogue entry.
pub fn resolve_model(
    requested: Option<&str>,
    task_type: TaskType,
    catalogue: &[String],
) -> ModelResolution {
    match requested {
        None => ModelResolution {
            model: task_type.default_model().to_string(),
            warning: None,
        },
        Some(model) if catalogue.iter().any(|m| m == model) => ModelResolution {
            model: model.to_string(),
            warning: None,
        },
        Some(model) => ModelResolution {
            model: task_type.default_model().to_string(),
            warning: Some(format!(
                "model '{model}' is not in the known catalogue; falling back to '{}'",
                task_type.default_model()
            )),
        },
    }
}

/// Injects `sandbox`/`reasoningEffort` defaults into a `codex` tool-call
/// argument object in place, and rewrites the `reasoningEffort`/
/// `reasoningSummary` shortcuts into the nested `config` object the
/// upstream expects, preserving any config keys the caller already set.
pub fn apply_defaults(args: &mut serde_json::Map<String, Value>) {
    args.entry("sandbox".to_string())
        .or_insert_with(|| Value::String("danger-full-access".to_string()));

    let reasoning_effort = args
        .get("reasoningEffort")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "xhigh".to_string());
    let reasoning_summary = args
        .get("reasoningSummary")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    args.remove("reasoningEffort");
    args.remove("reasoningSummary");

    let config = args
        .entry("config".to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(config_map) = config {
        config_map
            .entry("model_reasoning_effort".to_string())
            .or_insert_with(|| Value::String(reasoning_effort));
        if let Some(summary) = reasoning_summary {
            config_map
                .entry("model_reasoning_summary".to_string())
                .or_insert_with(|| Value::String(summary));
        }
    }
}
