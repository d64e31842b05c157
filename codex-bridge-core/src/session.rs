//! `SessionRecord` is the immutable value this bridge indexes one upstream
//! conversation by. It has two serializations: snake_case on disk (the
//! JSONL log) and camelCase over the wire (tool results, resource reads).
//! `SessionPayload` is that wire projection; the mapping between the two is
//! the only place these two key conventions meet.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One observed upstream conversation. Every field but `name` and
/// `history_entry_count` is write-once, fixed at first observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SessionRecord {
    pub conversation_id: String,
    pub captured_at: f64,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_provider_id: Option<String>,
    #[serde(default)]
    pub approval_policy: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub rollout_path: Option<String>,
    /// Opaque to this crate; preserved verbatim across load/save.
    #[serde(default)]
    pub sandbox_policy: Option<Value>,
    #[serde(default)]
    pub history_log_id: Option<i64>,
    #[serde(default)]
    pub history_entry_count: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SessionRecord {
    pub fn new(conversation_id: impl Into<String>, captured_at: f64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            captured_at,
            model: None,
            model_provider_id: None,
            approval_policy: None,
            cwd: None,
            reasoning_effort: None,
            rollout_path: None,
            sandbox_policy: None,
            history_log_id: None,
            history_entry_count: None,
            name: None,
        }
    }

    pub fn to_payload(&self) -> SessionPayload {
        SessionPayload {
            conversation_id: self.conversation_id.clone(),
            captured_at: self.captured_at,
            model: self.model.clone(),
            model_provider_id: self.model_provider_id.clone(),
            approval_policy: self.approval_policy.clone(),
            cwd: self.cwd.clone(),
            reasoning_effort: self.reasoning_effort.clone(),
            rollout_path: self.rollout_path.clone(),
            sandbox_policy: self.sandbox_policy.clone(),
            history_log_id: self.history_log_id,
            history_entry_count: self.history_entry_count,
            name: self.name.clone(),
        }
    }

    /// Deserialize one disk line, tolerating type-mismatched optional
    /// fields by coercing them to null rather than failing the whole line.
    pub fn from_disk_line(line: &str) -> Option<Self> {
        let mut value: Value = serde_json::from_str(line).ok()?;
        let object = value.as_object_mut()?;
        if !matches!(object.get("conversation_id"), Some(Value::String(_))) {
            return None;
        }
        for key in [
            "model",
            "model_provider_id",
            "approval_policy",
            "cwd",
            "reasoning_effort",
            "rollout_path",
            "name",
        ] {
            if let Some(v) = object.get(key) {
                if !v.is_string() && !v.is_null() {
                    object.insert(key.to_string(), Value::Null);
                }
            }
        }
        for key in ["history_log_id", "history_entry_count"] {
            if let Some(v) = object.get(key) {
                if !v.is_i64() && !v.is_u64() && !v.is_null() {
                    object.insert(key.to_string(), Value::Null);
                }
            }
        }
        if !object
            .get("captured_at")
            .map(|v| v.is_number())
            .unwrap_or(false)
        {
            object.insert("captured_at".to_string(), Value::from(0.0));
        }
        serde_json::from_value(value).ok()
    }

    pub fn to_disk_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Wire-facing view of a `SessionRecord`, camelCase throughout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    pub conversation_id: String,
    pub captured_at: f64,
    pub model: Option<String>,
    pub model_provider_id: Option<String>,
    pub approval_policy: Option<String>,
    pub cwd: Option<String>,
    pub reasoning_effort: Option<String>,
    pub rollout_path: Option<String>,
    pub sandbox_policy: Option<Value>,
    pub history_log_id: Option<i64>,
    pub history_entry_count: Option<i64>,
    pub name: Option<String>,
}
