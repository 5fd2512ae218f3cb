//! Inference task and result records exchanged with the reasoning service.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{digest_bytes, IdentityKey, Stage};

/// A message in a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message sender ("system", "user", "assistant").
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A context field that was cut to fit its budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncationNote {
    pub field: String,
    pub original_chars: usize,
    pub kept_chars: usize,
}

/// A self-contained request for one identity key and one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceTask {
    /// Stable id derived from stage, key and prompt.
    pub task_id: String,
    pub key: IdentityKey,
    pub stage: Stage,
    /// Capability the service must provide, e.g. "reasoning".
    pub capability: String,
    pub messages: Vec<Message>,
    /// Submissions made so far.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncations: Vec<TruncationNote>,
}

impl InferenceTask {
    pub fn new(
        key: IdentityKey,
        stage: Stage,
        capability: impl Into<String>,
        messages: Vec<Message>,
        truncations: Vec<TruncationNote>,
    ) -> Self {
        let mut material = format!("{}\n{}\n", stage, key);
        for message in &messages {
            material.push_str(&message.role);
            material.push('\n');
            material.push_str(&message.content);
            material.push('\n');
        }
        let task_id = digest_bytes(material.as_bytes())[..16].to_string();
        Self {
            task_id,
            key,
            stage,
            capability: capability.into(),
            messages,
            attempt: 0,
            truncations,
        }
    }

    pub fn is_truncated(&self) -> bool {
        !self.truncations.is_empty()
    }
}

/// Service output: free text or an already-structured JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultOutput {
    Text(String),
    Structured(Value),
}

impl ResultOutput {
    /// The output as text. Structured values are serialized compactly.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            ResultOutput::Text(text) => Cow::Borrowed(text),
            ResultOutput::Structured(value) => Cow::Owned(value.to_string()),
        }
    }

    /// SHA-256 of the textual form; used to order otherwise equal results.
    pub fn digest(&self) -> String {
        digest_bytes(self.as_text().as_bytes())
    }
}

/// One delivery from the reasoning service. The same key may arrive several
/// times, out of order, with different attempt numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub key: IdentityKey,
    pub stage: Stage,
    pub attempt: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<ResultOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The task's context was truncated before submission.
    #[serde(default)]
    pub truncated: bool,
}

impl InferenceResult {
    pub fn success(task: &InferenceTask, attempt: u32, output: ResultOutput) -> Self {
        Self {
            key: task.key.clone(),
            stage: task.stage,
            attempt,
            success: true,
            output: Some(output),
            error: None,
            truncated: task.is_truncated(),
        }
    }

    pub fn failure(task: &InferenceTask, attempt: u32, error: impl Into<String>) -> Self {
        Self {
            key: task.key.clone(),
            stage: task.stage,
            attempt,
            success: false,
            output: None,
            error: Some(error.into()),
            truncated: task.is_truncated(),
        }
    }

    /// Successful results must carry output.
    pub fn usable_output(&self) -> Option<&ResultOutput> {
        self.output.as_ref().filter(|_| self.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> InferenceTask {
        InferenceTask::new(
            IdentityKey::turn("book", 0, 0, 1, "Bob"),
            Stage::RoleThinking,
            "reasoning",
            vec![Message::system("sys"), Message::user("hi")],
            Vec::new(),
        )
    }

    #[test]
    fn test_task_id_is_stable() {
        let a = task();
        let b = task();
        assert_eq!(a.task_id, b.task_id);
        assert_eq!(a.task_id.len(), 16);

        let other = InferenceTask::new(
            IdentityKey::turn("book", 0, 0, 2, "Bob"),
            Stage::RoleThinking,
            "reasoning",
            a.messages.clone(),
            Vec::new(),
        );
        assert_ne!(a.task_id, other.task_id);
    }

    #[test]
    fn test_result_output_untagged() {
        let text: ResultOutput = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text, ResultOutput::Text("hello".to_string()));
        let structured: ResultOutput = serde_json::from_str(r#"{"a":1}"#).unwrap();
        assert_eq!(structured, ResultOutput::Structured(json!({"a": 1})));
        assert_eq!(structured.as_text(), r#"{"a":1}"#);
    }

    #[test]
    fn test_failure_has_no_usable_output() {
        let t = task();
        let failed = InferenceResult::failure(&t, 2, "timeout");
        assert!(failed.usable_output().is_none());
        let ok = InferenceResult::success(&t, 1, ResultOutput::Text("x".to_string()));
        assert!(ok.usable_output().is_some());
    }

    #[test]
    fn test_result_parses_minimal_line() {
        let line = r#"{"key":{"corpus_unit_id":"book","scene_index":0,"conversation_index":0,"turn_index":1,"participant":"Bob"},"stage":"role_thinking","attempt":1,"success":true,"output":"Hi."}"#;
        let result: InferenceResult = serde_json::from_str(line).unwrap();
        assert!(!result.truncated);
        assert_eq!(result.output, Some(ResultOutput::Text("Hi.".to_string())));
    }
}
