//! Wire schema for task messages and the status records sent back.
//!
//! A task arrives as `{"type": "...", "payload": {...}}`.  The envelope is
//! decoded first; the payload is then decoded with the schema that belongs to
//! `type`.  Unknown types are rejected explicitly rather than defaulted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::FileState;

// ── Task type ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AddDoc,
    UpdateSample,
    UpdatePipeline,
    Chat,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [
        TaskType::AddDoc,
        TaskType::UpdateSample,
        TaskType::UpdatePipeline,
        TaskType::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::AddDoc => "add_doc",
            TaskType::UpdateSample => "update_sample",
            TaskType::UpdatePipeline => "update_pipeline",
            TaskType::Chat => "chat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Status code ──────────────────────────────────────────────────────────────

/// Closed set of codes carried by [`TaskStatus`] and chat replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Success,
    Failed,
    WorkInProgress,
    BadParameter,
    InternalError,
}

impl StatusCode {
    /// Default human-readable text for the code.
    pub fn describe(&self) -> &'static str {
        match self {
            StatusCode::Success => "success",
            StatusCode::Failed => "fail",
            StatusCode::WorkInProgress => "not finish",
            StatusCode::BadParameter => "bad parameter",
            StatusCode::InternalError => "internal error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatusCode::WorkInProgress)
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AddDocPayload {
    #[serde(default)]
    pub name: String,
    pub feature_store_id: String,
    #[serde(default)]
    pub path_list: Vec<String>,
    /// Optional base directory that relative entries in `path_list` are
    /// joined onto.
    #[serde(default)]
    pub file_abs_base: Option<String>,
    /// Optional named-entity vocabulary; when non-empty the store's
    /// entity index is rebuilt from the ingested chunks.
    #[serde(default)]
    pub entities: Vec<String>,
}

impl AddDocPayload {
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        self.path_list
            .iter()
            .map(|p| {
                let path = PathBuf::from(p);
                match &self.file_abs_base {
                    Some(base) if path.is_relative() => PathBuf::from(base).join(path),
                    _ => path,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSamplePayload {
    #[serde(default)]
    pub name: String,
    pub feature_store_id: String,
    /// JSON file holding an array of on-topic example sentences.
    #[serde(default)]
    pub positive_path: Option<String>,
    /// JSON file holding an array of off-topic example sentences.
    #[serde(default)]
    pub negative_path: Option<String>,
    /// Inline examples; take precedence over the files when non-empty.
    #[serde(default)]
    pub positive: Vec<String>,
    #[serde(default)]
    pub negative: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePipelinePayload {
    #[serde(default)]
    pub name: String,
    pub feature_store_id: String,
    #[serde(default)]
    pub web_search_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatHistoryItem {
    /// `0` for the user, `1` for the assistant.
    pub sender: i64,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatPayload {
    pub query_id: String,
    pub feature_store_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub history: Vec<ChatHistoryItem>,
}

// ── Task ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Task {
    AddDoc(AddDocPayload),
    UpdateSample(UpdateSamplePayload),
    UpdatePipeline(UpdatePipelinePayload),
    Chat(ChatPayload),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed task message: {0}")]
    Malformed(String),

    #[error("unknown task type '{0}'")]
    UnknownType(String),

    /// The type is known but the payload does not match its schema.
    /// `feature_store_id` is recovered when present so a status can still
    /// be addressed to the producer.
    #[error("bad {task_type} payload: {reason}")]
    BadPayload {
        task_type: TaskType,
        feature_store_id: Option<String>,
        reason: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    payload: Value,
}

impl Task {
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope =
            serde_json::from_str(raw).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let task_type = TaskType::parse(&envelope.task_type)
            .ok_or_else(|| DecodeError::UnknownType(envelope.task_type.clone()))?;

        let store_id = envelope
            .payload
            .get("feature_store_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let bad = |e: serde_json::Error| DecodeError::BadPayload {
            task_type,
            feature_store_id: store_id.clone(),
            reason: e.to_string(),
        };

        let payload = envelope.payload;
        Ok(match task_type {
            TaskType::AddDoc => Task::AddDoc(serde_json::from_value(payload).map_err(bad)?),
            TaskType::UpdateSample => {
                Task::UpdateSample(serde_json::from_value(payload).map_err(bad)?)
            }
            TaskType::UpdatePipeline => {
                Task::UpdatePipeline(serde_json::from_value(payload).map_err(bad)?)
            }
            TaskType::Chat => Task::Chat(serde_json::from_value(payload).map_err(bad)?),
        })
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            Task::AddDoc(_) => TaskType::AddDoc,
            Task::UpdateSample(_) => TaskType::UpdateSample,
            Task::UpdatePipeline(_) => TaskType::UpdatePipeline,
            Task::Chat(_) => TaskType::Chat,
        }
    }

    pub fn feature_store_id(&self) -> &str {
        match self {
            Task::AddDoc(p) => &p.feature_store_id,
            Task::UpdateSample(p) => &p.feature_store_id,
            Task::UpdatePipeline(p) => &p.feature_store_id,
            Task::Chat(p) => &p.feature_store_id,
        }
    }
}

// ── Responses ────────────────────────────────────────────────────────────────

/// Status record pushed to the task response queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskStatus {
    pub feature_store_id: String,
    pub code: StatusCode,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_state: Vec<FileState>,
}

impl TaskStatus {
    pub fn in_progress(feature_store_id: &str, task_type: TaskType) -> Self {
        Self {
            feature_store_id: feature_store_id.to_string(),
            code: StatusCode::WorkInProgress,
            task_type,
            status: StatusCode::WorkInProgress.describe().to_string(),
            files_state: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub code: StatusCode,
    pub state: String,
    pub text: String,
    pub references: Vec<String>,
}

/// Record pushed to the chat response queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatResponse {
    pub feature_store_id: String,
    pub query_id: String,
    pub response: ChatReply,
}
