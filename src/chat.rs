//! Chat messages and completion responses

use serde::{Deserialize, Serialize};

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Result status of a completion call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    NotInitialized,
    InvalidRequest,
    Timeout,
    /// Device, capacity or other runtime failure
    InternalError,
}

impl Status {
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }
}

/// Why a choice stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token or a stop sequence
    Stop,
    /// Token budget or context window exhausted
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

/// One generated alternative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ChatMessage,
    /// Generated token ids (item ids for token completions)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_ids: Vec<u32>,
    pub finish_reason: FinishReason,
}

/// Token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    /// Prompt tokens served from the generation cache
    pub cached_tokens: usize,
}

/// Completion result, owned by the caller once returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub status: Status,
    /// Human-readable cause for non-success statuses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

impl Response {
    /// A successful response; `choices` must be non-empty.
    pub fn success(model: impl Into<String>, choices: Vec<Choice>, usage: Usage) -> Self {
        debug_assert!(!choices.is_empty());
        Self {
            id: new_response_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            status: Status::Success,
            error: None,
            choices,
            usage,
        }
    }

    /// A failed response. Failed responses never carry choices.
    pub fn failure(model: impl Into<String>, status: Status, error: impl Into<String>) -> Self {
        debug_assert!(!status.is_success());
        Self {
            id: new_response_id(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            status,
            error: Some(error.into()),
            choices: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Text of the first choice, if any
    pub fn text(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

fn new_response_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}
