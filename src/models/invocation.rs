use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// `POST /v1/invoke` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub service_name: String,
    pub action: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

impl InvocationRequest {
    pub fn new(service_name: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            service_name: service_name.into(),
            action: action.into(),
            payload: Some(payload),
            stream: false,
        }
    }

    pub fn payload(&self) -> Value {
        self.payload.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }
}

pub type SessionId = Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamOpened {
    pub session_id: SessionId,
}

/// Why a session ended without a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFailure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StreamFailure {
    pub const CANCELLED: &'static str = "cancelled";

    pub fn cancelled() -> Self {
        Self {
            reason: Self::CANCELLED.to_string(),
            message: None,
        }
    }

    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: Some(message.into()),
        }
    }

    /// Failure from an upstream `error` frame whose data is not
    /// `{reason, message?}`.
    pub fn from_upstream(data: Value) -> Self {
        let message = match data {
            Value::String(s) => s,
            Value::Null => "upstream reported an error".to_string(),
            other => other.to_string(),
        };
        Self::new("UpstreamError", message)
    }
}

/// One event on a streaming session, serialized as `{ "type": …, "data": … }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum StreamEvent {
    EarlyResponse(Value),
    Progress(Value),
    /// Usually a text fragment, but any JSON the upstream sends is relayed.
    Token(Value),
    Completion(Value),
    Error(StreamFailure),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completion(_) | StreamEvent::Error(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::EarlyResponse(_) => "early-response",
            StreamEvent::Progress(_) => "progress",
            StreamEvent::Token(_) => "token",
            StreamEvent::Completion(_) => "completion",
            StreamEvent::Error(_) => "error",
        }
    }
}
