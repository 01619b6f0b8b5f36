// Worker message protocol: typed inbound requests and outbound status messages.
//
// Chat control messages are discriminated by `type`, task requests by `task`.
// Every outbound message carries `status`, `task` and a payload field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Result, WorkerError};
use crate::inference::ProgressCallback;

// ============================================================================
// Inbound Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoadRequest {
    pub model_id: Option<String>,
    pub dtype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatCommand {
    Load(LoadRequest),
    Generate(Vec<ChatMessage>),
    Interrupt,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeechRequest {
    pub audio: Vec<f32>,
    pub model: String,
    #[serde(default)]
    pub multilingual: bool,
    #[serde(default)]
    pub quantized: bool,
    #[serde(default)]
    pub subtask: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummarizationRequest {
    pub text: String,
    pub model: String,
    pub max_length: usize,
    pub min_length: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "task")]
pub enum TaskRequest {
    #[serde(rename = "automatic-speech-recognition")]
    SpeechRecognition(SpeechRequest),
    #[serde(rename = "summarization")]
    Summarization(SummarizationRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    Chat(ChatCommand),
    Task(TaskRequest),
}

impl InboundMessage {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(WorkerError::from)
    }
}

// ============================================================================
// Outbound Messages
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Loading,
    Ready,
    Start,
    Update,
    Complete,
    Error,
    // Model download / load progress, as reported by the inference library
    Initiate,
    Download,
    Progress,
    Done,
    // Host-level replies
    Pong,
    Goodbye,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    #[serde(rename = "text-generation")]
    TextGeneration,
    #[serde(rename = "automatic-speech-recognition")]
    SpeechRecognition,
    #[serde(rename = "summarization")]
    Summarization,
    #[serde(rename = "worker")]
    Worker,
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Data(Value),
    Output(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusMessage {
    pub status: Status,
    pub task: Task,
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tps: Option<f64>,
    #[serde(rename = "numTokens", skip_serializing_if = "Option::is_none")]
    pub num_tokens: Option<usize>,
}

impl StatusMessage {
    pub fn data(status: Status, task: Task, data: Value) -> Self {
        Self {
            status,
            task,
            payload: Payload::Data(data),
            tps: None,
            num_tokens: None,
        }
    }

    pub fn output(status: Status, task: Task, output: Value) -> Self {
        Self {
            status,
            task,
            payload: Payload::Output(output),
            tps: None,
            num_tokens: None,
        }
    }
}

/// Load progress reported by the inference library. Forwarded with its own
/// fields untouched; only `task` is added on the way out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    Status(StatusMessage),
    Progress {
        task: Task,
        #[serde(flatten)]
        event: ProgressEvent,
    },
}

impl OutboundMessage {
    pub fn status(&self) -> Status {
        match self {
            Self::Status(msg) => msg.status,
            Self::Progress { event, .. } => event.status,
        }
    }

    pub fn task(&self) -> Task {
        match self {
            Self::Status(msg) => msg.task,
            Self::Progress { task, .. } => *task,
        }
    }
}

impl From<StatusMessage> for OutboundMessage {
    fn from(msg: StatusMessage) -> Self {
        Self::Status(msg)
    }
}

// ============================================================================
// Emitter
// ============================================================================

/// Sending half of the outbound message stream. Cheap to clone; the host owns
/// the receiving half and delivers messages in the order they were emitted.
#[derive(Debug, Clone)]
pub struct Emitter {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Emitter {
    pub fn new(tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, message: impl Into<OutboundMessage>) {
        if self.tx.send(message.into()).is_err() {
            log::warn!("Outbound channel closed, dropping message");
        }
    }

    pub fn send_data(&self, status: Status, task: Task, data: Value) {
        self.emit(StatusMessage::data(status, task, data));
    }

    pub fn send_error(&self, task: Task, err: &WorkerError) {
        self.send_data(Status::Error, task, Value::String(err.to_string()));
    }

    /// Progress callback handed to the inference library while a model loads
    pub fn progress_callback(&self, task: Task) -> ProgressCallback {
        let emitter = self.clone();
        std::sync::Arc::new(move |event: ProgressEvent| {
            emitter.emit(OutboundMessage::Progress { task, event });
        })
    }
}
