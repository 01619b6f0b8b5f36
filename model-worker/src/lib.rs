// Background model worker: routes chat, speech recognition and summarization
// requests to an inference backend and streams status messages back.

pub mod cache;
pub mod chat;
pub mod chunking;
pub mod config;
pub mod error;
pub mod inference;
pub mod protocol;
pub mod router;
pub mod speech;
pub mod stopping;
pub mod summarize;

#[cfg(test)]
mod testing;

pub use cache::{ModelCache, ModelCaches};
pub use chat::{ChatSession, SessionState};
pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use inference::InferenceBackend;
pub use protocol::{Emitter, InboundMessage, OutboundMessage, Status, StatusMessage, Task};
pub use router::{InFlight, MessageRouter, Work};
