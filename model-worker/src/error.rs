// Error types shared by the worker's task handlers and router.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors produced while handling a worker request.
///
/// Configuration errors are raised before any inference call is made.
/// Load and inference failures wrap whatever the inference library reported.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("chunk_length_s ({chunk_length_s}) must be larger than stride_length_s ({stride_length_s})")]
    InvalidChunking {
        chunk_length_s: f32,
        stride_length_s: f32,
    },

    #[error("Audio input is empty")]
    EmptyAudio,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load model '{model}': {cause:#}")]
    ModelLoad { model: String, cause: anyhow::Error },

    #[error("Inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("Invalid message: {0}")]
    Protocol(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn model_load(model: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::ModelLoad {
            model: model.into(),
            cause,
        }
    }

    /// True for errors raised before any call into the inference library.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidChunking { .. } | Self::EmptyAudio | Self::InvalidConfig(_)
        )
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Inference(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_model_load_message_includes_cause_chain() {
        let cause = anyhow!("file not found").context("reading weights");
        let err = WorkerError::model_load("Xenova/whisper-tiny.en", cause);
        let message = err.to_string();

        assert!(message.contains("Xenova/whisper-tiny.en"));
        assert!(message.contains("reading weights"));
        assert!(message.contains("file not found"));
    }

    #[test]
    fn test_configuration_classification() {
        let chunking = WorkerError::InvalidChunking {
            chunk_length_s: 5.0,
            stride_length_s: 5.0,
        };
        assert!(chunking.is_configuration());
        assert!(WorkerError::EmptyAudio.is_configuration());
        assert!(!WorkerError::Inference(anyhow!("boom")).is_configuration());
    }
}
