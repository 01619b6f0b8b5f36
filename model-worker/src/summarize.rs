use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::cache::SummarizationCache;
use crate::error::{Result, WorkerError};
use crate::inference::{
    InferenceBackend, SummarizationModelKey, SummarizationPipeline, SummarizeOptions,
};
use crate::protocol::{Emitter, SummarizationRequest, Task};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub summary_text: String,
}

/// Keep at most `max_chars` characters of `text`, cutting on a char boundary
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Summarize one request. Errors are reported as an `error` message and yield
/// `None`.
pub async fn summarize(
    backend: &dyn InferenceBackend,
    cache: &SummarizationCache,
    request: &SummarizationRequest,
    max_chars: usize,
    emitter: &Emitter,
) -> Option<Summary> {
    match run_summarization(backend, cache, request, max_chars, emitter).await {
        Ok(summary) => Some(summary),
        Err(e) => {
            if e.is_configuration() {
                warn!("Rejected summarization request: {}", e);
            } else {
                error!("Summarization failed: {}", e);
            }
            emitter.send_error(Task::Summarization, &e);
            None
        }
    }
}

async fn run_summarization(
    backend: &dyn InferenceBackend,
    cache: &SummarizationCache,
    request: &SummarizationRequest,
    max_chars: usize,
    emitter: &Emitter,
) -> Result<Summary> {
    let key = SummarizationModelKey {
        model: request.model.clone(),
    };
    let progress = emitter.progress_callback(Task::Summarization);
    let pipeline: Arc<dyn SummarizationPipeline> = cache
        .get_instance(&key, || async {
            backend
                .load_summarization_pipeline(&key, progress)
                .await
                .map_err(|e| WorkerError::model_load(key.model.clone(), e))
        })
        .await?;

    let text = truncate_chars(&request.text, max_chars);
    if text.len() < request.text.len() {
        info!(
            "Truncated summarization input from {} to {} characters",
            request.text.chars().count(),
            max_chars
        );
    }

    let options = SummarizeOptions {
        max_new_tokens: request.max_length,
        min_length: request.min_length,
        do_sample: false,
    };
    let summary_text = pipeline
        .summarize(text, &options)
        .await
        .map_err(WorkerError::Inference)?;

    info!("Summary generated: {} chars", summary_text.len());
    Ok(Summary { summary_text })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;
    use crate::testing::{drain, FakeBackend};

    fn request(text: String) -> SummarizationRequest {
        SummarizationRequest {
            text,
            model: "Xenova/distilbart-cnn-6-6".to_string(),
            max_length: 120,
            min_length: 30,
        }
    }

    #[test]
    fn test_truncate_ascii() {
        let text = "a".repeat(5000);
        assert_eq!(truncate_chars(&text, 4096).len(), 4096);
        assert_eq!(truncate_chars("short", 4096), "short");
    }

    #[test]
    fn test_truncate_multibyte_on_char_boundary() {
        let text = "é".repeat(10);
        let cut = truncate_chars(&text, 4);
        assert_eq!(cut.chars().count(), 4);
        assert_eq!(cut.len(), 8);
    }

    #[tokio::test]
    async fn test_input_truncated_before_pipeline() {
        let backend = FakeBackend::new();
        let cache = SummarizationCache::new("summarization");
        let (emitter, _rx) = Emitter::channel();

        let summary = summarize(&backend, &cache, &request("x".repeat(5000)), 4096, &emitter)
            .await
            .expect("summary");

        assert_eq!(backend.summarized_lengths(), vec![4096]);
        assert!(summary.summary_text.contains("4096"));
        assert_eq!(
            backend.summarize_options(),
            vec![SummarizeOptions {
                max_new_tokens: 120,
                min_length: 30,
                do_sample: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_failure_reports_error() {
        let backend = FakeBackend::failing();
        let cache = SummarizationCache::new("summarization");
        let (emitter, mut rx) = Emitter::channel();

        let req = request("text".to_string());
        let result = summarize(&backend, &cache, &req, 4096, &emitter).await;

        assert!(result.is_none());
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status(), Status::Error);
        assert_eq!(messages[0].task(), Task::Summarization);
    }
}
