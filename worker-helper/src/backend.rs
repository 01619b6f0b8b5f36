// Inference backend selection for the helper binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use model_worker::inference::{
    ChatModel, ChatModelKey, InferenceBackend, ProgressCallback, SpeechModelKey, SpeechPipeline,
    SummarizationModelKey, SummarizationPipeline,
};

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub models_dir: Option<PathBuf>,
    pub context_size: u32,
}

/// Build the backend compiled into this binary
pub fn create(options: &BackendOptions) -> Result<Arc<dyn InferenceBackend>> {
    #[cfg(feature = "llama")]
    {
        let engine = crate::llama::LlamaEngine::new(options)?;
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "llama"))]
    {
        if options.models_dir.is_some() {
            log::warn!("A models directory was given but no inference engine is compiled in");
        }
        log::info!("Starting without an inference engine, every model load will fail");
        Ok(Arc::new(UnavailableBackend))
    }
}

/// Find the GGUF file for `model_id`: an explicit path, a file in the models
/// directory, or a hub-style id with `/` flattened to `--`.
pub fn resolve_model_path(models_dir: Option<&Path>, model_id: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(model_id);
    if direct.extension().is_some_and(|ext| ext == "gguf") && direct.is_file() {
        return Some(direct);
    }

    let dir = models_dir?;
    [
        dir.join(model_id),
        dir.join(format!("{}.gguf", model_id)),
        dir.join(format!("{}.gguf", model_id.replace('/', "--"))),
    ]
    .into_iter()
    .find(|candidate| candidate.is_file())
}

// ============================================================================
// No engine
// ============================================================================

/// Backend used when the binary is built without an inference engine
pub struct UnavailableBackend;

fn unavailable(model: &str) -> anyhow::Error {
    anyhow!(
        "no inference engine available for '{}' (rebuild worker-helper with --features llama)",
        model
    )
}

#[async_trait]
impl InferenceBackend for UnavailableBackend {
    async fn load_chat_model(
        &self,
        key: &ChatModelKey,
        _progress: ProgressCallback,
    ) -> Result<Arc<dyn ChatModel>> {
        Err(unavailable(&key.model_id))
    }

    async fn load_speech_pipeline(
        &self,
        key: &SpeechModelKey,
        _progress: ProgressCallback,
    ) -> Result<Arc<dyn SpeechPipeline>> {
        Err(unavailable(&key.model))
    }

    async fn load_summarization_pipeline(
        &self,
        key: &SummarizationModelKey,
        _progress: ProgressCallback,
    ) -> Result<Arc<dyn SummarizationPipeline>> {
        Err(unavailable(&key.model))
    }

    fn backend_name(&self) -> &'static str {
        "unavailable"
    }
}
