// inference.rs
//
// Ports to the external inference library. The worker only sequences calls
// through these traits; tensor math, tokenization, feature extraction and
// timestamp alignment all live behind them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunking::ChunkRecord;
use crate::protocol::{ChatMessage, ProgressEvent};

pub type ProgressCallback = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// Handles that hold library resources and must be released explicitly
pub trait Disposable {
    fn dispose(&self);
}

impl<T: Disposable + ?Sized> Disposable for Arc<T> {
    fn dispose(&self) {
        (**self).dispose()
    }
}

// ============================================================================
// MODEL KEYS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatModelKey {
    pub model_id: String,
    pub dtype: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeechModelKey {
    /// Fully resolved model name (including any `.en` suffix)
    pub model: String,
    pub quantized: bool,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SummarizationModelKey {
    pub model: String,
}

// ============================================================================
// CHAT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    pub do_sample: bool,
}

/// Events pushed by a streaming generation, in production order
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One more token was produced
    Token,
    /// Decoded text that became final (prompt and special tokens skipped)
    Text(String),
}

pub type StreamSender = mpsc::UnboundedSender<StreamEvent>;

#[async_trait]
pub trait ChatModel: Disposable + Send + Sync {
    /// Render messages through the model's own chat template and tokenize
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<Vec<u32>>;

    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    /// Generate new tokens after `input_ids`. The library checks `stopping`
    /// once per step and ends early once it is cancelled. Returns only the
    /// newly generated token ids.
    async fn generate(
        &self,
        input_ids: &[u32],
        options: &GenerationOptions,
        streamer: Option<&StreamSender>,
        stopping: &CancellationToken,
    ) -> anyhow::Result<Vec<u32>>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> anyhow::Result<String>;
}

// ============================================================================
// SPEECH RECOGNITION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureExtractorConfig {
    pub sampling_rate: u32,
    pub hop_length: usize,
    /// Length in seconds of the extractor's input window
    pub chunk_length: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeechModelConfig {
    pub feature_extractor: FeatureExtractorConfig,
    pub max_source_positions: u32,
}

impl SpeechModelConfig {
    /// Seconds represented by one timestamp token
    pub fn time_precision(&self) -> f32 {
        self.feature_extractor.chunk_length / self.max_source_positions as f32
    }
}

/// Opaque feature tensor produced by the feature extractor
#[derive(Debug, Clone, PartialEq)]
pub struct InputFeatures {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsrGenerateOptions {
    pub num_frames: usize,
    pub language: Option<String>,
    pub task: Option<String>,
    pub return_timestamps: bool,
    pub top_k: u32,
    pub do_sample: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChunkGeneration {
    pub tokens: Vec<u32>,
    pub token_timestamps: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeAsrOptions {
    pub time_precision: f32,
    pub return_timestamps: bool,
    pub force_full_sequences: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub timestamp: (f32, Option<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub text: String,
    pub chunks: Vec<TranscriptSegment>,
}

#[async_trait]
pub trait SpeechPipeline: Disposable + Send + Sync {
    fn config(&self) -> SpeechModelConfig;

    async fn extract_features(&self, samples: &[f32]) -> anyhow::Result<InputFeatures>;

    /// Generate tokens for one chunk. `on_step` receives the first beam's
    /// output token ids after every step.
    async fn generate(
        &self,
        features: &InputFeatures,
        options: &AsrGenerateOptions,
        on_step: &mut (dyn for<'s> FnMut(&'s [u32]) + Send),
    ) -> anyhow::Result<ChunkGeneration>;

    /// Merge per-chunk token sequences into text with timestamps, using the
    /// strides to drop overlapped regions
    fn decode_asr(
        &self,
        chunks: &[ChunkRecord],
        options: &DecodeAsrOptions,
    ) -> anyhow::Result<Transcript>;
}

// ============================================================================
// SUMMARIZATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeOptions {
    pub max_new_tokens: usize,
    pub min_length: usize,
    pub do_sample: bool,
}

#[async_trait]
pub trait SummarizationPipeline: Disposable + Send + Sync {
    async fn summarize(&self, text: &str, options: &SummarizeOptions) -> anyhow::Result<String>;
}

// ============================================================================
// BACKEND
// ============================================================================

/// Entry point of the inference library: creates model handles
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn load_chat_model(
        &self,
        key: &ChatModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn ChatModel>>;

    async fn load_speech_pipeline(
        &self,
        key: &SpeechModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn SpeechPipeline>>;

    async fn load_summarization_pipeline(
        &self,
        key: &SummarizationModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn SummarizationPipeline>>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}
