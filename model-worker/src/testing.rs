// In-memory inference backend used by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::chunking::ChunkRecord;
use crate::inference::{
    AsrGenerateOptions, ChatModel, ChatModelKey, ChunkGeneration, DecodeAsrOptions, Disposable,
    FeatureExtractorConfig, GenerationOptions, InferenceBackend, InputFeatures, ProgressCallback,
    SpeechModelConfig, SpeechModelKey, SpeechPipeline, StreamEvent, StreamSender,
    SummarizationModelKey, SummarizationPipeline, SummarizeOptions, Transcript, TranscriptSegment,
};
use crate::protocol::{ChatMessage, OutboundMessage, ProgressEvent, Status};

const FIRST_REPLY_TOKEN: u32 = 100;

pub fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    messages
}

fn report(progress: &ProgressCallback, status: Status, name: &str) {
    progress(ProgressEvent {
        status,
        name: Some(name.to_string()),
        file: None,
        progress: None,
        loaded: None,
        total: None,
    });
}

// ============================================================================
// Chat
// ============================================================================

type TokenHook = Box<dyn FnOnce() + Send>;

pub struct FakeChatModel {
    pub reply: Vec<String>,
    pub generate_limits: Mutex<Vec<usize>>,
    pub disposed: AtomicUsize,
    on_token: Mutex<Option<(usize, TokenHook)>>,
}

impl FakeChatModel {
    pub fn new(reply: Vec<String>) -> Self {
        Self {
            reply,
            generate_limits: Mutex::new(Vec::new()),
            disposed: AtomicUsize::new(0),
            on_token: Mutex::new(None),
        }
    }

    /// Run `hook` once, right after the `count`-th token of a generation has
    /// been streamed
    pub fn after_tokens(&self, count: usize, hook: impl FnOnce() + Send + 'static) {
        *self.on_token.lock().unwrap() = Some((count, Box::new(hook)));
    }

    fn fire_hook(&self, produced: usize) {
        let hook = {
            let mut slot = self.on_token.lock().unwrap();
            match slot.as_ref() {
                Some((count, _)) if *count == produced => slot.take(),
                _ => None,
            }
        };
        if let Some((_, hook)) = hook {
            hook();
        }
    }
}

impl Disposable for FakeChatModel {
    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<Vec<u32>> {
        let mut ids: Vec<u32> = messages
            .iter()
            .flat_map(|m| m.content.bytes().map(u32::from))
            .collect();
        if add_generation_prompt {
            ids.push(0);
        }
        Ok(ids)
    }

    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    async fn generate(
        &self,
        _input_ids: &[u32],
        options: &GenerationOptions,
        streamer: Option<&StreamSender>,
        stopping: &CancellationToken,
    ) -> anyhow::Result<Vec<u32>> {
        self.generate_limits
            .lock()
            .unwrap()
            .push(options.max_new_tokens);

        let mut generated = Vec::new();
        for (i, piece) in self.reply.iter().take(options.max_new_tokens).enumerate() {
            if stopping.is_cancelled() {
                break;
            }
            tokio::task::yield_now().await;
            generated.push(FIRST_REPLY_TOKEN + i as u32);
            if let Some(streamer) = streamer {
                let _ = streamer.send(StreamEvent::Token);
                let _ = streamer.send(StreamEvent::Text(piece.clone()));
            }
            self.fire_hook(generated.len());
        }
        Ok(generated)
    }

    fn decode(&self, tokens: &[u32], _skip_special_tokens: bool) -> anyhow::Result<String> {
        tokens
            .iter()
            .map(|t| {
                self.reply
                    .get(t.wrapping_sub(FIRST_REPLY_TOKEN) as usize)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown token {}", t))
            })
            .collect()
    }
}

// ============================================================================
// Speech recognition
// ============================================================================

pub struct FakeSpeechPipeline {
    config: SpeechModelConfig,
    pub extract_calls: AtomicUsize,
    pub num_frames: Mutex<Vec<usize>>,
    pub disposed: AtomicUsize,
}

impl FakeSpeechPipeline {
    pub const STEPS_PER_CHUNK: usize = 3;

    pub fn whisper() -> Self {
        Self {
            config: SpeechModelConfig {
                feature_extractor: FeatureExtractorConfig {
                    sampling_rate: 16_000,
                    hop_length: 160,
                    chunk_length: 30.0,
                },
                max_source_positions: 1500,
            },
            extract_calls: AtomicUsize::new(0),
            num_frames: Mutex::new(Vec::new()),
            disposed: AtomicUsize::new(0),
        }
    }
}

impl Disposable for FakeSpeechPipeline {
    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechPipeline for FakeSpeechPipeline {
    fn config(&self) -> SpeechModelConfig {
        self.config
    }

    async fn extract_features(&self, samples: &[f32]) -> anyhow::Result<InputFeatures> {
        self.extract_calls.fetch_add(1, Ordering::SeqCst);
        Ok(InputFeatures {
            data: vec![0.0; 8],
            shape: vec![1, 80, samples.len() / self.config.feature_extractor.hop_length],
        })
    }

    async fn generate(
        &self,
        _features: &InputFeatures,
        options: &AsrGenerateOptions,
        on_step: &mut (dyn for<'s> FnMut(&'s [u32]) + Send),
    ) -> anyhow::Result<ChunkGeneration> {
        self.num_frames.lock().unwrap().push(options.num_frames);
        let chunk = self.extract_calls.load(Ordering::SeqCst) as u32;

        let mut tokens = Vec::new();
        for step in 0..Self::STEPS_PER_CHUNK as u32 {
            tokens.push(chunk * 10 + step);
            on_step(&tokens);
            tokio::task::yield_now().await;
        }
        Ok(ChunkGeneration {
            tokens,
            token_timestamps: None,
        })
    }

    fn decode_asr(
        &self,
        chunks: &[ChunkRecord],
        _options: &DecodeAsrOptions,
    ) -> anyhow::Result<Transcript> {
        let mut start = 0.0;
        let mut segments = Vec::new();
        for chunk in chunks.iter().filter(|c| !c.tokens.is_empty()) {
            let span = chunk
                .stride
                .map(|s| (s.total - s.left - s.right) as f32)
                .unwrap_or(0.0);
            segments.push(TranscriptSegment {
                text: format!(" chunk of {} tokens.", chunk.tokens.len()),
                timestamp: (start, chunk.finalized.then_some(start + span)),
            });
            start += span;
        }
        Ok(Transcript {
            text: segments.iter().map(|s| s.text.as_str()).collect(),
            chunks: segments,
        })
    }
}

// ============================================================================
// Summarization
// ============================================================================

type SummaryLog = Arc<Mutex<Vec<(usize, SummarizeOptions)>>>;

pub struct FakeSummarizer {
    log: SummaryLog,
}

impl Disposable for FakeSummarizer {
    fn dispose(&self) {}
}

#[async_trait]
impl SummarizationPipeline for FakeSummarizer {
    async fn summarize(&self, text: &str, options: &SummarizeOptions) -> anyhow::Result<String> {
        let chars = text.chars().count();
        self.log.lock().unwrap().push((chars, options.clone()));
        tokio::task::yield_now().await;
        Ok(format!("summary of {} chars", chars))
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct FakeBackend {
    fail: bool,
    chat_reply: Vec<String>,
    pub chat_loads: AtomicUsize,
    pub speech_loads: AtomicUsize,
    pub summarization_loads: AtomicUsize,
    chat: Mutex<Option<Arc<FakeChatModel>>>,
    speech_models: Mutex<Vec<String>>,
    summaries: SummaryLog,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::with_chat_reply(&["Hello", " there", "!"])
    }

    pub fn with_chat_reply(reply: &[&str]) -> Self {
        Self {
            fail: false,
            chat_reply: reply.iter().map(|s| s.to_string()).collect(),
            chat_loads: AtomicUsize::new(0),
            speech_loads: AtomicUsize::new(0),
            summarization_loads: AtomicUsize::new(0),
            chat: Mutex::new(None),
            speech_models: Mutex::new(Vec::new()),
            summaries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Backend whose every load fails without reporting progress
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn chat_model(&self) -> Option<Arc<FakeChatModel>> {
        self.chat.lock().unwrap().clone()
    }

    pub fn loaded_speech_models(&self) -> Vec<String> {
        self.speech_models.lock().unwrap().clone()
    }

    pub fn summarized_lengths(&self) -> Vec<usize> {
        self.summaries.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }

    pub fn summarize_options(&self) -> Vec<SummarizeOptions> {
        self.summaries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    fn check(&self, name: &str) -> anyhow::Result<()> {
        if self.fail {
            Err(anyhow!("model files for {} are unavailable", name))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn load_chat_model(
        &self,
        key: &ChatModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn ChatModel>> {
        self.check(&key.model_id)?;
        self.chat_loads.fetch_add(1, Ordering::SeqCst);
        report(&progress, Status::Initiate, &key.model_id);
        tokio::task::yield_now().await;
        report(&progress, Status::Done, &key.model_id);

        let model = Arc::new(FakeChatModel::new(self.chat_reply.clone()));
        *self.chat.lock().unwrap() = Some(model.clone());
        Ok(model)
    }

    async fn load_speech_pipeline(
        &self,
        key: &SpeechModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn SpeechPipeline>> {
        self.check(&key.model)?;
        self.speech_loads.fetch_add(1, Ordering::SeqCst);
        report(&progress, Status::Initiate, &key.model);
        report(&progress, Status::Done, &key.model);
        self.speech_models.lock().unwrap().push(key.model.clone());
        Ok(Arc::new(FakeSpeechPipeline::whisper()))
    }

    async fn load_summarization_pipeline(
        &self,
        key: &SummarizationModelKey,
        progress: ProgressCallback,
    ) -> anyhow::Result<Arc<dyn SummarizationPipeline>> {
        self.check(&key.model)?;
        self.summarization_loads.fetch_add(1, Ordering::SeqCst);
        report(&progress, Status::Initiate, &key.model);
        report(&progress, Status::Done, &key.model);
        Ok(Arc::new(FakeSummarizer {
            log: self.summaries.clone(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}
