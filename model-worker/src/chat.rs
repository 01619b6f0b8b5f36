// chat.rs
//
// Chat session runner: model load with warm-up, templated prompts, streamed
// generation with throughput reporting, and cooperative interruption.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, error, info};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::ChatModelCache;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::inference::{ChatModel, ChatModelKey, GenerationOptions, InferenceBackend, StreamEvent};
use crate::protocol::{ChatMessage, Emitter, LoadRequest, Status, StatusMessage, Task};
use crate::stopping::StoppingCriteria;

const WARMUP_TEXT: &str = "a";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    Generating,
    Complete,
    Interrupted,
    Failed,
}

// ============================================================================
// Throughput
// ============================================================================

/// Token counter with tokens/sec measured from the first token, not from the
/// start of the call
#[derive(Debug, Default)]
pub struct ThroughputMeter {
    started: Option<Instant>,
    num_tokens: usize,
    tps: Option<f64>,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_token(&mut self) {
        self.record_token_at(Instant::now());
    }

    pub fn record_token_at(&mut self, now: Instant) {
        let started = *self.started.get_or_insert(now);
        let previous = self.num_tokens;
        self.num_tokens += 1;
        if previous > 0 {
            let elapsed = now.duration_since(started).as_secs_f64();
            if elapsed > 0.0 {
                self.tps = Some(self.num_tokens as f64 / elapsed);
            }
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn tps(&self) -> Option<f64> {
        self.tps
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct ChatSession {
    stopping: StoppingCriteria,
    state: Mutex<SessionState>,
    requested: Mutex<Option<ChatModelKey>>,
    max_new_tokens: usize,
    default_key: ChatModelKey,
}

impl ChatSession {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            stopping: StoppingCriteria::new(),
            state: Mutex::new(SessionState::Idle),
            requested: Mutex::new(None),
            max_new_tokens: config.chat_max_new_tokens,
            default_key: ChatModelKey {
                model_id: config.default_chat_model.clone(),
                dtype: config.default_chat_dtype.clone(),
            },
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn interrupt(&self) {
        info!("⏹️ Interrupt requested");
        self.stopping.interrupt();
    }

    pub fn reset(&self) {
        if self.stopping.is_interrupted() {
            debug!("Clearing pending interrupt");
        }
        self.stopping.reset();
    }

    /// Key of the last `load` request, or the configured default
    pub fn requested_key(&self) -> ChatModelKey {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| self.default_key.clone())
    }

    fn remember_request(&self, request: &LoadRequest) -> ChatModelKey {
        let key = ChatModelKey {
            model_id: request
                .model_id
                .clone()
                .unwrap_or_else(|| self.default_key.model_id.clone()),
            dtype: request
                .dtype
                .clone()
                .unwrap_or_else(|| self.default_key.dtype.clone()),
        };
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner) = Some(key.clone());
        key
    }

    async fn ensure_model(
        &self,
        backend: &dyn InferenceBackend,
        cache: &ChatModelCache,
        key: &ChatModelKey,
        emitter: &Emitter,
    ) -> Result<Arc<dyn ChatModel>> {
        let progress = emitter.progress_callback(Task::TextGeneration);
        cache
            .get_instance(key, || async move {
                backend
                    .load_chat_model(key, progress)
                    .await
                    .map_err(|e| WorkerError::model_load(key.model_id.clone(), e))
            })
            .await
    }

    /// Load the requested model, warm it up with a one-token generation and
    /// report readiness. Returns false on failure (already reported).
    pub async fn load(
        &self,
        backend: &dyn InferenceBackend,
        cache: &ChatModelCache,
        request: &LoadRequest,
        emitter: &Emitter,
    ) -> bool {
        let key = self.remember_request(request);
        self.set_state(SessionState::Loading);
        emitter.send_data(Status::Loading, Task::TextGeneration, json!("Loading model..."));
        if cache.current_key().await.as_ref() == Some(&key) && cache.is_loaded().await {
            info!("♻️ Chat model {} already cached, warming up again", key.model_id);
        }

        match self.load_and_warm_up(backend, cache, &key, emitter).await {
            Ok(()) => {
                self.set_state(SessionState::Ready);
                emitter.send_data(Status::Ready, Task::TextGeneration, Value::Null);
                info!("✅ Chat model {} ready", key.model_id);
                true
            }
            Err(e) => {
                error!("❌ Failed to load chat model {}: {}", key.model_id, e);
                self.set_state(SessionState::Failed);
                emitter.send_error(Task::TextGeneration, &e);
                false
            }
        }
    }

    async fn load_and_warm_up(
        &self,
        backend: &dyn InferenceBackend,
        cache: &ChatModelCache,
        key: &ChatModelKey,
        emitter: &Emitter,
    ) -> Result<()> {
        let model = self.ensure_model(backend, cache, key, emitter).await?;

        emitter.send_data(
            Status::Loading,
            Task::TextGeneration,
            json!("Compiling shaders and warming up model..."),
        );
        let started = Instant::now();
        let input_ids = model.encode(WARMUP_TEXT)?;
        let options = GenerationOptions {
            max_new_tokens: 1,
            do_sample: false,
        };
        model
            .generate(&input_ids, &options, None, &CancellationToken::new())
            .await?;
        info!("🔥 Warm-up finished in {:.2}s", started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Stream a reply to `messages`. Returns the decoded output, or `None`
    /// on failure (already reported).
    ///
    /// Pending interrupts are cleared and the stopping token is taken when
    /// this is called, not when the future is first polled, so an interrupt
    /// that arrives after the call always reaches this generation.
    pub fn generate<'a>(
        &'a self,
        backend: &'a dyn InferenceBackend,
        cache: &'a ChatModelCache,
        messages: Vec<ChatMessage>,
        emitter: &'a Emitter,
    ) -> impl Future<Output = Option<String>> + Send + 'a {
        self.stopping.reset();
        let stopping = self.stopping.token();
        async move {
            match self
                .run_generation(backend, cache, &messages, stopping, emitter)
                .await
            {
                Ok(output) => Some(output),
                Err(e) => {
                    error!("❌ Chat generation failed: {}", e);
                    self.set_state(SessionState::Failed);
                    emitter.send_error(Task::TextGeneration, &e);
                    None
                }
            }
        }
    }

    async fn run_generation(
        &self,
        backend: &dyn InferenceBackend,
        cache: &ChatModelCache,
        messages: &[ChatMessage],
        stopping: CancellationToken,
        emitter: &Emitter,
    ) -> Result<String> {
        let key = self.requested_key();
        let model = self.ensure_model(backend, cache, &key, emitter).await?;
        let input_ids = model.apply_chat_template(messages, true)?;

        self.set_state(SessionState::Generating);
        emitter.send_data(Status::Start, Task::TextGeneration, Value::Null);

        let options = GenerationOptions {
            max_new_tokens: self.max_new_tokens,
            do_sample: false,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut meter = ThroughputMeter::new();
        let started = Instant::now();

        let generation = async {
            let tx = tx;
            model.generate(&input_ids, &options, Some(&tx), &stopping).await
        };
        let forward = async {
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Token => meter.record_token(),
                    StreamEvent::Text(text) => {
                        let mut update = StatusMessage::output(
                            Status::Update,
                            Task::TextGeneration,
                            json!(text),
                        );
                        update.tps = meter.tps();
                        update.num_tokens = Some(meter.num_tokens());
                        emitter.emit(update);
                    }
                }
            }
        };
        let (generated, ()) = tokio::join!(generation, forward);
        let generated = generated?;

        let interrupted = stopping.is_cancelled();
        self.set_state(if interrupted {
            SessionState::Interrupted
        } else {
            SessionState::Complete
        });

        let decoded = model.decode(&generated, true)?;
        info!(
            "📊 Generated {} tokens in {:.2}s ({}){}",
            meter.num_tokens(),
            started.elapsed().as_secs_f64(),
            meter
                .tps()
                .map(|tps| format!("{:.2} tokens/sec", tps))
                .unwrap_or_else(|| "n/a".to_string()),
            if interrupted { ", interrupted" } else { "" }
        );
        emitter.emit(StatusMessage::output(
            Status::Complete,
            Task::TextGeneration,
            json!([decoded]),
        ));
        Ok(decoded)
    }
}
