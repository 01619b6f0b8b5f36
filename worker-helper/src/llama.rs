// llama.cpp inference engine
//
// Chat and summarization on local GGUF models. Models load on a blocking
// thread; each generation creates its own context on a blocking thread and
// checks the stopping token between tokens.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use model_worker::inference::{
    ChatModel, ChatModelKey, Disposable, GenerationOptions, InferenceBackend, ProgressCallback,
    SpeechModelKey, SpeechPipeline, StreamEvent, StreamSender, SummarizationModelKey,
    SummarizationPipeline, SummarizeOptions,
};
use model_worker::protocol::{ChatMessage, ProgressEvent, Status};

use crate::backend::{resolve_model_path, BackendOptions};
use crate::gpu;
use crate::templates::{summary_messages, ChatTemplate, StopScanner};

pub struct LlamaEngine {
    backend: Arc<LlamaBackend>,
    models_dir: Option<PathBuf>,
    context_size: u32,
}

impl LlamaEngine {
    pub fn new(options: &BackendOptions) -> Result<Self> {
        let backend = LlamaBackend::init().context("Failed to init LlamaBackend")?;
        info!(
            "🦙 llama.cpp backend ready (models: {}, context: {})",
            options
                .models_dir
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<none>".to_string()),
            options.context_size
        );
        Ok(Self {
            backend: Arc::new(backend),
            models_dir: options.models_dir.clone(),
            context_size: options.context_size,
        })
    }

    async fn load(&self, model_id: &str, progress: &ProgressCallback) -> Result<LlamaChatModel> {
        let path = resolve_model_path(self.models_dir.as_deref(), model_id)
            .ok_or_else(|| anyhow!("no GGUF file found for '{}'", model_id))?;
        let file = path.display().to_string();

        progress(ProgressEvent {
            status: Status::Initiate,
            name: Some(model_id.to_string()),
            file: Some(file.clone()),
            progress: None,
            loaded: None,
            total: None,
        });

        let backend = self.backend.clone();
        let context_size = self.context_size;
        let model = tokio::task::spawn_blocking(move || -> Result<LlamaModel> {
            info!("📥 Loading model: {}", path.display());
            let gpu_layers = gpu::default_gpu_layers(&path, context_size);
            let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
            let model_params = pin!(model_params);
            LlamaModel::load_from_file(&backend, path.clone(), &model_params)
                .with_context(|| format!("unable to load model at {:?}", path))
        })
        .await
        .context("model load task failed")??;

        progress(ProgressEvent {
            status: Status::Done,
            name: Some(model_id.to_string()),
            file: Some(file),
            progress: None,
            loaded: None,
            total: None,
        });
        info!("✅ Model loaded successfully");

        Ok(LlamaChatModel {
            backend: self.backend.clone(),
            model: Arc::new(model),
            template: ChatTemplate::for_model(model_id),
            context_size,
            name: model_id.to_string(),
        })
    }
}

#[async_trait]
impl InferenceBackend for LlamaEngine {
    async fn load_chat_model(
        &self,
        key: &ChatModelKey,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn ChatModel>> {
        if key.dtype != "q4f16" {
            debug!("dtype {} is ignored, GGUF files carry their own quantization", key.dtype);
        }
        Ok(Arc::new(self.load(&key.model_id, &progress).await?))
    }

    async fn load_speech_pipeline(
        &self,
        key: &SpeechModelKey,
        _progress: ProgressCallback,
    ) -> Result<Arc<dyn SpeechPipeline>> {
        bail!(
            "speech recognition is not supported by the llama.cpp backend (model '{}')",
            key.model
        )
    }

    async fn load_summarization_pipeline(
        &self,
        key: &SummarizationModelKey,
        progress: ProgressCallback,
    ) -> Result<Arc<dyn SummarizationPipeline>> {
        let chat = self.load(&key.model, &progress).await?;
        Ok(Arc::new(LlamaSummarizer { chat }))
    }

    fn backend_name(&self) -> &'static str {
        "llama.cpp"
    }
}

// ============================================================================
// Chat model
// ============================================================================

pub struct LlamaChatModel {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    template: ChatTemplate,
    context_size: u32,
    name: String,
}

fn to_ids(tokens: Vec<LlamaToken>) -> Vec<u32> {
    tokens.into_iter().map(|t| t.0 as u32).collect()
}

impl Disposable for LlamaChatModel {
    fn dispose(&self) {
        info!("🗑️ Releasing llama.cpp model {}", self.name);
    }
}

#[async_trait]
impl ChatModel for LlamaChatModel {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        let prompt = self.template.render(messages, add_generation_prompt);
        self.encode(&prompt)
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let tokens = self
            .model
            .str_to_token(text, AddBos::Always)
            .with_context(|| "failed to tokenize prompt")?;
        Ok(to_ids(tokens))
    }

    async fn generate(
        &self,
        input_ids: &[u32],
        options: &GenerationOptions,
        streamer: Option<&StreamSender>,
        stopping: &CancellationToken,
    ) -> Result<Vec<u32>> {
        let job = GenerationJob {
            backend: self.backend.clone(),
            model: self.model.clone(),
            stop_sequences: self.template.stop_sequences(),
            context_size: self.context_size,
            input_ids: input_ids.to_vec(),
            max_new_tokens: options.max_new_tokens,
            streamer: streamer.cloned(),
            stopping: stopping.clone(),
        };
        tokio::task::spawn_blocking(move || job.run())
            .await
            .context("generation task failed")?
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        let special = if skip_special_tokens {
            Special::Plaintext
        } else {
            Special::Tokenize
        };
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut text = String::new();
        for token in tokens {
            let bytes = self
                .model
                .token_to_bytes(LlamaToken(*token as i32), special)
                .context("Failed to convert token to bytes")?;
            let mut piece = String::with_capacity(32);
            let _ = decoder.decode_to_string(&bytes, &mut piece, false);
            text.push_str(&piece);
        }
        Ok(text)
    }
}

struct GenerationJob {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    stop_sequences: &'static [&'static str],
    context_size: u32,
    input_ids: Vec<u32>,
    max_new_tokens: usize,
    streamer: Option<StreamSender>,
    stopping: CancellationToken,
}

impl GenerationJob {
    /// Report one token and any text that became final with it
    fn stream(&self, text: String) {
        if let Some(streamer) = &self.streamer {
            let _ = streamer.send(StreamEvent::Token);
            if !text.is_empty() {
                let _ = streamer.send(StreamEvent::Text(text));
            }
        }
    }

    fn run(self) -> Result<Vec<u32>> {
        let start_time = Instant::now();
        let model = self.model.as_ref();
        if self.input_ids.is_empty() {
            bail!("empty prompt");
        }

        // max(1, cores / 2 + 2) keeps the host responsive
        let threads: i32 = std::thread::available_parallelism()
            .map(|n| ((n.get() as i32 / 2) + 2).max(1))
            .unwrap_or(2);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(
                NonZeroU32::new(self.context_size).context("Invalid ctx size")?,
            ))
            .with_n_batch(self.context_size)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .context("unable to create the llama_context")?;

        let mut batch = LlamaBatch::new(self.context_size as usize, 1);
        let last_index = (self.input_ids.len() - 1) as i32;
        for (i, token) in (0_i32..).zip(self.input_ids.iter()) {
            batch
                .add(LlamaToken(*token as i32), i, &[0], i == last_index)
                .context("Failed to add token to batch")?;
        }
        ctx.decode(&mut batch).context("llama_decode() failed")?;
        let prompt_time = start_time.elapsed();

        let mut n_cur = batch.n_tokens();
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut scanner = StopScanner::new(self.stop_sequences);
        let mut generated = Vec::new();
        // Byte offset in the output where each generated token's text ends
        let mut token_ends = Vec::new();
        let mut sampler = pin!(LlamaSampler::chain_simple([LlamaSampler::greedy()]));
        let mut stopped = false;

        debug!(
            "🔄 Starting generation ({} prompt tokens, max_new_tokens: {})",
            n_cur, self.max_new_tokens
        );

        while generated.len() < self.max_new_tokens {
            if self.stopping.is_cancelled() {
                info!("⏹️ Generation interrupted after {} tokens", generated.len());
                break;
            }

            let token = sampler.as_mut().sample(&ctx, batch.n_tokens() - 1);
            sampler.as_mut().accept(token);
            if model.is_eog_token(token) {
                break;
            }

            let bytes = model
                .token_to_bytes(token, Special::Plaintext)
                .context("Failed to convert token to bytes")?;
            let mut piece = String::with_capacity(32);
            let _ = decoder.decode_to_string(&bytes, &mut piece, false);

            generated.push(token.0 as u32);
            token_ends.push(scanner.text().len() + piece.len());
            let (ready, hit_stop) = scanner.push(&piece);
            self.stream(ready);

            if hit_stop {
                debug!("✓ Stop sequence detected");
                stopped = true;
                break;
            }

            batch.clear();
            batch
                .add(token, n_cur, &[0], true)
                .context("Failed to add generated token to batch")?;
            n_cur += 1;
            ctx.decode(&mut batch).context("failed to eval")?;
        }

        if stopped {
            // Drop the tokens that spelled the marker
            let kept = token_ends
                .iter()
                .take_while(|&&end| end <= scanner.text().len())
                .count();
            generated.truncate(kept);
        } else if let Some(streamer) = &self.streamer {
            let rest = scanner.finish();
            if !rest.is_empty() {
                let _ = streamer.send(StreamEvent::Text(rest));
            }
        }

        let gen_time = start_time.elapsed().saturating_sub(prompt_time);
        info!(
            "📊 Prompt {:.2}s, generated {} tokens in {:.2}s",
            prompt_time.as_secs_f64(),
            generated.len(),
            gen_time.as_secs_f64()
        );
        Ok(generated)
    }
}

// ============================================================================
// Summarization
// ============================================================================

pub struct LlamaSummarizer {
    chat: LlamaChatModel,
}

impl Disposable for LlamaSummarizer {
    fn dispose(&self) {
        self.chat.dispose();
    }
}

#[async_trait]
impl SummarizationPipeline for LlamaSummarizer {
    async fn summarize(&self, text: &str, options: &SummarizeOptions) -> Result<String> {
        let messages = summary_messages(text, options.min_length, options.max_new_tokens);
        let input_ids = self.chat.apply_chat_template(&messages, true)?;
        let generation = GenerationOptions {
            max_new_tokens: options.max_new_tokens,
            do_sample: options.do_sample,
        };
        let tokens = self
            .chat
            .generate(&input_ids, &generation, None, &CancellationToken::new())
            .await?;
        let summary = self.chat.decode(&tokens, true)?;
        Ok(summary.trim().to_string())
    }
}
