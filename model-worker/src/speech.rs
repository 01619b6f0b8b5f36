// speech.rs
//
// Automatic speech recognition handler: resolves the model variant, drives
// the chunked transcription loop and streams partial transcripts.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::cache::SpeechPipelineCache;
use crate::chunking::{transcribe_chunks, ChunkRecord, ChunkingOptions, TranscriptionEvent};
use crate::error::{Result, WorkerError};
use crate::inference::{
    AsrGenerateOptions, DecodeAsrOptions, InferenceBackend, SpeechModelKey, SpeechPipeline,
    Transcript,
};
use crate::protocol::{Emitter, SpeechRequest, Status, Task};

const DISTIL_PREFIX: &str = "distil-whisper/";

impl SpeechModelKey {
    pub fn for_request(request: &SpeechRequest) -> Self {
        let is_distil = request.model.starts_with(DISTIL_PREFIX);
        let mut model = request.model.clone();
        if !is_distil && !request.multilingual {
            model.push_str(".en");
        }

        let revision = if request.model.contains("/whisper-medium") {
            "no_attentions"
        } else {
            "main"
        };

        Self {
            model,
            quantized: request.quantized,
            revision: revision.to_string(),
        }
    }
}

/// Window and overlap lengths for a model family
pub fn family_chunking(model: &str) -> ChunkingOptions {
    if model.starts_with(DISTIL_PREFIX) {
        ChunkingOptions::new(20.0, 3.0)
    } else {
        ChunkingOptions::new(30.0, 5.0)
    }
}

// ============================================================================
// ACCUMULATOR
// ============================================================================

/// Running view of the transcription: one record per chunk seen so far, the
/// last one still being generated.
#[derive(Debug, Clone)]
pub struct TranscriptAccumulator {
    entries: Vec<ChunkRecord>,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self {
            entries: vec![ChunkRecord::default()],
        }
    }

    /// Overwrite the in-progress entry's tokens with the latest step output
    pub fn record_step(&mut self, tokens: &[u32]) {
        if let Some(current) = self.entries.last_mut() {
            if current.finalized {
                warn!("Generation step arrived after the last chunk was finalized");
                return;
            }
            current.tokens.clear();
            current.tokens.extend_from_slice(tokens);
        }
    }

    /// Merge a finished chunk into the in-progress entry and, unless it was
    /// the last chunk, open a new one
    pub fn finalize_chunk(&mut self, chunk: &ChunkRecord) {
        if let Some(current) = self.entries.last_mut() {
            current.tokens.clone_from(&chunk.tokens);
            current.token_timestamps.clone_from(&chunk.token_timestamps);
            current.stride = chunk.stride;
            current.is_last = chunk.is_last;
            current.finalized = true;
        }
        if !chunk.is_last {
            self.entries.push(ChunkRecord::default());
        }
    }

    pub fn entries(&self) -> &[ChunkRecord] {
        &self.entries
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| !e.finalized).count()
    }
}

impl Default for TranscriptAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// HANDLER
// ============================================================================

/// Partial updates use the decoder's `[text, {chunks}]` shape
fn partial_payload(transcript: &Transcript) -> Value {
    json!([transcript.text, { "chunks": transcript.chunks }])
}

/// Transcribe one request. Errors are reported as an `error` message and
/// yield `None`; no partial result is returned.
pub async fn transcribe(
    backend: &dyn InferenceBackend,
    cache: &SpeechPipelineCache,
    request: &SpeechRequest,
    emitter: &Emitter,
) -> Option<Transcript> {
    match run_transcription(backend, cache, request, emitter).await {
        Ok(transcript) => Some(transcript),
        Err(e) => {
            if e.is_configuration() {
                warn!("⚠️ Rejected speech recognition request: {}", e);
            } else {
                error!("❌ Speech recognition failed: {}", e);
            }
            emitter.send_error(Task::SpeechRecognition, &e);
            None
        }
    }
}

async fn load_pipeline(
    backend: &dyn InferenceBackend,
    cache: &SpeechPipelineCache,
    key: &SpeechModelKey,
    emitter: &Emitter,
) -> Result<Arc<dyn SpeechPipeline>> {
    let progress = emitter.progress_callback(Task::SpeechRecognition);
    cache
        .get_instance(key, || async move {
            backend
                .load_speech_pipeline(key, progress)
                .await
                .map_err(|e| WorkerError::model_load(key.model.clone(), e))
        })
        .await
}

async fn run_transcription(
    backend: &dyn InferenceBackend,
    cache: &SpeechPipelineCache,
    request: &SpeechRequest,
    emitter: &Emitter,
) -> Result<Transcript> {
    let key = SpeechModelKey::for_request(request);
    let pipeline = load_pipeline(backend, cache, &key, emitter).await?;

    let config = pipeline.config();
    let decode = DecodeAsrOptions {
        time_precision: config.time_precision(),
        return_timestamps: true,
        force_full_sequences: false,
    };
    let generate = AsrGenerateOptions {
        num_frames: 0,
        language: request.language.clone(),
        task: request.subtask.clone(),
        return_timestamps: true,
        top_k: 0,
        do_sample: false,
    };
    let chunking = family_chunking(&request.model);

    info!(
        "📝 Transcribing {:.1}s of audio with {} (quantized: {})",
        request.audio.len() as f64 / config.feature_extractor.sampling_rate.max(1) as f64,
        key.model,
        key.quantized
    );

    let mut accumulator = TranscriptAccumulator::new();
    let mut step_error: Option<anyhow::Error> = None;

    let records = transcribe_chunks(
        pipeline.as_ref(),
        &request.audio,
        &chunking,
        &generate,
        &mut |event| match event {
            TranscriptionEvent::Step(tokens) => {
                accumulator.record_step(tokens);
                if step_error.is_some() {
                    return;
                }
                match pipeline.decode_asr(accumulator.entries(), &decode) {
                    Ok(partial) => emitter.send_data(
                        Status::Update,
                        Task::SpeechRecognition,
                        partial_payload(&partial),
                    ),
                    Err(e) => step_error = Some(e),
                }
            }
            TranscriptionEvent::ChunkFinalized(chunk) => {
                accumulator.finalize_chunk(chunk);
                debug!(
                    "Chunk finalized, {} of {} entries still open",
                    accumulator.pending(),
                    accumulator.entries().len()
                );
            }
        },
    )
    .await?;

    if let Some(e) = step_error {
        return Err(WorkerError::Inference(e));
    }

    let transcript = pipeline
        .decode_asr(&records, &decode)
        .map_err(WorkerError::Inference)?;
    info!("✅ Transcription complete: {} chars", transcript.text.len());
    Ok(transcript)
}
