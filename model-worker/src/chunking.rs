// chunking.rs
//
// Long-form audio chunking: split the input into overlapping windows, run
// feature extraction and generation per window, and hand each finished chunk
// (tokens plus strides in seconds) to the caller for merging.

use log::{debug, info};

use crate::error::{Result, WorkerError};
use crate::inference::{AsrGenerateOptions, SpeechPipeline};

// ============================================================================
// STRIDES
// ============================================================================

/// Chunk extent and overlaps, in samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStride {
    pub total: usize,
    pub left: usize,
    pub right: usize,
}

impl SampleStride {
    /// Consumes the sample stride so a chunk is scaled exactly once
    pub fn to_seconds(self, sampling_rate: u32) -> StrideSeconds {
        let rate = sampling_rate as f64;
        StrideSeconds {
            total: self.total as f64 / rate,
            left: self.left as f64 / rate,
            right: self.right as f64 / rate,
        }
    }
}

/// Chunk extent and overlaps, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrideSeconds {
    pub total: f64,
    pub left: f64,
    pub right: f64,
}

// ============================================================================
// WINDOWING
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingOptions {
    /// Window length in seconds; `None` or non-positive disables chunking
    pub chunk_length_s: Option<f32>,
    /// Overlap on each side in seconds; defaults to a sixth of the window
    pub stride_length_s: Option<f32>,
}

impl ChunkingOptions {
    pub fn new(chunk_length_s: f32, stride_length_s: f32) -> Self {
        Self {
            chunk_length_s: Some(chunk_length_s),
            stride_length_s: Some(stride_length_s),
        }
    }

    pub fn disabled() -> Self {
        Self {
            chunk_length_s: None,
            stride_length_s: None,
        }
    }
}

/// One window of the input audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk<'a> {
    pub samples: &'a [f32],
    pub offset: usize,
    pub stride: SampleStride,
    pub is_first: bool,
    pub is_last: bool,
}

/// Split `audio` into overlapping windows.
///
/// Fails before producing anything when the audio is empty or the stride does
/// not fit inside the window.
pub fn plan_chunks<'a>(
    audio: &'a [f32],
    sampling_rate: u32,
    options: &ChunkingOptions,
) -> Result<Vec<AudioChunk<'a>>> {
    if audio.is_empty() {
        return Err(WorkerError::EmptyAudio);
    }

    let chunk_length_s = match options.chunk_length_s {
        Some(length) if length > 0.0 => length,
        _ => {
            return Ok(vec![AudioChunk {
                samples: audio,
                offset: 0,
                stride: SampleStride {
                    total: audio.len(),
                    left: 0,
                    right: 0,
                },
                is_first: true,
                is_last: true,
            }])
        }
    };
    let stride_length_s = options
        .stride_length_s
        .unwrap_or(chunk_length_s / 6.0);

    if chunk_length_s <= stride_length_s {
        return Err(WorkerError::InvalidChunking {
            chunk_length_s,
            stride_length_s,
        });
    }

    let rate = sampling_rate as f64;
    let window = (rate * chunk_length_s as f64) as usize;
    let stride = (rate * stride_length_s as f64) as usize;
    let jump = window
        .checked_sub(2 * stride)
        .filter(|jump| *jump > 0)
        .ok_or_else(|| {
            WorkerError::InvalidConfig(format!(
                "chunk_length_s ({}) must be more than twice stride_length_s ({})",
                chunk_length_s, stride_length_s
            ))
        })?;

    let mut chunks = Vec::new();
    let mut offset = 0;
    loop {
        let end = (offset + window).min(audio.len());
        let is_first = offset == 0;
        let is_last = offset + window >= audio.len();
        chunks.push(AudioChunk {
            samples: &audio[offset..end],
            offset,
            stride: SampleStride {
                total: end - offset,
                left: if is_first { 0 } else { stride },
                right: if is_last { 0 } else { stride },
            },
            is_first,
            is_last,
        });
        if is_last {
            break;
        }
        offset += jump;
    }

    debug!(
        "Planned {} chunk(s): window={} stride={} jump={} samples",
        chunks.len(),
        window,
        stride,
        jump
    );
    Ok(chunks)
}

// ============================================================================
// CHUNK RECORDS
// ============================================================================

/// A chunk as seen by the ASR decoder: generated tokens plus strides in
/// seconds. Accumulator entries start empty and not finalized.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChunkRecord {
    pub tokens: Vec<u32>,
    pub token_timestamps: Option<Vec<f32>>,
    pub stride: Option<StrideSeconds>,
    pub is_last: bool,
    pub finalized: bool,
}

/// Events produced while chunks are transcribed, in order
#[derive(Debug)]
pub enum TranscriptionEvent<'a> {
    /// Output token ids of the current chunk after one generation step
    Step(&'a [u32]),
    /// A chunk finished generating
    ChunkFinalized(&'a ChunkRecord),
}

/// Run feature extraction and generation over every window of `audio`.
///
/// `generate` is used as a template; `num_frames` is set per chunk. Returns the
/// finalized chunk records in input order.
pub async fn transcribe_chunks(
    pipeline: &dyn SpeechPipeline,
    audio: &[f32],
    chunking: &ChunkingOptions,
    generate: &AsrGenerateOptions,
    on_event: &mut (dyn FnMut(TranscriptionEvent<'_>) + Send),
) -> Result<Vec<ChunkRecord>> {
    let config = pipeline.config();
    let extractor = config.feature_extractor;
    if extractor.hop_length == 0 || extractor.sampling_rate == 0 {
        return Err(WorkerError::InvalidConfig(
            "feature extractor reports a zero hop length or sampling rate".to_string(),
        ));
    }

    let windows = plan_chunks(audio, extractor.sampling_rate, chunking)?;
    info!(
        "🎙️ Transcribing {} samples in {} chunk(s)",
        audio.len(),
        windows.len()
    );

    let mut records = Vec::with_capacity(windows.len());
    for window in windows {
        let features = pipeline
            .extract_features(window.samples)
            .await
            .map_err(WorkerError::Inference)?;

        let options = AsrGenerateOptions {
            num_frames: window.stride.total / extractor.hop_length,
            ..generate.clone()
        };

        let generated = pipeline
            .generate(&features, &options, &mut |tokens: &[u32]| {
                on_event(TranscriptionEvent::Step(tokens))
            })
            .await
            .map_err(WorkerError::Inference)?;

        let record = ChunkRecord {
            tokens: generated.tokens,
            token_timestamps: generated.token_timestamps,
            stride: Some(window.stride.to_seconds(extractor.sampling_rate)),
            is_last: window.is_last,
            finalized: true,
        };
        on_event(TranscriptionEvent::ChunkFinalized(&record));
        records.push(record);
    }

    Ok(records)
}
