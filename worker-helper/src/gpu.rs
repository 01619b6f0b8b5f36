// GPU offload planning for llama.cpp models
//
// Picks how many layers to offload from the detected VRAM, the model file
// size and the context size.

use std::path::Path;

use log::{info, warn};

/// VRAM assumed when nothing can be detected
pub const FALLBACK_VRAM_GB: f32 = 4.0;

/// Kept free for the OS and display
const VRAM_SAFETY_GB: f32 = 0.5;

const GIB: f32 = 1024.0 * 1024.0 * 1024.0;

/// Detect available VRAM in GB
pub fn detect_vram_gb() -> f32 {
    #[cfg(feature = "metal")]
    {
        if let Some(vram) = detect_metal_vram() {
            info!("Metal VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Some(vram) = detect_cuda_vram() {
            info!("CUDA VRAM detected: {:.2} GB", vram);
            return vram;
        }
    }

    info!("VRAM detection not available, using conservative estimate");
    FALLBACK_VRAM_GB
}

#[cfg(feature = "metal")]
fn detect_metal_vram() -> Option<f32> {
    let output = std::process::Command::new("sysctl")
        .arg("hw.memsize")
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let bytes = stdout.split(':').nth(1)?.trim().parse::<u64>().ok()?;
    // Apple Silicon shares memory; the GPU gets roughly 60% of it
    Some(bytes as f32 / GIB * 0.6)
}

#[cfg(feature = "cuda")]
fn detect_cuda_vram() -> Option<f32> {
    let output = std::process::Command::new("nvidia-smi")
        .args(["--query-gpu=memory.free", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    let stdout = String::from_utf8(output.stdout).ok()?;
    let mb = stdout.lines().next()?.trim().parse::<f32>().ok()?;
    Some(mb / 1024.0)
}

/// Layer count guess from the file size: 7B class models (Q4, over 2.5 GB)
/// have about 33 layers, 1B class models about 28
pub fn estimated_layers(file_size_gb: f32) -> u32 {
    if file_size_gb > 2.5 {
        33
    } else {
        28
    }
}

/// KV cache size in GB for `context_size` tokens
fn kv_cache_gb(file_size_gb: f32, context_size: u32) -> f32 {
    let per_1k = if file_size_gb > 2.5 { 0.25 } else { 0.12 };
    (context_size as f32 / 1000.0) * per_1k
}

/// Number of layers that fit in `vram_gb` next to their share of the KV cache
pub fn plan_gpu_layers(
    file_size_gb: f32,
    model_layers: u32,
    vram_gb: f32,
    context_size: u32,
) -> u32 {
    if file_size_gb <= 0.0 || model_layers == 0 {
        warn!("⚠️ Could not determine model size, using CPU only");
        return 0;
    }

    let safe_vram = vram_gb - VRAM_SAFETY_GB;
    if safe_vram <= 0.0 {
        warn!("⚠️ No safe VRAM available, using CPU only");
        return 0;
    }

    let total_kv_gb = kv_cache_gb(file_size_gb, context_size);
    let per_layer = (file_size_gb + total_kv_gb) / model_layers as f32;
    let layers = ((safe_vram / per_layer).floor() as u32).min(model_layers);

    info!(
        "📊 VRAM {:.2} GB (safe {:.2}), weights {:.2} GB, KV cache {:.2} GB at {} ctx, {:.1} MB per layer",
        vram_gb,
        safe_vram,
        file_size_gb,
        total_kv_gb,
        context_size,
        per_layer * 1024.0
    );
    if layers < model_layers {
        warn!(
            "⚠️ Memory constrained. Offloading {}/{} layers",
            layers, model_layers
        );
    } else {
        info!("✅ Full offload possible ({} layers)", layers);
    }
    layers
}

/// GPU layer count for the model at `path`
pub fn default_gpu_layers(path: &Path, context_size: u32) -> u32 {
    let file_size_gb = std::fs::metadata(path)
        .map(|m| m.len() as f32 / GIB)
        .unwrap_or(0.0);
    plan_gpu_layers(
        file_size_gb,
        estimated_layers(file_size_gb),
        detect_vram_gb(),
        context_size,
    )
}
