use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::io::BufReader;

use model_worker::{Emitter, MessageRouter, WorkerConfig};

mod backend;
#[cfg(any(feature = "llama", test))]
mod gpu;
mod host;
#[cfg(feature = "llama")]
mod llama;
#[cfg(any(feature = "llama", test))]
mod templates;

/// Idle timeout for the helper (seconds); 0 disables it
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "worker-helper", version, about = "JSON-lines host for the model worker")]
struct Args {
    /// Directory holding GGUF model files
    #[arg(long, env = "MODEL_WORKER_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Exit after this many seconds without input or output
    #[arg(long, env = "MODEL_WORKER_IDLE_TIMEOUT", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// Context window for llama.cpp models
    #[arg(long, env = "MODEL_WORKER_CONTEXT_SIZE", default_value_t = 2048)]
    context_size: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries protocol messages only
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    info!(
        "🚀 worker-helper starting (idle timeout: {}s)",
        args.idle_timeout
    );

    let config = WorkerConfig::from_env();
    let backend = backend::create(&backend::BackendOptions {
        models_dir: args.models_dir.clone(),
        context_size: args.context_size,
    })?;

    let (emitter, outbound) = Emitter::channel();
    let router = MessageRouter::new(backend, config, emitter);
    let idle_timeout = (args.idle_timeout > 0).then(|| Duration::from_secs(args.idle_timeout));

    host::serve(
        router,
        outbound,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        idle_timeout,
    )
    .await?;

    info!("👋 worker-helper exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["worker-helper"]).unwrap();
        assert_eq!(args.context_size, 2048);
        assert!(args.idle_timeout > 0);
    }

    #[test]
    fn test_args_explicit() {
        let args = Args::try_parse_from([
            "worker-helper",
            "--models-dir",
            "/models",
            "--idle-timeout",
            "0",
            "--context-size",
            "4096",
        ])
        .unwrap();
        assert_eq!(args.models_dir, Some(PathBuf::from("/models")));
        assert_eq!(args.idle_timeout, 0);
        assert_eq!(args.context_size, 4096);
    }
}
