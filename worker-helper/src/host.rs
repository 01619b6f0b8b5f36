// ============================================================================
// JSON-lines host loop
// ============================================================================
//
// One inbound message per input line, one outbound message per output line.
// `ping` and `shutdown` are answered here; everything else goes to the
// router. The host exits on end of input, on `shutdown`, or after the idle
// timeout passes with no input, no output and no request in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use model_worker::protocol::{Emitter, OutboundMessage, Status, Task};
use model_worker::{InFlight, MessageRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostCommand {
    Ping,
    Shutdown,
}

impl HostCommand {
    /// Only exact host commands match; anything else belongs to the router
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line).ok()
    }
}

/// Time of the last input or output, shared between reader and writer
#[derive(Debug, Clone)]
struct Activity {
    origin: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::SeqCst));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Serve `router` over `input`/`output` until the session ends. Returns the
/// output sink once every message has been written.
pub async fn serve<R, W>(
    router: MessageRouter,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    input: R,
    output: W,
    idle_timeout: Option<Duration>,
) -> Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let activity = Activity::new();
    let shutdown = CancellationToken::new();
    let writer = tokio::spawn(write_messages(outbound, output, activity.clone()));

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let reader = read_lines(
        input,
        line_tx,
        router.emitter().clone(),
        router.in_flight(),
        activity,
        idle_timeout,
        shutdown.clone(),
    );
    let worker = async {
        tokio::select! {
            _ = router.run(line_rx) => {}
            _ = shutdown.cancelled() => {
                info!("🛑 Shutdown requested, dropping in-flight work");
            }
        }
        router.shutdown().await;
    };

    let (read_result, ()) = tokio::join!(reader, worker);
    drop(router);

    let output = writer.await.context("writer task panicked")??;
    read_result?;
    Ok(output)
}

async fn read_lines<R>(
    input: R,
    lines_tx: mpsc::UnboundedSender<String>,
    emitter: Emitter,
    in_flight: InFlight,
    activity: Activity,
    idle_timeout: Option<Duration>,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let goodbye = || emitter.send_data(Status::Goodbye, Task::Worker, Value::Null);

    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, lines.next_line()).await {
                Ok(next) => next,
                Err(_) => {
                    if !in_flight.is_idle() {
                        // Idle time counts from the end of the running request
                        activity.touch();
                        continue;
                    }
                    if activity.idle_for() >= limit {
                        info!("💤 Idle timeout reached, shutting down");
                        goodbye();
                        shutdown.cancel();
                        return Ok(());
                    }
                    continue;
                }
            },
            None => lines.next_line().await,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("📪 EOF received, finishing queued work");
                return Ok(());
            }
            Err(e) => {
                error!("❌ Error reading input: {}", e);
                return Err(e).context("failed to read input");
            }
        };
        activity.touch();

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match HostCommand::parse(line) {
            Some(HostCommand::Ping) => {
                emitter.send_data(Status::Pong, Task::Worker, Value::Null);
            }
            Some(HostCommand::Shutdown) => {
                info!("🛑 Shutdown requested");
                goodbye();
                shutdown.cancel();
                return Ok(());
            }
            None => {
                if lines_tx.send(line.to_string()).is_err() {
                    warn!("Router stopped, dropping input");
                    return Ok(());
                }
            }
        }
    }
}

async fn write_messages<W>(
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    mut output: W,
    activity: Activity,
) -> Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut json = serde_json::to_string(&message)?;
        json.push('\n');
        output
            .write_all(json.as_bytes())
            .await
            .context("failed to write output")?;
        output.flush().await.context("failed to flush output")?;
        activity.touch();
    }
    Ok(output)
}
