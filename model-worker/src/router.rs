// router.rs
//
// Inbound message dispatch. Control messages (interrupt, reset) take effect
// as soon as they are read; everything else runs one request at a time in
// arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, OptionFuture};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::cache::ModelCaches;
use crate::chat::ChatSession;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::inference::InferenceBackend;
use crate::protocol::{
    ChatCommand, ChatMessage, Emitter, InboundMessage, LoadRequest, Status, Task, TaskRequest,
};
use crate::{speech, summarize};

/// A request waiting for its turn
#[derive(Debug, Clone, PartialEq)]
pub enum Work {
    Load(LoadRequest),
    Generate(Vec<ChatMessage>),
    Task(TaskRequest),
}

/// Number of requests queued or running, readable from other tasks
#[derive(Debug, Clone, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.count() == 0
    }

    fn set(&self, count: usize) {
        self.0.store(count, Ordering::SeqCst);
    }
}

pub struct MessageRouter {
    backend: Arc<dyn InferenceBackend>,
    caches: ModelCaches,
    chat: ChatSession,
    config: WorkerConfig,
    emitter: Emitter,
    in_flight: InFlight,
}

impl MessageRouter {
    pub fn new(backend: Arc<dyn InferenceBackend>, config: WorkerConfig, emitter: Emitter) -> Self {
        info!(
            "Model worker using {} backend (default chat model {})",
            backend.backend_name(),
            config.default_chat_model
        );
        Self {
            backend,
            caches: ModelCaches::new(),
            chat: ChatSession::new(&config),
            config,
            emitter,
            in_flight: InFlight::default(),
        }
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    pub fn caches(&self) -> &ModelCaches {
        &self.caches
    }

    /// Shared view of the queued and running work
    pub fn in_flight(&self) -> InFlight {
        self.in_flight.clone()
    }

    /// Apply control messages right away. Returns the work item for anything
    /// that has to wait its turn.
    pub fn accept(&self, message: InboundMessage) -> Option<Work> {
        match message {
            InboundMessage::Chat(ChatCommand::Interrupt) => {
                self.chat.interrupt();
                None
            }
            InboundMessage::Chat(ChatCommand::Reset) => {
                self.chat.reset();
                None
            }
            InboundMessage::Chat(ChatCommand::Load(request)) => Some(Work::Load(request)),
            InboundMessage::Chat(ChatCommand::Generate(messages)) => Some(Work::Generate(messages)),
            InboundMessage::Task(request) => Some(Work::Task(request)),
        }
    }

    /// Parse one raw inbound message. Malformed input is reported with task
    /// `unknown` and otherwise ignored.
    pub fn accept_line(&self, line: &str) -> Option<Work> {
        match InboundMessage::parse(line) {
            Ok(message) => self.accept(message),
            Err(e) => {
                warn!("Ignoring malformed message: {}", e);
                self.emitter.send_error(Task::Unknown, &e);
                None
            }
        }
    }

    fn complete<T: Serialize>(&self, task: Task, result: &T) {
        match serde_json::to_value(result) {
            Ok(data) => self.emitter.send_data(Status::Complete, task, data),
            Err(e) => self.emitter.send_error(task, &WorkerError::from(e)),
        }
    }

    /// Start processing one work item
    pub fn execute(&self, work: Work) -> BoxFuture<'_, ()> {
        let backend = self.backend.as_ref();
        match work {
            Work::Load(request) => async move {
                self.chat
                    .load(backend, &self.caches.chat, &request, &self.emitter)
                    .await;
            }
            .boxed(),
            Work::Generate(messages) => self
                .chat
                .generate(backend, &self.caches.chat, messages, &self.emitter)
                .map(|_| ())
                .boxed(),
            Work::Task(TaskRequest::SpeechRecognition(request)) => async move {
                if let Some(transcript) =
                    speech::transcribe(backend, &self.caches.speech, &request, &self.emitter).await
                {
                    self.complete(Task::SpeechRecognition, &transcript);
                }
            }
            .boxed(),
            Work::Task(TaskRequest::Summarization(request)) => async move {
                if let Some(summary) = summarize::summarize(
                    backend,
                    &self.caches.summarization,
                    &request,
                    self.config.summary_max_chars,
                    &self.emitter,
                )
                .await
                {
                    self.complete(Task::Summarization, &summary);
                }
            }
            .boxed(),
        }
    }

    /// Consume raw inbound messages until the stream closes and all queued
    /// work has finished. Inbound messages keep being read while a request
    /// runs, so an interrupt reaches a generation in progress.
    pub async fn run(&self, mut inbound: mpsc::UnboundedReceiver<String>) {
        let mut queue: VecDeque<Work> = VecDeque::new();
        let mut running: Option<BoxFuture<'_, ()>> = None;
        let mut inbound_open = true;

        loop {
            if running.is_none() {
                match queue.pop_front() {
                    Some(work) => running = Some(self.execute(work)),
                    None if !inbound_open => break,
                    None => {}
                }
            }
            self.in_flight.set(queue.len() + usize::from(running.is_some()));

            tokio::select! {
                Some(()) = OptionFuture::from(running.as_mut()), if running.is_some() => {
                    running = None;
                }
                line = inbound.recv(), if inbound_open => match line {
                    Some(line) => {
                        if let Some(work) = self.accept_line(&line) {
                            if running.is_some() {
                                debug!(
                                    "Request queued behind the running one ({} waiting)",
                                    queue.len() + 1
                                );
                            }
                            queue.push_back(work);
                        }
                    }
                    None => {
                        debug!("Inbound stream closed");
                        inbound_open = false;
                    }
                },
                else => break,
            }
        }

        self.in_flight.set(0);
        info!("All requests handled, router stopped");
    }

    /// Release every cached model
    pub async fn shutdown(&self) {
        self.caches.dispose_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::SessionState;
    use crate::protocol::OutboundMessage;
    use crate::testing::{drain, FakeBackend};
    use serde_json::json;

    fn new_router(
        backend: Arc<FakeBackend>,
    ) -> (MessageRouter, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (emitter, rx) = Emitter::channel();
        (MessageRouter::new(backend, WorkerConfig::default(), emitter), rx)
    }

    async fn handle(router: &MessageRouter, line: &str) {
        if let Some(work) = router.accept_line(line) {
            router.execute(work).await;
        }
    }

    fn to_json(message: &OutboundMessage) -> serde_json::Value {
        serde_json::to_value(message).unwrap()
    }

    const SUMMARIZE: &str =
        r#"{"task":"summarization","text":"a long meeting transcript","model":"Xenova/distilbart-cnn-6-6","maxLength":120,"minLength":30}"#;

    #[tokio::test]
    async fn test_summarization_completes_with_data() {
        let (router, mut rx) = new_router(Arc::new(FakeBackend::new()));
        let (tx, inbound) = mpsc::unbounded_channel();
        tx.send(SUMMARIZE.to_string()).unwrap();
        drop(tx);

        router.run(inbound).await;

        let messages = drain(&mut rx);
        let last = messages.last().expect("messages");
        assert_eq!(last.status(), Status::Complete);
        assert_eq!(
            to_json(last),
            json!({
                "status": "complete",
                "task": "summarization",
                "data": {"summary_text": "summary of 25 chars"}
            })
        );
    }

    #[tokio::test]
    async fn test_malformed_message_reported_and_worker_continues() {
        let (router, mut rx) = new_router(Arc::new(FakeBackend::new()));
        let (tx, inbound) = mpsc::unbounded_channel();
        tx.send("not json".to_string()).unwrap();
        tx.send(r#"{"type":"dance"}"#.to_string()).unwrap();
        tx.send(SUMMARIZE.to_string()).unwrap();
        drop(tx);

        router.run(inbound).await;

        let messages = drain(&mut rx);
        assert_eq!(messages[0].status(), Status::Error);
        assert_eq!(messages[0].task(), Task::Unknown);
        assert_eq!(messages[1].task(), Task::Unknown);
        assert_eq!(messages.last().map(|m| m.status()), Some(Status::Complete));
    }

    #[tokio::test]
    async fn test_in_flight_counts_running_work() {
        let (router, mut rx) = new_router(Arc::new(FakeBackend::new()));
        let in_flight = router.in_flight();
        let (tx, inbound) = mpsc::unbounded_channel();

        let driver = async {
            tx.send(SUMMARIZE.to_string()).unwrap();
            let first = rx.recv().await.expect("progress message");
            assert_eq!(first.status(), Status::Initiate);
            let busy = in_flight.count();
            drop(tx);
            busy
        };

        let ((), busy) = tokio::join!(router.run(inbound), driver);

        assert_eq!(busy, 1);
        assert!(router.in_flight().is_idle());
    }

    #[tokio::test]
    async fn test_requests_run_in_arrival_order() {
        let (router, mut rx) = new_router(Arc::new(FakeBackend::new()));
        let (tx, inbound) = mpsc::unbounded_channel();
        let speech = json!({
            "task": "automatic-speech-recognition",
            "audio": vec![0.0f32; 16_000 * 40],
            "model": "Xenova/whisper-tiny",
            "multilingual": false,
            "quantized": true,
            "subtask": "transcribe",
            "language": "english"
        });
        tx.send(speech.to_string()).unwrap();
        tx.send(SUMMARIZE.to_string()).unwrap();
        drop(tx);

        router.run(inbound).await;

        let tasks: Vec<Task> = drain(&mut rx).iter().map(|m| m.task()).collect();
        let last_speech = tasks
            .iter()
            .rposition(|t| *t == Task::SpeechRecognition)
            .unwrap();
        let first_summary = tasks.iter().position(|t| *t == Task::Summarization).unwrap();
        assert!(last_speech < first_summary);
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_generation() {
        let reply: Vec<String> = (0..64).map(|i| format!("t{} ", i)).collect();
        let pieces: Vec<&str> = reply.iter().map(|s| s.as_str()).collect();
        let backend = Arc::new(FakeBackend::with_chat_reply(&pieces));
        let (router, mut rx) = new_router(backend.clone());
        let (tx, inbound) = mpsc::unbounded_channel();

        let driver = async {
            tx.send(r#"{"type":"load","data":{"model_id":"test/chat","dtype":"q4"}}"#.to_string())
                .unwrap();
            tx.send(r#"{"type":"generate","data":[{"role":"user","content":"count"}]}"#.to_string())
                .unwrap();
            let mut seen = Vec::new();
            while let Some(message) = rx.recv().await {
                let status = message.status();
                let task = message.task();
                seen.push(message);
                if status == Status::Start {
                    tx.send(r#"{"type":"interrupt"}"#.to_string()).unwrap();
                }
                if status == Status::Complete && task == Task::TextGeneration {
                    break;
                }
            }
            drop(tx);
            seen
        };

        let ((), seen) = tokio::join!(router.run(inbound), driver);

        let complete = to_json(seen.last().unwrap());
        let output = complete["output"][0].as_str().unwrap().to_string();
        assert!(output.len() < reply.concat().len());
        assert_eq!(router.chat().state(), SessionState::Interrupted);
        assert_eq!(seen.iter().filter(|m| m.status() == Status::Ready).count(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_while_idle_does_not_affect_next_generation() {
        let backend = Arc::new(FakeBackend::new());
        let (router, mut rx) = new_router(backend.clone());

        handle(&router, r#"{"type":"interrupt"}"#).await;
        handle(
            &router,
            r#"{"type":"generate","data":[{"role":"user","content":"hi"}]}"#,
        )
        .await;

        let messages = drain(&mut rx);
        let complete = to_json(messages.last().unwrap());
        assert_eq!(complete["output"], json!(["Hello there!"]));
        assert_eq!(router.chat().state(), SessionState::Complete);
    }

    #[tokio::test]
    async fn test_shutdown_releases_models() {
        let backend = Arc::new(FakeBackend::new());
        let (router, _rx) = new_router(backend.clone());
        handle(&router, r#"{"type":"load","data":{"model_id":"test/chat"}}"#).await;
        assert!(router.caches().chat.is_loaded().await);

        router.shutdown().await;

        assert!(!router.caches().chat.is_loaded().await);
        let model = backend.chat_model().unwrap();
        assert_eq!(model.disposed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
