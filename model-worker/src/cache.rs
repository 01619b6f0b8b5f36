//! Single-entry model caches, one per task.
//!
//! Each cache memoizes at most one loaded handle, keyed by model identifier.
//! Loads in flight are shared through a `OnceCell`, so callers asking for the
//! same key observe the same load. Asking for a different key releases the
//! previous handle and installs a fresh entry. A load whose entry was
//! replaced while it ran is released as soon as it finishes.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use log::{info, warn};
use tokio::sync::{Mutex, OnceCell};

use crate::error::{Result, WorkerError};
use crate::inference::{
    ChatModel, ChatModelKey, Disposable, SpeechModelKey, SpeechPipeline, SummarizationModelKey,
    SummarizationPipeline,
};

struct CacheEntry<K, H> {
    key: K,
    cell: Arc<OnceCell<H>>,
}

pub struct ModelCache<K, H> {
    name: &'static str,
    slot: Mutex<Option<CacheEntry<K, H>>>,
}

impl<K, H> ModelCache<K, H>
where
    K: Clone + PartialEq + Debug,
    H: Clone + Disposable,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Mutex::new(None),
        }
    }

    /// Return the handle for `key`, running `load` only if no handle for that
    /// key is memoized. A failed load leaves the entry empty so the next call
    /// tries again. If another key took the slot while `load` ran, the new
    /// handle is disposed and the call fails.
    pub async fn get_instance<F, Fut>(&self, key: &K, load: F) -> Result<H>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H>>,
    {
        let cell = {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(entry) if entry.key == *key => entry.cell.clone(),
                _ => {
                    if let Some(previous) = slot.take() {
                        info!(
                            "🔁 {} model changed from {:?} to {:?}, releasing previous instance",
                            self.name, previous.key, key
                        );
                        if let Some(handle) = previous.cell.get() {
                            handle.dispose();
                        }
                    }
                    let cell = Arc::new(OnceCell::new());
                    *slot = Some(CacheEntry {
                        key: key.clone(),
                        cell: cell.clone(),
                    });
                    cell
                }
            }
        };

        if !cell.initialized() {
            info!("📥 Loading {} model {:?}", self.name, key);
        }
        let handle = cell.get_or_try_init(load).await?.clone();

        let current = self
            .slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|entry| Arc::ptr_eq(&entry.cell, &cell));
        if !current {
            warn!(
                "⚠️ {} model {:?} was replaced while loading, releasing it",
                self.name, key
            );
            handle.dispose();
            return Err(WorkerError::model_load(
                format!("{:?}", key),
                anyhow!("superseded by a request for another model"),
            ));
        }
        Ok(handle)
    }

    /// Release the memoized handle and forget its key
    pub async fn dispose(&self) {
        let previous = self.slot.lock().await.take();
        if let Some(entry) = previous {
            if let Some(handle) = entry.cell.get() {
                handle.dispose();
            }
            info!("🗑️ Disposed {} model {:?}", self.name, entry.key);
        }
    }

    pub async fn current_key(&self) -> Option<K> {
        self.slot.lock().await.as_ref().map(|entry| entry.key.clone())
    }

    pub async fn is_loaded(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|entry| entry.cell.initialized())
            .unwrap_or(false)
    }
}

pub type ChatModelCache = ModelCache<ChatModelKey, Arc<dyn ChatModel>>;
pub type SpeechPipelineCache = ModelCache<SpeechModelKey, Arc<dyn SpeechPipeline>>;
pub type SummarizationCache = ModelCache<SummarizationModelKey, Arc<dyn SummarizationPipeline>>;

/// The per-task caches of one worker, created once per worker lifetime
pub struct ModelCaches {
    pub chat: ChatModelCache,
    pub speech: SpeechPipelineCache,
    pub summarization: SummarizationCache,
}

impl ModelCaches {
    pub fn new() -> Self {
        Self {
            chat: ModelCache::new("chat"),
            speech: ModelCache::new("speech recognition"),
            summarization: ModelCache::new("summarization"),
        }
    }

    pub async fn dispose_all(&self) {
        self.chat.dispose().await;
        self.speech.dispose().await;
        self.summarization.dispose().await;
    }
}

impl Default for ModelCaches {
    fn default() -> Self {
        Self::new()
    }
}
