// Resettable interruption flag for chat generation.
//
// A `CancellationToken` cannot be un-cancelled, so reset swaps in a fresh
// token. Generations hold a clone of the token current at their start.

use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct StoppingCriteria {
    current: Arc<Mutex<CancellationToken>>,
}

impl StoppingCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running generation to stop at its next step
    pub fn interrupt(&self) {
        self.lock().cancel();
    }

    /// Clear a pending interrupt so the next generation runs to completion
    pub fn reset(&self) {
        let mut current = self.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().is_cancelled()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
