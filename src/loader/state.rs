use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use super::backend::LoadedModel;

/// Lifecycle phase of the process-wide model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unloaded => "unloaded",
            Phase::Loading => "loading",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Phase together with what it owns: the loaded handles when ready, the
/// last error when failed.
#[derive(Clone)]
pub enum ModelPhase {
    Unloaded,
    Loading,
    Ready(Arc<LoadedModel>),
    Failed(String),
}

impl ModelPhase {
    pub fn phase(&self) -> Phase {
        match self {
            ModelPhase::Unloaded => Phase::Unloaded,
            ModelPhase::Loading => Phase::Loading,
            ModelPhase::Ready(_) => Phase::Ready,
            ModelPhase::Failed(_) => Phase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModelPhase::Ready(_) | ModelPhase::Failed(_))
    }
}

impl fmt::Debug for ModelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelPhase::Ready(model) => f.debug_tuple("Ready").field(&model.model_id).finish(),
            ModelPhase::Failed(message) => f.debug_tuple("Failed").field(message).finish(),
            other => write!(f, "{:?}", other.phase()),
        }
    }
}

/// Shared model state. Every transition goes through the watch sender, so
/// readers always see a whole phase and waiters are woken on change.
#[derive(Clone)]
pub struct ModelState {
    tx: Arc<watch::Sender<ModelPhase>>,
}

impl Default for ModelState {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelState {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ModelPhase::Unloaded);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> ModelPhase {
        (*self.tx.borrow()).clone()
    }

    pub fn phase(&self) -> Phase {
        self.tx.borrow().phase()
    }

    /// Moves `unloaded` or `failed` to `loading`. Returns false when a load
    /// is already running or the model is ready; only one caller wins.
    pub fn try_claim(&self) -> bool {
        self.tx.send_if_modified(|phase| match phase {
            ModelPhase::Unloaded | ModelPhase::Failed(_) => {
                *phase = ModelPhase::Loading;
                true
            }
            ModelPhase::Loading | ModelPhase::Ready(_) => false,
        })
    }

    /// Publishes the outcome of the load that holds the claim.
    pub fn finish(&self, outcome: ModelPhase) {
        debug_assert!(outcome.is_terminal());
        self.tx.send_replace(outcome);
    }

    /// Waits until the phase is `ready` or `failed`.
    pub async fn wait_terminal(&self) -> ModelPhase {
        let mut rx = self.tx.subscribe();
        let phase = match rx.wait_for(ModelPhase::is_terminal).await {
            Ok(phase) => (*phase).clone(),
            // The sender lives as long as `self`.
            Err(_) => self.snapshot(),
        };
        phase
    }
}
