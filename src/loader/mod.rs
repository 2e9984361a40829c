//! Single-flight model acquisition.
//!
//! The first trigger claims the `loading` phase and runs the load sequence on
//! a blocking worker: inventory, budget, encoder, then the fallback chain of
//! load attempts. Everyone else waits on the same state.

mod attempts;
mod backend;
mod candle;
mod files;
mod llama;
mod placement;
mod state;

pub use attempts::{plan_attempts, run_attempts, AttemptFailure, LoadAttempt, LoadReport, Precision, Target};
pub use backend::{DecodeSession, EncoderBundle, LanguageModel, LoadedModel, ModelBackend, TextEncoder};
pub use candle::CandleBackend;
pub use files::ModelSource;
pub use placement::{balance_layers, plan_placement, LayerPlacement, Stage, WeightFootprint};
pub use state::{ModelPhase, ModelState, Phase};

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{error, info};

use crate::budget;
use crate::config::{BudgetSettings, LoadSettings};
use crate::device_detection::HardwareSource;
use crate::error::{InferenceError, LoadError};

struct LoaderInner {
    state: ModelState,
    backend: Arc<dyn ModelBackend>,
    hardware: Arc<dyn HardwareSource>,
    settings: LoadSettings,
    budget: BudgetSettings,
    report: RwLock<LoadReport>,
}

#[derive(Clone)]
pub struct ModelLoader {
    inner: Arc<LoaderInner>,
}

impl ModelLoader {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        hardware: Arc<dyn HardwareSource>,
        settings: LoadSettings,
        budget: BudgetSettings,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                state: ModelState::new(),
                backend,
                hardware,
                settings,
                budget,
                report: RwLock::new(LoadReport::default()),
            }),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.inner.settings.model_id
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.phase()
    }

    pub fn snapshot(&self) -> ModelPhase {
        self.inner.state.snapshot()
    }

    pub fn report(&self) -> LoadReport {
        self.inner.report.read().clone()
    }

    /// Starts a load unless one is running or the model is ready. Returns
    /// whether this call started it. Must be called inside a tokio runtime.
    pub fn start(&self) -> bool {
        if !self.inner.state.try_claim() {
            return false;
        }
        info!("Starting model load for {}", self.inner.settings.model_id);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let worker = inner.clone();
            let outcome = match tokio::task::spawn_blocking(move || worker.load()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Model load worker aborted: {}", e);
                    ModelPhase::Failed(format!("Load worker aborted: {}", e))
                }
            };
            inner.state.finish(outcome);
        });
        true
    }

    /// Starts a load if needed and waits for it to finish.
    pub async fn acquire(&self) -> Result<Arc<LoadedModel>, InferenceError> {
        self.start();
        match self.inner.state.wait_terminal().await {
            ModelPhase::Ready(model) => Ok(model),
            ModelPhase::Failed(message) => Err(InferenceError::ModelLoadFailed(message)),
            other => Err(InferenceError::ModelUnavailable { phase: other.phase() }),
        }
    }
}

impl LoaderInner {
    fn load(&self) -> ModelPhase {
        match self.try_load() {
            Ok(model) => {
                info!(
                    "Model {} ready ({} on {})",
                    model.model_id, model.precision, model.placement
                );
                ModelPhase::Ready(Arc::new(model))
            }
            Err(e) => {
                error!("Model load failed: {}", e);
                ModelPhase::Failed(e.to_string())
            }
        }
    }

    fn try_load(&self) -> Result<LoadedModel, LoadError> {
        *self.report.write() = LoadReport::default();
        let inventory = self.hardware.detect();
        let plan = budget::plan(&inventory, &self.budget);
        info!("Sharding strategy: {}", plan.strategy);

        let EncoderBundle { encoder, prompt } = self.backend.load_encoder(&self.settings)?;

        let attempts = plan_attempts(&inventory, &plan, &self.settings);
        let (result, failures) = run_attempts(self.backend.as_ref(), &attempts, &self.settings);
        let loaded = result.map(|(model, attempt)| {
            let placement = model.placement();
            (model, attempt, placement)
        });

        let mut report = self.report.write();
        report.failures = failures;
        report.succeeded = loaded.as_ref().ok().map(|(_, attempt, _)| attempt.clone());
        drop(report);

        let (model, attempt, placement) = loaded?;
        Ok(LoadedModel {
            model_id: self.settings.model_id.clone(),
            model,
            encoder,
            prompt,
            precision: attempt.precision,
            placement,
        })
    }
}
