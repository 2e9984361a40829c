use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{GenerationDefaults, ServeSettings};
use crate::device_detection::{AcceleratorInventory, HardwareSource, GpuSnapshot};
use crate::error::InferenceError;
use crate::generation::{
    FragmentStream, GenerateOutcome, GenerateRequest, GenerationCoordinator, GenerationRequest,
    GenerationResult, StreamFragment,
};
use crate::loader::{AttemptFailure, ModelLoader, ModelPhase, Precision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Loading,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<Precision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
    /// Load attempts the last acquisition gave up on before settling.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_attempts: Vec<AttemptFailure>,
    pub gpus: Vec<GpuSnapshot>,
}

pub enum ServiceOutcome {
    Complete(GenerationResult),
    Stream(BoxStream<'static, StreamFragment>),
}

/// Request/response surface over the coordinator: defaults, validation,
/// deadlines, health and hardware info.
#[derive(Clone)]
pub struct InferenceService {
    coordinator: GenerationCoordinator,
    hardware: Arc<dyn HardwareSource>,
    defaults: GenerationDefaults,
    request_timeout: Duration,
    fragment_timeout: Duration,
}

impl InferenceService {
    pub fn new(
        loader: ModelLoader,
        hardware: Arc<dyn HardwareSource>,
        defaults: GenerationDefaults,
        serve: &ServeSettings,
    ) -> Self {
        Self {
            coordinator: GenerationCoordinator::new(loader, defaults.repeat_last_n),
            hardware,
            defaults,
            request_timeout: serve.request_timeout,
            fragment_timeout: serve.fragment_timeout,
        }
    }

    pub fn loader(&self) -> &ModelLoader {
        self.coordinator.loader()
    }

    pub fn coordinator(&self) -> &GenerationCoordinator {
        &self.coordinator
    }

    pub async fn health(&self) -> HealthReport {
        let loader = self.loader();
        let (status, error, precision, placement) = match loader.snapshot() {
            ModelPhase::Ready(model) => (
                HealthStatus::Ready,
                None,
                Some(model.precision),
                Some(model.placement.clone()),
            ),
            ModelPhase::Unloaded | ModelPhase::Loading => (HealthStatus::Loading, None, None, None),
            ModelPhase::Failed(message) => (HealthStatus::Failed, Some(message), None, None),
        };

        let hardware = self.hardware.clone();
        let gpus = tokio::task::spawn_blocking(move || hardware.snapshot())
            .await
            .unwrap_or_else(|e| {
                warn!("GPU snapshot failed: {}", e);
                Vec::new()
            });

        HealthReport {
            status,
            model: loader.model_id().to_string(),
            error,
            precision,
            placement,
            failed_attempts: loader.report().failures,
            gpus,
        }
    }

    pub async fn gpu_info(&self) -> AcceleratorInventory {
        let hardware = self.hardware.clone();
        tokio::task::spawn_blocking(move || hardware.detect())
            .await
            .unwrap_or_else(|e| {
                warn!("Device detection failed: {}", e);
                AcceleratorInventory::default()
            })
    }

    /// Validates `raw` and runs it, blocking or streamed by its `stream` flag.
    pub async fn generate(&self, raw: GenerateRequest) -> Result<ServiceOutcome, InferenceError> {
        let request = GenerationRequest::try_from(raw.with_defaults(&self.defaults))?;
        let timeout = self.request_timeout;

        let deadline = async {
            match tokio::time::timeout(timeout, self.coordinator.generate(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(InferenceError::Timeout(timeout.as_secs())),
            }
        };
        match deadline.await? {
            GenerateOutcome::Complete(result) => Ok(ServiceOutcome::Complete(result)),
            GenerateOutcome::Stream(stream) => Ok(ServiceOutcome::Stream(
                with_fragment_deadline(stream, self.fragment_timeout).boxed(),
            )),
        }
    }
}

/// Ends the stream with `Timeout` when the next fragment takes longer than
/// `limit`. Dropping the inner stream stops its worker.
pub fn with_fragment_deadline(
    mut stream: FragmentStream,
    limit: Duration,
) -> impl futures::Stream<Item = StreamFragment> + Send + 'static {
    async_stream::stream! {
        loop {
            match tokio::time::timeout(limit, stream.next()).await {
                Ok(Some(fragment)) => {
                    let terminal = fragment.is_terminal();
                    yield fragment;
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("No fragment within {:?}, abandoning the stream", limit);
                    yield StreamFragment::Error(InferenceError::Timeout(limit.as_secs()));
                    break;
                }
            }
        }
    }
}
