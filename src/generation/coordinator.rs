use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};
use uuid::Uuid;

use super::decode::{prepare_prompt, run_decode, DecodeOutcome};
use super::request::{GenerationRequest, GenerationResult};
use super::stream::{FragmentStream, StreamFragment};
use crate::error::InferenceError;
use crate::loader::{LoadedModel, ModelLoader, ModelPhase, Phase};

pub enum GenerateOutcome {
    Complete(GenerationResult),
    Stream(FragmentStream),
}

/// Runs generation requests against the loaded model. Holds no lock of its
/// own; every request gets its own decode session on a blocking worker.
#[derive(Clone)]
pub struct GenerationCoordinator {
    loader: ModelLoader,
    repeat_last_n: usize,
}

/// Sets the flag when the awaiting future is dropped, so an abandoned
/// blocking generation stops at its next token.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl GenerationCoordinator {
    pub fn new(loader: ModelLoader, repeat_last_n: usize) -> Self {
        Self {
            loader,
            repeat_last_n,
        }
    }

    pub fn loader(&self) -> &ModelLoader {
        &self.loader
    }

    /// The ready model, or the error matching the current phase. An
    /// unloaded model gets a load started.
    fn ready_model(&self) -> Result<Arc<LoadedModel>, InferenceError> {
        match self.loader.snapshot() {
            ModelPhase::Ready(model) => Ok(model),
            ModelPhase::Unloaded => {
                self.loader.start();
                Err(InferenceError::ModelUnavailable {
                    phase: Phase::Unloaded,
                })
            }
            ModelPhase::Loading => Err(InferenceError::ModelUnavailable {
                phase: Phase::Loading,
            }),
            ModelPhase::Failed(message) => Err(InferenceError::ModelLoadFailed(message)),
        }
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerateOutcome, InferenceError> {
        if request.stream() {
            self.generate_streaming(request).await.map(GenerateOutcome::Stream)
        } else {
            self.generate_blocking(request).await.map(GenerateOutcome::Complete)
        }
    }

    pub async fn generate_blocking(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, InferenceError> {
        let loaded = self.ready_model()?;
        let request_id = Uuid::new_v4();
        let seed = request.seed().unwrap_or_else(rand::random);

        let cancelled = Arc::new(AtomicBool::new(false));
        let _guard = CancelOnDrop(cancelled.clone());
        let repeat_last_n = self.repeat_last_n;
        let worker_model = loaded.clone();
        let worker_request = request.clone();

        let outcome = tokio::task::spawn_blocking(move || {
            let prompt_tokens = prepare_prompt(&worker_model, &worker_request)?;
            info!(
                "Generation {} started: {} prompt tokens, max_new_tokens {}",
                request_id,
                prompt_tokens.len(),
                worker_request.max_new_tokens()
            );
            let mut sink = |_: &str| {
                if cancelled.load(Ordering::Relaxed) {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            };
            run_decode(
                &worker_model,
                &worker_request,
                prompt_tokens,
                seed,
                repeat_last_n,
                &mut sink,
            )
        })
        .await
        .map_err(|e| InferenceError::GenerationFailure(format!("decode worker panicked: {}", e)))?;

        match outcome {
            Ok(outcome) => {
                log_finished(request_id, &outcome);
                Ok(GenerationResult {
                    text: outcome.text,
                    tokens_generated: outcome.tokens_generated,
                    elapsed_seconds: outcome.elapsed_seconds,
                    model: loaded.model_id.clone(),
                    session_id: request.session_id().map(str::to_string),
                })
            }
            Err(e) => {
                error!("Generation {} failed: {}", request_id, e);
                Err(e)
            }
        }
    }

    /// Starts a decode worker and returns its fragments as a stream. Errors
    /// found before decoding starts are returned directly; later ones arrive
    /// as the stream's terminal item.
    pub async fn generate_streaming(&self, request: GenerationRequest) -> Result<FragmentStream, InferenceError> {
        let loaded = self.ready_model()?;
        let request_id = Uuid::new_v4();
        let seed = request.seed().unwrap_or_else(rand::random);
        let repeat_last_n = self.repeat_last_n;

        let (tx, rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = oneshot::channel();
        let worker = tokio::task::spawn_blocking(move || {
            let prompt_tokens = match prepare_prompt(&loaded, &request) {
                Ok(tokens) => tokens,
                Err(e) => {
                    let _ = started_tx.send(Err(e));
                    return;
                }
            };
            info!(
                "Streaming generation {} started: {} prompt tokens, max_new_tokens {}",
                request_id,
                prompt_tokens.len(),
                request.max_new_tokens()
            );
            let _ = started_tx.send(Ok(()));

            let mut sink = |fragment: &str| match tx.send(StreamFragment::Text(fragment.to_string())) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            };
            let terminal = match run_decode(&loaded, &request, prompt_tokens, seed, repeat_last_n, &mut sink) {
                Ok(outcome) => {
                    log_finished(request_id, &outcome);
                    StreamFragment::End
                }
                Err(e) => {
                    error!("Streaming generation {} failed: {}", request_id, e);
                    StreamFragment::Error(e)
                }
            };
            // The consumer may already be gone.
            let _ = tx.send(terminal);
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(FragmentStream::new(rx, worker)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(InferenceError::GenerationFailure(
                "decode worker exited before starting".to_string(),
            )),
        }
    }
}

fn log_finished(request_id: Uuid, outcome: &DecodeOutcome) {
    let rate = if outcome.elapsed_seconds > 0.0 {
        outcome.tokens_generated as f64 / outcome.elapsed_seconds
    } else {
        0.0
    };
    info!(
        "Generation {} finished: {} tokens in {:.2}s ({:.1} tok/s, {:?})",
        request_id, outcome.tokens_generated, outcome.elapsed_seconds, rate, outcome.stop
    );
}
