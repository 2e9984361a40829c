use candle_core::Tensor;
use std::fmt;
use std::sync::Arc;

use super::attempts::{LoadAttempt, Precision};
use crate::config::LoadSettings;
use crate::error::{InferenceError, LoadError};
use crate::generation::prompt::PromptFormat;

/// Tokenizer seam. Implementations must be usable from several decode
/// workers at once.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError>;
    fn decode(&self, tokens: &[u32]) -> Result<String, InferenceError>;
    fn eos_token_ids(&self) -> &[u32];
}

/// Per-request decode state (KV cache). Never shared between requests.
pub trait DecodeSession: Send {
    /// Runs `tokens` starting at `position` and returns the next-token
    /// logits as a 1-D f32 tensor.
    fn forward(&mut self, tokens: &[u32], position: usize) -> candle_core::Result<Tensor>;
}

/// Loaded weights, shared read-only by every request.
pub trait LanguageModel: Send + Sync {
    fn new_session(&self) -> candle_core::Result<Box<dyn DecodeSession>>;

    fn max_context_len(&self) -> usize;

    /// Devices holding the weights, e.g. `cuda:0` or `cuda:0[0..14], cuda:1[14..32]`.
    fn placement(&self) -> String;

    /// Gives cached allocations back to the device after an OOM.
    fn release_memory(&self) {}
}

pub struct EncoderBundle {
    pub encoder: Arc<dyn TextEncoder>,
    pub prompt: Arc<dyn PromptFormat>,
}

/// Loads encoders and weights. One load attempt maps to one `load_model` call.
pub trait ModelBackend: Send + Sync {
    fn load_encoder(&self, settings: &LoadSettings) -> Result<EncoderBundle, LoadError>;

    fn load_model(
        &self,
        attempt: &LoadAttempt,
        settings: &LoadSettings,
    ) -> Result<Box<dyn LanguageModel>, LoadError>;
}

/// Everything a request needs once the model is ready.
pub struct LoadedModel {
    pub model_id: String,
    pub model: Box<dyn LanguageModel>,
    pub encoder: Arc<dyn TextEncoder>,
    pub prompt: Arc<dyn PromptFormat>,
    pub precision: Precision,
    pub placement: String,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("model_id", &self.model_id)
            .field("precision", &self.precision)
            .field("placement", &self.placement)
            .field("max_context_len", &self.model.max_context_len())
            .finish()
    }
}
