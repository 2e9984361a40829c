use serde::Serialize;

use crate::loader::Phase;

/// Outcome kinds a caller of the coordinator can observe.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InferenceError {
    #[error("Model is not ready ({phase}), retry later")]
    ModelUnavailable { phase: Phase },
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),
    #[error("Accelerator out of memory: {0}")]
    AcceleratorOutOfMemory(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Generation failed: {0}")]
    GenerationFailure(String),
    #[error("Timed out after {0} seconds")]
    Timeout(u64),
}

impl InferenceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ModelUnavailable { .. } => ErrorKind::ModelUnavailable,
            Self::ModelLoadFailed(_) => ErrorKind::ModelLoadFailed,
            Self::AcceleratorOutOfMemory(_) => ErrorKind::AcceleratorOutOfMemory,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::GenerationFailure(_) => ErrorKind::GenerationFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether the caller may succeed by retrying later without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable { .. } | Self::AcceleratorOutOfMemory(_) | Self::Timeout(_)
        )
    }
}

impl From<candle_core::Error> for InferenceError {
    fn from(err: candle_core::Error) -> Self {
        let message = err.to_string();
        if is_out_of_memory(&message) {
            Self::AcceleratorOutOfMemory(message)
        } else {
            Self::GenerationFailure(message)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelUnavailable,
    ModelLoadFailed,
    AcceleratorOutOfMemory,
    InvalidRequest,
    GenerationFailure,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelUnavailable => "MODEL_UNAVAILABLE",
            ErrorKind::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorKind::AcceleratorOutOfMemory => "ACCELERATOR_OUT_OF_MEMORY",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::GenerationFailure => "GENERATION_FAILURE",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }
}

/// Failure of a single load attempt, or of the whole acquisition.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model files unavailable: {0}")]
    Files(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Device error: {0}")]
    Device(String),
    #[error("Model needs {needed} bytes but the memory budget allows {ceiling} bytes")]
    ExceedsBudget { needed: u64, ceiling: u64 },
    #[error("Unsupported model: {0}")]
    Unsupported(String),
    #[error("Candle core error: {0}")]
    CandleCore(#[from] candle_core::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("All load attempts failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

/// CUDA and Metal report exhaustion through driver strings only.
pub fn is_out_of_memory(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("out of memory")
        || lower.contains("out_of_memory")
        || lower.contains("outofmemory")
        || lower.contains("failed to allocate")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cuda_oom_is_classified() {
        let err = candle_core::Error::Msg("DriverError(CUDA_ERROR_OUT_OF_MEMORY, \"out of memory\")".into());
        assert_eq!(InferenceError::from(err).kind(), ErrorKind::AcceleratorOutOfMemory);
    }

    #[test]
    fn test_other_candle_errors_are_generation_failures() {
        let err = candle_core::Error::Msg("shape mismatch in matmul".into());
        let converted = InferenceError::from(err);
        assert_eq!(converted.kind(), ErrorKind::GenerationFailure);
        assert!(!converted.is_retryable());
    }

    #[test]
    fn test_exhausted_lists_every_attempt() {
        let err = LoadError::Exhausted(vec!["quantized: missing gguf".into(), "f16: oom".into()]);
        assert_eq!(
            err.to_string(),
            "All load attempts failed: quantized: missing gguf; f16: oom"
        );
    }
}
