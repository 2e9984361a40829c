use serde::{Deserialize, Serialize};

use crate::config::GenerationDefaults;
use crate::error::InferenceError;

pub const MAX_NEW_TOKENS_LIMIT: i64 = 2048;

/// Generation request as received from the wire. Every decoding parameter
/// is optional; missing ones take the configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(default, alias = "system_prompt")]
    pub system: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<i64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub top_k: Option<i64>,
    #[serde(default)]
    pub repetition_penalty: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Fills unset parameters from `defaults`.
    pub fn with_defaults(mut self, defaults: &GenerationDefaults) -> Self {
        self.max_new_tokens.get_or_insert(defaults.max_new_tokens as i64);
        self.temperature.get_or_insert(defaults.temperature);
        self.top_p.get_or_insert(defaults.top_p);
        self.top_k.get_or_insert(defaults.top_k as i64);
        self.repetition_penalty.get_or_insert(defaults.repetition_penalty);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    /// 0 disables top-k.
    pub top_k: usize,
    pub repetition_penalty: f32,
}

impl SamplingParams {
    pub fn do_sample(&self) -> bool {
        self.temperature > 0.0
    }
}

/// A request whose parameters are known to be in range.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    system: Option<String>,
    max_new_tokens: usize,
    sampling: SamplingParams,
    stream: bool,
    seed: Option<u64>,
    session_id: Option<String>,
}

impl GenerationRequest {
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn system(&self) -> Option<&str> {
        self.system.as_deref()
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn sampling(&self) -> SamplingParams {
        self.sampling
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<f64, InferenceError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(InferenceError::invalid(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )))
    }
}

impl TryFrom<GenerateRequest> for GenerationRequest {
    type Error = InferenceError;

    fn try_from(raw: GenerateRequest) -> Result<Self, Self::Error> {
        let raw = raw.with_defaults(&GenerationDefaults::default());

        if raw.prompt.trim().is_empty() {
            return Err(InferenceError::invalid("prompt must not be empty"));
        }

        let max_new_tokens = raw.max_new_tokens.unwrap_or_default();
        if !(1..=MAX_NEW_TOKENS_LIMIT).contains(&max_new_tokens) {
            return Err(InferenceError::invalid(format!(
                "max_new_tokens must be between 1 and {}, got {}",
                MAX_NEW_TOKENS_LIMIT, max_new_tokens
            )));
        }

        let temperature = check_range("temperature", raw.temperature.unwrap_or_default(), 0.0, 2.0)?;
        let top_p = check_range("top_p", raw.top_p.unwrap_or_default(), 0.0, 1.0)?;
        let repetition_penalty = check_range(
            "repetition_penalty",
            raw.repetition_penalty.unwrap_or_default(),
            0.5,
            2.0,
        )?;

        let top_k = raw.top_k.unwrap_or_default();
        if top_k < 0 {
            return Err(InferenceError::invalid(format!("top_k must be >= 0, got {}", top_k)));
        }

        Ok(Self {
            prompt: raw.prompt,
            system: raw.system,
            max_new_tokens: max_new_tokens as usize,
            sampling: SamplingParams {
                temperature,
                top_p,
                top_k: top_k as usize,
                repetition_penalty: repetition_penalty as f32,
            },
            stream: raw.stream,
            seed: raw.seed,
            session_id: raw.session_id,
        })
    }
}

/// Completed generation. The text is exactly what a stream of the same
/// request would have delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_generated: usize,
    pub elapsed_seconds: f64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}
