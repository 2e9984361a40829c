use candle_core::Tensor;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;

use super::request::SamplingParams;

/// Picks the next token from a logits vector.
pub struct Sampler {
    processor: LogitsProcessor,
    repetition_penalty: f32,
    repeat_last_n: usize,
}

impl Sampler {
    pub fn new(params: SamplingParams, seed: u64, repeat_last_n: usize) -> Self {
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling_for(params)),
            repetition_penalty: params.repetition_penalty,
            repeat_last_n,
        }
    }

    /// `history` is every token seen so far, prompt included.
    pub fn next_token(&mut self, logits: &Tensor, history: &[u32]) -> candle_core::Result<u32> {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON || self.repeat_last_n == 0 {
            return self.processor.sample(logits);
        }
        let start = history.len().saturating_sub(self.repeat_last_n);
        let penalized = apply_repeat_penalty(logits, self.repetition_penalty, &history[start..])?;
        self.processor.sample(&penalized)
    }
}

/// Temperature 0 is greedy; otherwise top-k and top-p apply together when set.
/// A nucleus of `top_p <= 0` still keeps the single most likely token.
pub fn sampling_for(params: SamplingParams) -> Sampling {
    if !params.do_sample() || params.top_p <= 0.0 || params.top_k == 1 {
        return Sampling::ArgMax;
    }
    let temperature = params.temperature;
    let top_p_active = params.top_p < 1.0;
    match (params.top_k, top_p_active) {
        (0, false) => Sampling::All { temperature },
        (0, true) => Sampling::TopP {
            p: params.top_p,
            temperature,
        },
        (k, false) => Sampling::TopK { k, temperature },
        (k, true) => Sampling::TopKThenTopP {
            k,
            p: params.top_p,
            temperature,
        },
    }
}
