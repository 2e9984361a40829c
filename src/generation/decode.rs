use std::ops::ControlFlow;
use std::time::Instant;
use tracing::{debug, warn};

use super::request::GenerationRequest;
use super::sampling::Sampler;
use crate::error::InferenceError;
use crate::loader::{DecodeSession, LoadedModel, TextEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxNewTokens,
    ContextLimit,
    /// The consumer went away.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutcome {
    pub text: String,
    pub tokens_generated: usize,
    pub stop: StopReason,
    pub elapsed_seconds: f64,
}

/// Renders and tokenizes the prompt, rejecting prompts that leave no room
/// in the context window.
pub fn prepare_prompt(
    loaded: &LoadedModel,
    request: &GenerationRequest,
) -> Result<Vec<u32>, InferenceError> {
    let rendered = loaded.prompt.render(request.system(), request.prompt());
    let tokens = loaded
        .encoder
        .encode(&rendered.text, !rendered.has_special_tokens)?;
    if tokens.is_empty() {
        return Err(InferenceError::invalid("prompt encodes to zero tokens"));
    }
    let context = loaded.model.max_context_len();
    if tokens.len() >= context {
        return Err(InferenceError::invalid(format!(
            "prompt is {} tokens but the model context is {} tokens",
            tokens.len(),
            context
        )));
    }
    Ok(tokens)
}

/// Runs one generation to completion on the calling thread. Each text
/// fragment goes to `sink` as soon as it decodes cleanly; the returned text
/// is the concatenation of those fragments.
pub fn run_decode(
    loaded: &LoadedModel,
    request: &GenerationRequest,
    prompt_tokens: Vec<u32>,
    seed: u64,
    repeat_last_n: usize,
    sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<DecodeOutcome, InferenceError> {
    let started = Instant::now();

    let mut session = match loaded.model.new_session() {
        Ok(session) => session,
        Err(e) => return Err(recover(loaded, e.into())),
    };
    let mut sampler = Sampler::new(request.sampling(), seed, repeat_last_n);
    let result = decode_steps(
        session.as_mut(),
        loaded,
        &mut sampler,
        prompt_tokens,
        request.max_new_tokens(),
        sink,
    );
    drop(session);

    let (text, tokens_generated, stop) = result.map_err(|e| recover(loaded, e))?;
    let elapsed_seconds = started.elapsed().as_secs_f64();
    debug!(
        "Decoded {} tokens in {:.2}s ({:?})",
        tokens_generated, elapsed_seconds, stop
    );
    Ok(DecodeOutcome {
        text,
        tokens_generated,
        stop,
        elapsed_seconds,
    })
}

/// Called with the session already dropped.
fn recover(loaded: &LoadedModel, error: InferenceError) -> InferenceError {
    if let InferenceError::AcceleratorOutOfMemory(message) = &error {
        warn!("Accelerator out of memory, releasing cached memory: {}", message);
        loaded.model.release_memory();
    }
    error
}

fn decode_steps(
    session: &mut dyn DecodeSession,
    loaded: &LoadedModel,
    sampler: &mut Sampler,
    prompt_tokens: Vec<u32>,
    max_new_tokens: usize,
    sink: &mut dyn FnMut(&str) -> ControlFlow<()>,
) -> Result<(String, usize, StopReason), InferenceError> {
    let encoder = loaded.encoder.as_ref();
    let eos = encoder.eos_token_ids();
    let room = loaded.model.max_context_len().saturating_sub(prompt_tokens.len());
    let limit = max_new_tokens.min(room);
    let mut stop = if limit < max_new_tokens {
        StopReason::ContextLimit
    } else {
        StopReason::MaxNewTokens
    };

    let mut history = prompt_tokens;
    let mut decoder = IncrementalDecoder::new(encoder);
    let mut text = String::new();
    let mut logits = session.forward(&history, 0)?;

    for step in 0..limit {
        let next = sampler.next_token(&logits, &history)?;
        if eos.contains(&next) {
            stop = StopReason::EndOfSequence;
            break;
        }
        history.push(next);

        if let Some(fragment) = decoder.push(next)? {
            text.push_str(&fragment);
            if sink(&fragment).is_break() {
                stop = StopReason::Cancelled;
                break;
            }
        }

        if step + 1 < limit {
            logits = session.forward(&[next], history.len() - 1)?;
        }
    }

    if stop != StopReason::Cancelled {
        if let Some(rest) = decoder.flush()? {
            text.push_str(&rest);
            // Nothing follows the final fragment, so a closed sink changes nothing.
            let _ = sink(&rest);
        }
    }

    Ok((text, decoder.len(), stop))
}

/// Turns a growing token sequence into text deltas. Decodes the whole
/// sequence each step so multi-token characters and tokenizer spacing come
/// out right, and holds back output while it ends in a partial character.
pub struct IncrementalDecoder<'a> {
    encoder: &'a dyn TextEncoder,
    tokens: Vec<u32>,
    emitted: usize,
}

impl<'a> IncrementalDecoder<'a> {
    pub fn new(encoder: &'a dyn TextEncoder) -> Self {
        Self {
            encoder,
            tokens: Vec::new(),
            emitted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn push(&mut self, token: u32) -> Result<Option<String>, InferenceError> {
        self.tokens.push(token);
        let text = self.encoder.decode(&self.tokens)?;
        if text.ends_with('\u{FFFD}') {
            return Ok(None);
        }
        Ok(self.take_new(&text))
    }

    /// Whatever is still held back, replacement characters included.
    pub fn flush(&mut self) -> Result<Option<String>, InferenceError> {
        if self.tokens.is_empty() {
            return Ok(None);
        }
        let text = self.encoder.decode(&self.tokens)?;
        Ok(self.take_new(&text))
    }

    fn take_new(&mut self, text: &str) -> Option<String> {
        if text.len() <= self.emitted || !text.is_char_boundary(self.emitted) {
            return None;
        }
        let fragment = text[self.emitted..].to_string();
        self.emitted = text.len();
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationDefaults;
    use crate::generation::prompt::ChatTemplateFormat;
    use crate::generation::request::GenerateRequest;
    use crate::loader::{LanguageModel, Precision};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Each token is one byte of UTF-8.
    struct Bytes;

    impl TextEncoder for Bytes {
        fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn decode(&self, tokens: &[u32]) -> Result<String, InferenceError> {
            let bytes: Vec<u8> = tokens.iter().map(|&t| t as u8).collect();
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }

        fn eos_token_ids(&self) -> &[u32] {
            &[]
        }
    }

    #[test]
    fn test_multibyte_character_is_held_back() {
        let mut decoder = IncrementalDecoder::new(&Bytes);
        let mut out = Vec::new();
        for byte in "aé".bytes() {
            out.push(decoder.push(u32::from(byte)).unwrap());
        }
        assert_eq!(out, vec![Some("a".to_string()), None, Some("é".to_string())]);
        assert_eq!(decoder.flush().unwrap(), None);
    }

    #[test]
    fn test_flush_releases_dangling_bytes() {
        let mut decoder = IncrementalDecoder::new(&Bytes);
        assert_eq!(decoder.push(u32::from(b'x')).unwrap(), Some("x".to_string()));
        assert_eq!(decoder.push(0xE2).unwrap(), None);
        assert_eq!(decoder.flush().unwrap(), Some("\u{FFFD}".to_string()));
        assert_eq!(decoder.len(), 2);
    }

    /// Remembers the `add_special_tokens` flag of every encode call.
    #[derive(Default)]
    struct Recording {
        special: Mutex<Vec<bool>>,
    }

    impl TextEncoder for Recording {
        fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
            self.special.lock().push(add_special_tokens);
            Bytes.encode(text, add_special_tokens)
        }

        fn decode(&self, tokens: &[u32]) -> Result<String, InferenceError> {
            Bytes.decode(tokens)
        }

        fn eos_token_ids(&self) -> &[u32] {
            &[]
        }
    }

    struct NoWeights;

    impl LanguageModel for NoWeights {
        fn new_session(&self) -> candle_core::Result<Box<dyn DecodeSession>> {
            candle_core::bail!("no weights")
        }

        fn max_context_len(&self) -> usize {
            4096
        }

        fn placement(&self) -> String {
            "cpu".to_string()
        }
    }

    fn loaded_with(template: &str, encoder: Arc<Recording>) -> LoadedModel {
        LoadedModel {
            model_id: "test".to_string(),
            model: Box::new(NoWeights),
            encoder,
            prompt: Arc::new(ChatTemplateFormat::new(
                template.to_string(),
                "<s>".to_string(),
                "</s>".to_string(),
            )),
            precision: Precision::Full,
            placement: "cpu".to_string(),
        }
    }

    fn request(system: Option<&str>) -> GenerationRequest {
        let wire = GenerateRequest {
            system: system.map(str::to_string),
            ..GenerateRequest::new("hi")
        };
        GenerationRequest::try_from(wire.with_defaults(&GenerationDefaults::default())).unwrap()
    }

    const MISTRAL: &str = "{% if messages[0].role == 'system' %}{{ raise_exception('System role not supported') }}{% endif %}{{ bos_token }}[INST] {{ messages[0].content }} [/INST]";

    #[test]
    fn test_template_with_bos_skips_tokenizer_special_tokens() {
        let encoder = Arc::new(Recording::default());
        let loaded = loaded_with(MISTRAL, encoder.clone());
        let tokens = prepare_prompt(&loaded, &request(None)).unwrap();
        assert!(tokens.starts_with(&Bytes.encode("<s>[INST]", false).unwrap()));
        assert_eq!(*encoder.special.lock(), vec![false]);
    }

    #[test]
    fn test_template_fallback_asks_tokenizer_for_special_tokens() {
        let encoder = Arc::new(Recording::default());
        let loaded = loaded_with(MISTRAL, encoder.clone());
        let tokens = prepare_prompt(&loaded, &request(Some("Be brief."))).unwrap();
        assert!(!tokens.starts_with(&Bytes.encode("<s>", false).unwrap()));
        assert_eq!(*encoder.special.lock(), vec![true]);
    }
}
