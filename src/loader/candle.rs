use candle_core::quantized::gguf_file;
use candle_core::{DType, Device};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use super::attempts::{LoadAttempt, Precision, Target};
use super::backend::{EncoderBundle, LanguageModel, ModelBackend, TextEncoder};
use super::files::{resolve_gguf, total_size, ModelSource};
use super::llama::{gguf_footprint, DeviceLayout, LlamaShape, PipelinedLlama};
use super::placement::{plan_placement, LayerPlacement};
use crate::config::LoadSettings;
use crate::device_detection::DeviceKind;
use crate::error::{InferenceError, LoadError};
use crate::generation::prompt::{ChatTemplateFormat, PlainFormat, PromptFormat};

/// Token strings that end generation in the common chat vocabularies.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|eot_id|>", "<|im_end|>", "<|end|>"];

/// Llama-family backend on candle. Quantized weights come from GGUF,
/// half and full precision from safetensors. Balanced attempts split the
/// blocks over several devices.
#[derive(Debug, Clone, Default)]
pub struct CandleBackend;

impl ModelBackend for CandleBackend {
    fn load_encoder(&self, settings: &LoadSettings) -> Result<EncoderBundle, LoadError> {
        let source = ModelSource::open(settings)?;
        let tokenizer_path = source.get("tokenizer.json")?;
        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| LoadError::Tokenizer(e.to_string()))?;

        let tokenizer_config = match source.get("tokenizer_config.json") {
            Ok(path) => TokenizerConfig::read(&path),
            Err(e) => {
                debug!("No tokenizer_config.json: {}", e);
                TokenizerConfig::default()
            }
        };

        let mut eos_token_ids: Vec<u32> = tokenizer_config
            .eos_token
            .iter()
            .map(String::as_str)
            .chain(EOS_CANDIDATES.iter().copied())
            .filter_map(|token| tokenizer.token_to_id(token))
            .collect();
        eos_token_ids.sort_unstable();
        eos_token_ids.dedup();
        if eos_token_ids.is_empty() {
            warn!("Tokenizer has no known end-of-sequence token; generation stops at max_new_tokens");
        }

        let prompt: Arc<dyn PromptFormat> = match tokenizer_config.chat_template {
            Some(template) => Arc::new(ChatTemplateFormat::new(
                template,
                tokenizer_config.bos_token.unwrap_or_default(),
                tokenizer_config.eos_token.unwrap_or_default(),
            )),
            None => {
                info!("No chat template found, using the plain prompt format");
                Arc::new(PlainFormat)
            }
        };

        Ok(EncoderBundle {
            encoder: Arc::new(TokenizerEncoder {
                tokenizer,
                eos_token_ids,
            }),
            prompt,
        })
    }

    fn load_model(
        &self,
        attempt: &LoadAttempt,
        settings: &LoadSettings,
    ) -> Result<Box<dyn LanguageModel>, LoadError> {
        let model = match attempt.precision {
            Precision::Quantized => load_gguf(attempt, settings)?,
            Precision::Half => {
                let dtype = settings.half_dtype;
                if attempt.target == Target::Host && dtype == DType::F16 {
                    return Err(LoadError::Unsupported("f16 matmul is not supported on the host".into()));
                }
                load_safetensors(attempt, settings, dtype)?
            }
            Precision::Full => load_safetensors(attempt, settings, DType::F32)?,
        };
        Ok(Box::new(model))
    }
}

fn load_gguf(attempt: &LoadAttempt, settings: &LoadSettings) -> Result<PipelinedLlama, LoadError> {
    let path = resolve_gguf(settings)?;
    let mut file = std::fs::File::open(&path)?;
    let content = gguf_file::Content::read(&mut file).map_err(|e| e.with_path(&path))?;
    let shape = LlamaShape::from_gguf(&content)?;
    let placement = plan_placement(attempt, &gguf_footprint(&content, shape.num_layers))?;
    info!(
        "Loading {} ({} tensors, context {}) on {}",
        path.display(),
        content.tensor_infos.len(),
        shape.max_position_embeddings,
        placement
    );
    let layout = open_layout(&placement)?;
    PipelinedLlama::from_gguf(&content, &mut file, &shape, layout)
}

fn load_safetensors(attempt: &LoadAttempt, settings: &LoadSettings, dtype: DType) -> Result<PipelinedLlama, LoadError> {
    let source = ModelSource::open(settings)?;
    let shape = LlamaShape::from_hf_config(&std::fs::read(source.get("config.json")?)?)?;
    let filenames = source.safetensors()?;
    let placement = plan_placement(attempt, &shape.dense_footprint(dtype))?;
    info!(
        "Loading {} safetensors file(s), {} bytes on disk, as {:?} on {}",
        filenames.len(),
        total_size(&filenames)?,
        dtype,
        placement
    );
    let layout = open_layout(&placement)?;
    let use_flash_attn = settings.use_flash_attn && cfg!(feature = "flash-attn");
    PipelinedLlama::from_safetensors(&filenames, &shape, dtype, layout, use_flash_attn)
}

/// Opens each distinct device of a placement once.
fn open_layout(placement: &LayerPlacement) -> Result<DeviceLayout, LoadError> {
    let mut opened: Vec<(Target, Device)> = Vec::new();
    let mut device_for = |target: &Target| -> Result<Device, LoadError> {
        if let Some((_, device)) = opened.iter().find(|(t, _)| t == target) {
            return Ok(device.clone());
        }
        let device = create_device(target)?;
        opened.push((target.clone(), device.clone()));
        Ok(device)
    };

    let head = device_for(&placement.head)?;
    let mut stages = Vec::with_capacity(placement.stages.len());
    for stage in &placement.stages {
        stages.push((device_for(&stage.target)?, stage.layers.clone()));
    }
    Ok(DeviceLayout {
        head,
        stages,
        label: placement.to_string(),
    })
}

fn create_device(target: &Target) -> Result<Device, LoadError> {
    let device = match target {
        Target::Host => Device::Cpu,
        Target::Accelerator {
            index,
            kind: DeviceKind::Cuda,
        } => Device::new_cuda(*index).map_err(|e| LoadError::Device(e.to_string()))?,
        Target::Accelerator {
            index,
            kind: DeviceKind::Metal,
        } => Device::new_metal(*index).map_err(|e| LoadError::Device(e.to_string()))?,
        Target::Balanced { .. } => {
            return Err(LoadError::Device(format!("{} is not a single device", target)));
        }
    };
    Ok(device)
}

#[derive(Debug, Default)]
struct TokenizerConfig {
    chat_template: Option<String>,
    bos_token: Option<String>,
    eos_token: Option<String>,
}

impl TokenizerConfig {
    fn read(path: &Path) -> Self {
        let json = match std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        {
            Some(json) => json,
            None => {
                warn!("Failed to parse {}, ignoring it", path.display());
                return Self::default();
            }
        };

        Self {
            chat_template: chat_template_of(&json["chat_template"]),
            bos_token: special_token(&json["bos_token"]),
            eos_token: special_token(&json["eos_token"]),
        }
    }
}

/// Special tokens are either plain strings or `{"content": ...}` objects.
fn special_token(value: &Value) -> Option<String> {
    match value {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// A chat template is a string or a list of named templates.
fn chat_template_of(value: &Value) -> Option<String> {
    match value {
        Value::String(template) => Some(template.clone()),
        Value::Array(templates) => {
            let named = |name: &str| {
                templates.iter().find_map(|t| {
                    (t["name"].as_str() == Some(name))
                        .then(|| t["template"].as_str().map(str::to_string))
                        .flatten()
                })
            };
            named("default").or_else(|| {
                templates
                    .first()
                    .and_then(|t| t["template"].as_str().map(str::to_string))
            })
        }
        _ => None,
    }
}

struct TokenizerEncoder {
    tokenizer: Tokenizer,
    eos_token_ids: Vec<u32>,
}

impl TextEncoder for TokenizerEncoder {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>, InferenceError> {
        self.tokenizer
            .encode(text, add_special_tokens)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| InferenceError::invalid(format!("Tokenization failed: {}", e)))
    }

    fn decode(&self, tokens: &[u32]) -> Result<String, InferenceError> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| InferenceError::GenerationFailure(format!("Detokenization failed: {}", e)))
    }

    fn eos_token_ids(&self) -> &[u32] {
        &self.eos_token_ids
    }
}
