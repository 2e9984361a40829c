//! Llama-family decoder run as a pipeline of stages.
//!
//! Each stage holds a contiguous run of blocks on one device and the hidden
//! state hops from stage to stage. The embedding, final norm and output head
//! live on the head device. Quantized weights come from GGUF, dense ones from
//! safetensors; both end up in the same block layout.

use candle_core::quantized::{gguf_file, QMatMul};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};
use candle_transformers::utils::repeat_kv;
use serde::Deserialize;
use std::io::{Read, Seek};
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use super::backend::{DecodeSession, LanguageModel};
use super::placement::WeightFootprint;
use crate::error::LoadError;

const DEFAULT_CONTEXT_LEN: usize = 4096;
const DEFAULT_ROPE_THETA: f32 = 10_000.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LlamaShape {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f32,
    pub max_position_embeddings: usize,
    pub tie_word_embeddings: bool,
}

fn default_rope_theta() -> f32 {
    DEFAULT_ROPE_THETA
}

fn default_context_len() -> usize {
    DEFAULT_CONTEXT_LEN
}

#[derive(Debug, Deserialize)]
struct HfLlamaConfig {
    hidden_size: usize,
    intermediate_size: usize,
    vocab_size: usize,
    num_hidden_layers: usize,
    num_attention_heads: usize,
    num_key_value_heads: Option<usize>,
    rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    rope_theta: f32,
    #[serde(default = "default_context_len")]
    max_position_embeddings: usize,
    #[serde(default)]
    tie_word_embeddings: bool,
}

impl LlamaShape {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    fn kv_dim(&self) -> usize {
        self.num_kv_heads * self.head_dim()
    }

    pub fn from_hf_config(json: &[u8]) -> Result<Self, LoadError> {
        let config: HfLlamaConfig = serde_json::from_slice(json)
            .map_err(|e| LoadError::Unsupported(format!("config.json: {}", e)))?;
        Self {
            hidden_size: config.hidden_size,
            intermediate_size: config.intermediate_size,
            vocab_size: config.vocab_size,
            num_layers: config.num_hidden_layers,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads.unwrap_or(config.num_attention_heads),
            rms_norm_eps: config.rms_norm_eps,
            rope_theta: config.rope_theta,
            max_position_embeddings: config.max_position_embeddings,
            tie_word_embeddings: config.tie_word_embeddings,
        }
        .validated()
    }

    pub fn from_gguf(content: &gguf_file::Content) -> Result<Self, LoadError> {
        let value = |key: &str| {
            content
                .metadata
                .get(key)
                .ok_or_else(|| LoadError::Unsupported(format!("GGUF metadata has no {}", key)))
        };
        let count = |key: &str| -> Result<usize, LoadError> { Ok(value(key)?.to_u32()? as usize) };

        let num_heads = count("llama.attention.head_count")?;
        let vocab_size = content
            .tensor_infos
            .get("token_embd.weight")
            .and_then(|info| info.shape.dims().first().copied())
            .ok_or_else(|| LoadError::Unsupported("GGUF file has no token_embd.weight".to_string()))?;
        Self {
            hidden_size: count("llama.embedding_length")?,
            intermediate_size: count("llama.feed_forward_length")?,
            vocab_size,
            num_layers: count("llama.block_count")?,
            num_heads,
            num_kv_heads: count("llama.attention.head_count_kv").unwrap_or(num_heads),
            rms_norm_eps: value("llama.attention.layer_norm_rms_epsilon")?.to_f32()? as f64,
            rope_theta: content
                .metadata
                .get("llama.rope.freq_base")
                .and_then(|v| v.to_f32().ok())
                .unwrap_or(DEFAULT_ROPE_THETA),
            max_position_embeddings: count("llama.context_length").unwrap_or(DEFAULT_CONTEXT_LEN),
            tie_word_embeddings: !content.tensor_infos.contains_key("output.weight"),
        }
        .validated()
    }

    fn validated(self) -> Result<Self, LoadError> {
        if self.num_heads == 0
            || self.num_kv_heads == 0
            || self.hidden_size % self.num_heads != 0
            || self.num_heads % self.num_kv_heads != 0
        {
            return Err(LoadError::Unsupported(format!(
                "{} attention heads over {} kv heads do not divide hidden size {}",
                self.num_heads, self.num_kv_heads, self.hidden_size
            )));
        }
        Ok(self)
    }

    /// Bytes of dense weights stored as `dtype`.
    pub fn dense_footprint(&self, dtype: DType) -> WeightFootprint {
        let hidden = self.hidden_size as u64;
        let kv = self.kv_dim() as u64;
        let inter = self.intermediate_size as u64;
        let bytes = dtype.size_in_bytes() as u64;

        let per_layer = (2 * hidden * hidden + 2 * hidden * kv + 3 * hidden * inter + 2 * hidden) * bytes;
        let tables = if self.tie_word_embeddings { 1 } else { 2 };
        let fixed = (tables * self.vocab_size as u64 * hidden + hidden) * bytes;
        WeightFootprint::uniform(fixed, per_layer, self.num_layers)
    }
}

fn block_index(name: &str) -> Option<usize> {
    name.strip_prefix("blk.")?.split('.').next()?.parse().ok()
}

/// Stored bytes per block of a GGUF file. The embedding also counts its
/// dequantized f32 copy.
pub fn gguf_footprint(content: &gguf_file::Content, num_layers: usize) -> WeightFootprint {
    let mut footprint = WeightFootprint {
        fixed_bytes: 0,
        layer_bytes: vec![0; num_layers],
    };
    for (name, info) in &content.tensor_infos {
        let elements = info.shape.elem_count() as u64;
        let stored = elements / info.ggml_dtype.block_size() as u64 * info.ggml_dtype.type_size() as u64;
        match block_index(name) {
            Some(layer) if layer < num_layers => footprint.layer_bytes[layer] += stored,
            _ => footprint.fixed_bytes += stored,
        }
        if name == "token_embd.weight" {
            footprint.fixed_bytes += elements * 4;
        }
    }
    footprint
}

/// Opened devices for a placement.
pub struct DeviceLayout {
    pub head: Device,
    pub stages: Vec<(Device, Range<usize>)>,
    pub label: String,
}

enum Proj {
    Dense(Linear),
    Quantized(QMatMul),
}

impl Module for Proj {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Proj::Dense(linear) => linear.forward(xs),
            Proj::Quantized(matmul) => matmul.forward(xs),
        }
    }
}

struct RmsNorm {
    weight: Tensor,
    eps: f32,
}

impl RmsNorm {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        candle_nn::ops::rms_norm(xs, &self.weight, self.eps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RopeStyle {
    /// GGUF checkpoints store q/k with rotated pairs interleaved.
    Interleaved,
    Halves,
}

#[derive(Debug, Clone, Copy)]
struct Attention {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    rope: RopeStyle,
}

impl Attention {
    fn rotate(&self, xs: &Tensor, cos: &Tensor, sin: &Tensor) -> candle_core::Result<Tensor> {
        match self.rope {
            RopeStyle::Interleaved => candle_nn::rotary_emb::rope_i(xs, cos, sin),
            RopeStyle::Halves => candle_nn::rotary_emb::rope(xs, cos, sin),
        }
    }
}

type KvCache = Option<(Tensor, Tensor)>;

/// Per-call inputs shared by the blocks of one stage.
struct Step {
    cos: Tensor,
    sin: Tensor,
    mask: Option<Tensor>,
    flash: bool,
}

struct Block {
    attn_norm: RmsNorm,
    q_proj: Proj,
    k_proj: Proj,
    v_proj: Proj,
    o_proj: Proj,
    ffn_norm: RmsNorm,
    gate_proj: Proj,
    up_proj: Proj,
    down_proj: Proj,
}

impl Block {
    fn from_gguf<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        layer: usize,
        device: &Device,
        eps: f32,
    ) -> Result<Self, LoadError> {
        let prefix = format!("blk.{}", layer);
        Ok(Self {
            attn_norm: gguf_norm(content, reader, &format!("{}.attn_norm.weight", prefix), device, eps)?,
            q_proj: gguf_proj(content, reader, &format!("{}.attn_q.weight", prefix), device)?,
            k_proj: gguf_proj(content, reader, &format!("{}.attn_k.weight", prefix), device)?,
            v_proj: gguf_proj(content, reader, &format!("{}.attn_v.weight", prefix), device)?,
            o_proj: gguf_proj(content, reader, &format!("{}.attn_output.weight", prefix), device)?,
            ffn_norm: gguf_norm(content, reader, &format!("{}.ffn_norm.weight", prefix), device, eps)?,
            gate_proj: gguf_proj(content, reader, &format!("{}.ffn_gate.weight", prefix), device)?,
            up_proj: gguf_proj(content, reader, &format!("{}.ffn_up.weight", prefix), device)?,
            down_proj: gguf_proj(content, reader, &format!("{}.ffn_down.weight", prefix), device)?,
        })
    }

    fn from_var_builder(vb: VarBuilder, shape: &LlamaShape) -> candle_core::Result<Self> {
        let hidden = shape.hidden_size;
        let kv = shape.kv_dim();
        let inter = shape.intermediate_size;
        let eps = shape.rms_norm_eps as f32;
        let attn = vb.pp("self_attn");
        let mlp = vb.pp("mlp");
        let dense = |vb: VarBuilder, in_dim, out_dim| candle_nn::linear_no_bias(in_dim, out_dim, vb).map(Proj::Dense);
        Ok(Self {
            attn_norm: RmsNorm {
                weight: vb.get(hidden, "input_layernorm.weight")?,
                eps,
            },
            q_proj: dense(attn.pp("q_proj"), hidden, hidden)?,
            k_proj: dense(attn.pp("k_proj"), hidden, kv)?,
            v_proj: dense(attn.pp("v_proj"), hidden, kv)?,
            o_proj: dense(attn.pp("o_proj"), hidden, hidden)?,
            ffn_norm: RmsNorm {
                weight: vb.get(hidden, "post_attention_layernorm.weight")?,
                eps,
            },
            gate_proj: dense(mlp.pp("gate_proj"), hidden, inter)?,
            up_proj: dense(mlp.pp("up_proj"), hidden, inter)?,
            down_proj: dense(mlp.pp("down_proj"), inter, hidden)?,
        })
    }

    fn forward(&self, xs: &Tensor, attention: &Attention, step: &Step, cache: &mut KvCache) -> candle_core::Result<Tensor> {
        let (batch, seq_len, hidden) = xs.dims3()?;
        let normed = self.attn_norm.forward(xs)?;
        let heads = |proj: &Proj, count: usize| -> candle_core::Result<Tensor> {
            proj.forward(&normed)?
                .reshape((batch, seq_len, count, attention.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = attention.rotate(&heads(&self.q_proj, attention.num_heads)?, &step.cos, &step.sin)?;
        let k = attention.rotate(&heads(&self.k_proj, attention.num_kv_heads)?, &step.cos, &step.sin)?;
        let v = heads(&self.v_proj, attention.num_kv_heads)?;

        let (k, v) = match cache.take() {
            Some((past_k, past_v)) => (Tensor::cat(&[&past_k, &k], 2)?, Tensor::cat(&[&past_v, &v], 2)?),
            None => (k, v),
        };
        *cache = Some((k.clone(), v.clone()));

        let repeats = attention.num_heads / attention.num_kv_heads;
        let k = repeat_kv(k, repeats)?.contiguous()?;
        let v = repeat_kv(v, repeats)?.contiguous()?;
        let scale = 1.0 / (attention.head_dim as f64).sqrt();

        let attn = if step.flash {
            flash_attention(
                &q.transpose(1, 2)?,
                &k.transpose(1, 2)?,
                &v.transpose(1, 2)?,
                scale as f32,
                seq_len > 1,
            )?
            .transpose(1, 2)?
        } else {
            let scores = (q.matmul(&k.t()?)? * scale)?.to_dtype(DType::F32)?;
            let scores = match &step.mask {
                Some(mask) => scores.broadcast_add(mask)?,
                None => scores,
            };
            candle_nn::ops::softmax_last_dim(&scores)?
                .to_dtype(v.dtype())?
                .matmul(&v)?
        };
        let attn = attn.transpose(1, 2)?.reshape((batch, seq_len, hidden))?;
        let xs = (self.o_proj.forward(&attn)? + xs)?;

        let normed = self.ffn_norm.forward(&xs)?;
        let gated = (candle_nn::ops::silu(&self.gate_proj.forward(&normed)?)? * self.up_proj.forward(&normed)?)?;
        self.down_proj.forward(&gated)? + xs
    }
}

#[cfg(feature = "flash-attn")]
fn flash_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32, causal: bool) -> candle_core::Result<Tensor> {
    candle_flash_attn::flash_attn(q, k, v, scale, causal)
}

#[cfg(not(feature = "flash-attn"))]
fn flash_attention(_: &Tensor, _: &Tensor, _: &Tensor, _: f32, _: bool) -> candle_core::Result<Tensor> {
    candle_core::bail!("built without the flash-attn feature")
}

fn gguf_proj<R: Read + Seek>(
    content: &gguf_file::Content,
    reader: &mut R,
    name: &str,
    device: &Device,
) -> Result<Proj, LoadError> {
    let weight = content.tensor(reader, name, device)?;
    Ok(Proj::Quantized(QMatMul::from_qtensor(weight)?))
}

fn gguf_norm<R: Read + Seek>(
    content: &gguf_file::Content,
    reader: &mut R,
    name: &str,
    device: &Device,
    eps: f32,
) -> Result<RmsNorm, LoadError> {
    let weight = content.tensor(reader, name, device)?.dequantize(device)?;
    Ok(RmsNorm { weight, eps })
}

/// `-inf` above the diagonal, offset by the cached positions.
fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> candle_core::Result<Tensor> {
    let total = seq_len + offset;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..total).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_slice(&mask, (seq_len, total), device)
}

fn rope_tables(shape: &LlamaShape, dtype: DType, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
    let head_dim = shape.head_dim();
    let inv_freq: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / shape.rope_theta.powf(i as f32 / head_dim as f32))
        .collect();
    let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), device)?;
    let positions = Tensor::arange(0u32, shape.max_position_embeddings as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((shape.max_position_embeddings, 1))?;
    let freqs = positions.matmul(&inv_freq)?;
    Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
}

struct Stage {
    device: Device,
    layers: Range<usize>,
    blocks: Vec<Block>,
    cos: Tensor,
    sin: Tensor,
    flash: bool,
}

impl Stage {
    fn new(
        device: Device,
        layers: Range<usize>,
        blocks: Vec<Block>,
        shape: &LlamaShape,
        dtype: DType,
        flash: bool,
    ) -> candle_core::Result<Self> {
        let (cos, sin) = rope_tables(shape, dtype, &device)?;
        debug!("Stage with blocks {:?} on {:?}", layers, device.location());
        Ok(Self {
            flash: flash && device.is_cuda() && dtype != DType::F32,
            device,
            layers,
            blocks,
            cos,
            sin,
        })
    }
}

struct LlamaWeights {
    num_layers: usize,
    context_len: usize,
    attention: Attention,
    head_device: Device,
    embed: Embedding,
    norm: RmsNorm,
    head: Proj,
    stages: Vec<Stage>,
}

impl LlamaWeights {
    fn forward(&self, tokens: &[u32], position: usize, cache: &mut [KvCache]) -> candle_core::Result<Tensor> {
        let seq_len = tokens.len();
        if seq_len == 0 {
            candle_core::bail!("forward called without tokens");
        }
        let input = Tensor::new(tokens, &self.head_device)?.unsqueeze(0)?;
        let mut hidden = self.embed.forward(&input)?;

        for stage in &self.stages {
            hidden = hidden.to_device(&stage.device)?;
            let step = Step {
                cos: stage.cos.narrow(0, position, seq_len)?,
                sin: stage.sin.narrow(0, position, seq_len)?,
                mask: if seq_len > 1 && !stage.flash {
                    Some(causal_mask(seq_len, position, &stage.device)?)
                } else {
                    None
                },
                flash: stage.flash,
            };
            for (block, kv) in stage.blocks.iter().zip(cache[stage.layers.clone()].iter_mut()) {
                hidden = block.forward(&hidden, &self.attention, &step, kv)?;
            }
        }

        let last = hidden
            .to_device(&self.head_device)?
            .narrow(1, seq_len - 1, 1)?
            .contiguous()?;
        let logits = self.head.forward(&self.norm.forward(&last)?)?;
        logits.flatten_all()?.to_dtype(DType::F32)
    }
}

/// Loaded weights; sessions share them and own only their KV caches.
pub struct PipelinedLlama {
    weights: Arc<LlamaWeights>,
    label: String,
}

impl PipelinedLlama {
    pub fn from_gguf<R: Read + Seek>(
        content: &gguf_file::Content,
        reader: &mut R,
        shape: &LlamaShape,
        layout: DeviceLayout,
    ) -> Result<Self, LoadError> {
        let eps = shape.rms_norm_eps as f32;
        let head_device = layout.head;
        let embed_weights = content.tensor(reader, "token_embd.weight", &head_device)?;
        let embed = Embedding::new(embed_weights.dequantize(&head_device)?, shape.hidden_size);
        let norm = gguf_norm(content, reader, "output_norm.weight", &head_device, eps)?;
        let output = if shape.tie_word_embeddings {
            embed_weights
        } else {
            content.tensor(reader, "output.weight", &head_device)?
        };
        let head = Proj::Quantized(QMatMul::from_qtensor(output)?);

        let mut stages = Vec::with_capacity(layout.stages.len());
        for (device, layers) in layout.stages {
            let blocks = layers
                .clone()
                .map(|layer| Block::from_gguf(content, reader, layer, &device, eps))
                .collect::<Result<Vec<_>, _>>()?;
            stages.push(Stage::new(device, layers, blocks, shape, DType::F32, false)?);
        }

        Ok(Self::assemble(shape, RopeStyle::Interleaved, head_device, embed, norm, head, stages, layout.label))
    }

    pub fn from_safetensors(
        filenames: &[PathBuf],
        shape: &LlamaShape,
        dtype: DType,
        layout: DeviceLayout,
        use_flash_attn: bool,
    ) -> Result<Self, LoadError> {
        let head_vb = unsafe { VarBuilder::from_mmaped_safetensors(filenames, dtype, &layout.head)? };
        let stage_vbs = layout
            .stages
            .iter()
            .map(|(device, layers)| -> Result<_, LoadError> {
                let vb = unsafe { VarBuilder::from_mmaped_safetensors(filenames, dtype, device)? };
                Ok((vb, layers.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_var_builders(shape, head_vb, stage_vbs, use_flash_attn, layout.label)?)
    }

    fn from_var_builders(
        shape: &LlamaShape,
        head_vb: VarBuilder,
        stage_vbs: Vec<(VarBuilder, Range<usize>)>,
        use_flash_attn: bool,
        label: String,
    ) -> candle_core::Result<Self> {
        let dtype = head_vb.dtype();
        let head_device = head_vb.device().clone();
        let embed = candle_nn::embedding(shape.vocab_size, shape.hidden_size, head_vb.pp("model.embed_tokens"))?;
        let norm = RmsNorm {
            weight: head_vb.get(shape.hidden_size, "model.norm.weight")?,
            eps: shape.rms_norm_eps as f32,
        };
        let head = if shape.tie_word_embeddings {
            Proj::Dense(Linear::new(embed.embeddings().clone(), None))
        } else {
            Proj::Dense(candle_nn::linear_no_bias(shape.hidden_size, shape.vocab_size, head_vb.pp("lm_head"))?)
        };

        let mut stages = Vec::with_capacity(stage_vbs.len());
        for (vb, layers) in stage_vbs {
            let blocks = layers
                .clone()
                .map(|layer| Block::from_var_builder(vb.pp(format!("model.layers.{}", layer)), shape))
                .collect::<candle_core::Result<Vec<_>>>()?;
            stages.push(Stage::new(vb.device().clone(), layers, blocks, shape, dtype, use_flash_attn)?);
        }

        Ok(Self::assemble(shape, RopeStyle::Halves, head_device, embed, norm, head, stages, label))
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        shape: &LlamaShape,
        rope: RopeStyle,
        head_device: Device,
        embed: Embedding,
        norm: RmsNorm,
        head: Proj,
        stages: Vec<Stage>,
        label: String,
    ) -> Self {
        Self {
            weights: Arc::new(LlamaWeights {
                num_layers: shape.num_layers,
                context_len: shape.max_position_embeddings,
                attention: Attention {
                    num_heads: shape.num_heads,
                    num_kv_heads: shape.num_kv_heads,
                    head_dim: shape.head_dim(),
                    rope,
                },
                head_device,
                embed,
                norm,
                head,
                stages,
            }),
            label,
        }
    }
}

impl LanguageModel for PipelinedLlama {
    fn new_session(&self) -> candle_core::Result<Box<dyn DecodeSession>> {
        Ok(Box::new(LlamaSession {
            weights: self.weights.clone(),
            cache: vec![None; self.weights.num_layers],
        }))
    }

    fn max_context_len(&self) -> usize {
        self.weights.context_len
    }

    fn placement(&self) -> String {
        self.label.clone()
    }

    fn release_memory(&self) {
        let devices = std::iter::once(&self.weights.head_device)
            .chain(self.weights.stages.iter().map(|stage| &stage.device));
        for device in devices {
            if let Err(e) = device.synchronize() {
                debug!("Device synchronize failed: {}", e);
            }
        }
    }
}

struct LlamaSession {
    weights: Arc<LlamaWeights>,
    cache: Vec<KvCache>,
}

impl DecodeSession for LlamaSession {
    fn forward(&mut self, tokens: &[u32], position: usize) -> candle_core::Result<Tensor> {
        self.weights.forward(tokens, position, &mut self.cache)
    }
}
