use candle_core::DType;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::budget::GIB;
use crate::generation::request::MAX_NEW_TOKENS_LIMIT;

pub const DEFAULT_MODEL_ID: &str = "WizardLM/WizardCoder-Python-13B-V1.0";

/// Model files and the precision chain used to load them.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadSettings {
    pub model_id: String,
    /// Local directory laid out like a hub repository. Overrides `model_id`
    /// as the file source.
    pub model_path: Option<PathBuf>,
    pub quantized_repo: Option<String>,
    pub quantized_file: Option<String>,
    pub load_in_4bit: bool,
    pub half_dtype: DType,
    pub host_fallback: bool,
    pub use_flash_attn: bool,
    pub cache_dir: Option<PathBuf>,
    pub hf_token: Option<String>,
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            model_path: None,
            quantized_repo: None,
            quantized_file: None,
            load_in_4bit: true,
            half_dtype: DType::F16,
            host_fallback: false,
            use_flash_attn: false,
            cache_dir: None,
            hf_token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetSettings {
    /// Left free on every accelerator for activations and the KV cache.
    pub reserve_bytes: u64,
    pub host_overflow_bytes: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            reserve_bytes: 3 * GIB,
            host_overflow_bytes: 16 * GIB,
        }
    }
}

/// Decoding parameters used when a request leaves them unset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationDefaults {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repetition_penalty: f64,
    pub repeat_last_n: usize,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            top_k: 50,
            repetition_penalty: 1.1,
            repeat_last_n: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSettings {
    pub addr: SocketAddr,
    /// Deadline for a whole blocking generation.
    pub request_timeout: Duration,
    /// Deadline between two stream fragments.
    pub fragment_timeout: Duration,
}

impl Default for ServeSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            request_timeout: Duration::from_secs(300),
            fragment_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(name = "inference-server")]
#[command(about = "LLM inference server with budgeted multi-GPU loading and streamed generation")]
pub struct Args {
    /// Hugging Face model repository
    #[arg(long, env = "MODEL_NAME", default_value = DEFAULT_MODEL_ID)]
    pub model_name: String,

    /// Local model directory (config.json, tokenizer.json, safetensors, optional gguf)
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Repository holding the GGUF file for the quantized attempt
    #[arg(long, env = "QUANTIZED_REPO")]
    pub quantized_repo: Option<String>,

    /// GGUF file name or path for the quantized attempt
    #[arg(long, env = "QUANTIZED_FILE")]
    pub quantized_file: Option<String>,

    /// Try 4-bit quantized weights before half precision
    #[arg(long, env = "LOAD_IN_4BIT", default_value_t = true, action = clap::ArgAction::Set)]
    pub load_in_4bit: bool,

    /// Half precision type: f16 or bf16
    #[arg(long, env = "HALF_DTYPE", default_value = "f16")]
    pub half_dtype: String,

    /// Fall back to full precision on the host when accelerator loads fail
    #[arg(long, env = "HOST_FALLBACK", default_value_t = false, action = clap::ArgAction::Set)]
    pub host_fallback: bool,

    #[arg(long, env = "USE_FLASH_ATTN", default_value_t = false)]
    pub use_flash_attn: bool,

    /// Memory left free on every GPU when sharding, in GiB
    #[arg(long, env = "GPU_RESERVE_GIB", default_value_t = 3)]
    pub gpu_reserve_gib: u64,

    /// Host memory available for overflow when sharding, in GiB
    #[arg(long, env = "CPU_OVERFLOW_GIB", default_value_t = 16)]
    pub cpu_overflow_gib: u64,

    #[arg(long, env = "MAX_NEW_TOKENS", default_value_t = 512)]
    pub max_new_tokens: usize,

    #[arg(long, env = "REPEAT_LAST_N", default_value_t = 64)]
    pub repeat_last_n: usize,

    #[arg(long, env = "LLM_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "LLM_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Deadline for a blocking generation, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 300)]
    pub request_timeout_secs: u64,

    /// Deadline between two streamed fragments, in seconds
    #[arg(long, env = "FRAGMENT_TIMEOUT_SECS", default_value_t = 120)]
    pub fragment_timeout_secs: u64,

    /// Hugging Face home; the hub cache lives in `<HF_HOME>/hub`
    #[arg(long, env = "HF_HOME")]
    pub hf_home: Option<PathBuf>,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

impl Args {
    pub fn load_settings(&self) -> anyhow::Result<LoadSettings> {
        let half_dtype = match self.half_dtype.to_ascii_lowercase().as_str() {
            "f16" | "float16" => DType::F16,
            "bf16" | "bfloat16" => DType::BF16,
            other => anyhow::bail!("Unsupported half precision dtype {}", other),
        };
        Ok(LoadSettings {
            model_id: self.model_name.clone(),
            model_path: self.model_path.clone(),
            quantized_repo: self.quantized_repo.clone(),
            quantized_file: self.quantized_file.clone(),
            load_in_4bit: self.load_in_4bit,
            half_dtype,
            host_fallback: self.host_fallback,
            use_flash_attn: self.use_flash_attn,
            cache_dir: self.hf_home.as_ref().map(|home| home.join("hub")),
            hf_token: self.hf_token.clone(),
        })
    }

    pub fn budget_settings(&self) -> BudgetSettings {
        BudgetSettings {
            reserve_bytes: self.gpu_reserve_gib * GIB,
            host_overflow_bytes: self.cpu_overflow_gib * GIB,
        }
    }

    pub fn generation_defaults(&self) -> anyhow::Result<GenerationDefaults> {
        if self.max_new_tokens == 0 || self.max_new_tokens as i64 > MAX_NEW_TOKENS_LIMIT {
            anyhow::bail!(
                "MAX_NEW_TOKENS must be between 1 and {}, got {}",
                MAX_NEW_TOKENS_LIMIT,
                self.max_new_tokens
            );
        }
        Ok(GenerationDefaults {
            max_new_tokens: self.max_new_tokens,
            repeat_last_n: self.repeat_last_n,
            ..GenerationDefaults::default()
        })
    }

    pub fn serve_settings(&self) -> anyhow::Result<ServeSettings> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}:{}: {}", self.host, self.port, e))?;
        Ok(ServeSettings {
            addr,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            fragment_timeout: Duration::from_secs(self.fragment_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("inference-server").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags_convert_to_settings() {
        let args = parse(&[
            "--model-name",
            "org/model",
            "--load-in-4bit",
            "false",
            "--half-dtype",
            "bf16",
            "--gpu-reserve-gib",
            "2",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--hf-home",
            "/data/hf",
        ]);
        let load = args.load_settings().unwrap();
        assert_eq!(load.model_id, "org/model");
        assert!(!load.load_in_4bit);
        assert_eq!(load.half_dtype, DType::BF16);
        assert_eq!(load.cache_dir, Some(PathBuf::from("/data/hf/hub")));
        assert_eq!(args.budget_settings().reserve_bytes, 2 * GIB);
        assert_eq!(args.serve_settings().unwrap().addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn test_default_max_new_tokens_within_request_limit() {
        assert_eq!(parse(&[]).generation_defaults().unwrap().max_new_tokens, 512);
        assert_eq!(
            parse(&["--max-new-tokens", "2048"]).generation_defaults().unwrap().max_new_tokens,
            2048
        );
        assert!(parse(&["--max-new-tokens", "4096"]).generation_defaults().is_err());
        assert!(parse(&["--max-new-tokens", "0"]).generation_defaults().is_err());
    }

    #[test]
    fn test_bad_dtype_is_rejected() {
        let args = parse(&["--half-dtype", "int8"]);
        assert!(args.load_settings().is_err());
    }
}
