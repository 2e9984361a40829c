use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::LoadSettings;
use crate::error::LoadError;

/// Where model files come from: a local directory laid out like a hub
/// repository, or the hub itself (downloaded into the cache).
pub enum ModelSource {
    Local(PathBuf),
    Hub { repo_id: String, repo: ApiRepo },
}

impl ModelSource {
    pub fn open(settings: &LoadSettings) -> Result<Self, LoadError> {
        if let Some(path) = &settings.model_path {
            if path.is_dir() {
                debug!("Using local model directory {}", path.display());
                return Ok(ModelSource::Local(path.clone()));
            }
            return Err(LoadError::Files(format!(
                "Model directory {} does not exist",
                path.display()
            )));
        }
        Self::hub(&settings.model_id, settings)
    }

    pub fn hub(repo_id: &str, settings: &LoadSettings) -> Result<Self, LoadError> {
        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(settings.hf_token.clone());
        if let Some(cache_dir) = &settings.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder
            .build()
            .map_err(|e| LoadError::Files(format!("Failed to create HF API: {}", e)))?;
        Ok(ModelSource::Hub {
            repo_id: repo_id.to_string(),
            repo: api.model(repo_id.to_string()),
        })
    }

    pub fn get(&self, filename: &str) -> Result<PathBuf, LoadError> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(filename);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(LoadError::Files(format!("{} not found", path.display())))
                }
            }
            ModelSource::Hub { repo_id, repo } => {
                info!("Fetching {} from {}", filename, repo_id);
                repo.get(filename)
                    .map_err(|e| LoadError::Files(format!("{}/{}: {}", repo_id, filename, e)))
            }
        }
    }

    /// Safetensors weights, single file or sharded through the index.
    pub fn safetensors(&self) -> Result<Vec<PathBuf>, LoadError> {
        match self.get("model.safetensors.index.json") {
            Ok(index) => {
                let shards = read_shard_names(&index)?;
                shards.iter().map(|name| self.get(name)).collect()
            }
            Err(_) => Ok(vec![self.get("model.safetensors")?]),
        }
    }

    /// First `*.gguf` file of a local directory.
    pub fn find_gguf(&self) -> Option<PathBuf> {
        let ModelSource::Local(dir) = self else {
            return None;
        };
        let mut found: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "gguf"))
            .collect();
        found.sort();
        found.into_iter().next()
    }
}

/// Resolves the quantized artifact. An explicit path wins, then a configured
/// quantized repository, then any GGUF next to the local weights.
pub fn resolve_gguf(settings: &LoadSettings) -> Result<PathBuf, LoadError> {
    if let Some(file) = &settings.quantized_file {
        let path = PathBuf::from(file);
        if path.is_file() {
            return Ok(path);
        }
        if let Some(repo_id) = &settings.quantized_repo {
            return ModelSource::hub(repo_id, settings)?.get(file);
        }
        return ModelSource::open(settings)?.get(file);
    }

    if settings.quantized_repo.is_some() {
        return Err(LoadError::Files(
            "A quantized repository needs a quantized file name".to_string(),
        ));
    }

    ModelSource::open(settings)?
        .find_gguf()
        .ok_or_else(|| LoadError::Files("No GGUF artifact configured or found".to_string()))
}

fn read_shard_names(index: &Path) -> Result<BTreeSet<String>, LoadError> {
    let content = std::fs::read_to_string(index)?;
    let json: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| LoadError::Files(format!("{}: {}", index.display(), e)))?;
    let weight_map = json
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| LoadError::Files(format!("{} has no weight_map", index.display())))?;
    Ok(weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Sum of file sizes, used as the weight footprint estimate.
pub fn total_size(paths: &[PathBuf]) -> Result<u64, LoadError> {
    let mut total = 0;
    for path in paths {
        total += std::fs::metadata(path)?.len();
    }
    Ok(total)
}
