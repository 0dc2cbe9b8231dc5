use crate::BlipError;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{Repo, RepoType, api::sync::Api};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Where the weights and tokenizer of an engine come from.
#[derive(Clone, Debug, PartialEq)]
pub enum WeightsSource {
    /// A model repository on the Hugging Face hub.
    Hub { repo: String, revision: String },
    /// A local directory holding `tokenizer.json` and the safetensors weights.
    Local(PathBuf),
}

impl WeightsSource {
    /// The `main` revision of a hub repository.
    pub fn hub(repo: impl Into<String>) -> Self {
        WeightsSource::Hub {
            repo: repo.into(),
            revision: "main".to_string(),
        }
    }

    /// Locate, downloading if needed, the files of the source.
    pub fn resolve(&self) -> Result<ResolvedWeights, BlipError> {
        let resolved = match self {
            WeightsSource::Hub { repo, revision } => resolve_hub(repo, revision),
            WeightsSource::Local(dir) => resolve_local(dir),
        }
        .map_err(|reason| BlipError::model_unavailable(self, reason))?;

        log::info!(
            "Resolved {self}: {} weight file(s)",
            resolved.safetensors.len()
        );
        Ok(resolved)
    }
}

impl std::fmt::Display for WeightsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightsSource::Hub { repo, revision } => write!(f, "{repo}@{revision}"),
            WeightsSource::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// Local paths of the files an engine is built from.
#[derive(Clone, Debug)]
pub struct ResolvedWeights {
    pub source: WeightsSource,
    pub safetensors: Vec<PathBuf>,
    pub tokenizer: PathBuf,
}

impl ResolvedWeights {
    pub fn tokenizer(&self) -> Result<Tokenizer, BlipError> {
        Tokenizer::from_file(&self.tokenizer)
            .map_err(|e| BlipError::model_unavailable(&self.source, e))
    }

    /// Memory map the weights as `dtype` on `device`.
    pub fn var_builder(
        &self,
        dtype: DType,
        device: &Device,
    ) -> Result<VarBuilder<'static>, BlipError> {
        // the mapped files must not change while the engine is alive
        unsafe { VarBuilder::from_mmaped_safetensors(&self.safetensors, dtype, device) }
            .map_err(|e| BlipError::model_unavailable(&self.source, e))
    }
}

fn resolve_hub(repo_id: &str, revision: &str) -> Result<ResolvedWeights, String> {
    let api = Api::new().map_err(|e| e.to_string())?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let tokenizer = repo.get(TOKENIZER_FILE).map_err(|e| e.to_string())?;
    let safetensors = match repo.get(WEIGHTS_INDEX_FILE) {
        Ok(index) => shard_names(&index)?
            .iter()
            .map(|name| repo.get(name).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?,
        Err(_) => vec![repo.get(WEIGHTS_FILE).map_err(|e| e.to_string())?],
    };

    Ok(ResolvedWeights {
        source: WeightsSource::Hub {
            repo: repo_id.to_string(),
            revision: revision.to_string(),
        },
        safetensors,
        tokenizer,
    })
}

fn resolve_local(dir: &Path) -> Result<ResolvedWeights, String> {
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }

    let tokenizer = dir.join(TOKENIZER_FILE);
    if !tokenizer.is_file() {
        return Err(format!("missing {}", tokenizer.display()));
    }

    let index = dir.join(WEIGHTS_INDEX_FILE);
    let single = dir.join(WEIGHTS_FILE);
    let safetensors = if index.is_file() {
        shard_names(&index)?
            .iter()
            .map(|name| dir.join(name))
            .collect()
    } else if single.is_file() {
        vec![single]
    } else {
        let mut files = std::fs::read_dir(dir)
            .map_err(|e| e.to_string())?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
            .collect::<Vec<_>>();
        files.sort();
        files
    };

    if safetensors.is_empty() {
        return Err(format!("no safetensors weights in {}", dir.display()));
    }

    Ok(ResolvedWeights {
        source: WeightsSource::Local(dir.to_path_buf()),
        safetensors,
        tokenizer,
    })
}

/// The distinct shard file names listed in a safetensors index.
fn shard_names(index: &Path) -> Result<Vec<String>, String> {
    let file = std::fs::File::open(index).map_err(|e| e.to_string())?;
    let json: serde_json::Value = serde_json::from_reader(file).map_err(|e| e.to_string())?;
    let weight_map = json
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| format!("no weight map in {}", index.display()))?;

    let mut names = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect::<Vec<_>>();
    names.sort();
    names.dedup();
    Ok(names)
}

/// The device the engines run on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceConfig {
    #[default]
    Cpu,
    /// A CUDA device by ordinal, requires the `cuda` feature.
    Cuda(usize),
}

impl DeviceConfig {
    /// The device and the weights dtype to use on it.
    ///
    /// Falls back to the CPU when the CUDA device is not available.
    pub fn resolve(&self) -> (Device, DType) {
        match self {
            DeviceConfig::Cpu => (Device::Cpu, DType::F32),
            DeviceConfig::Cuda(ordinal) => match Device::cuda_if_available(*ordinal) {
                Ok(device) if device.is_cuda() => (device, DType::BF16),
                Ok(device) => {
                    log::warn!("CUDA not available, defaulting to CPU");
                    (device, DType::F32)
                }
                Err(e) => {
                    log::warn!("CUDA not available, defaulting to CPU: {e}");
                    (Device::Cpu, DType::F32)
                }
            },
        }
    }
}
