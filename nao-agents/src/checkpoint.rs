//! Single file checkpoints: every variable of an agent as safetensors, with a JSON description of
//! the run stored in the safetensors header.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use nao_core::{
    env::{EnvironmentDescription, Space},
    error::CheckpointError,
    tensor::Buffer,
};
use safetensors::{Dtype, SafeTensors, View};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Cow,
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
};

pub const CHECKPOINT_EXTENSION: &str = "safetensors";

const METADATA_KEY: &str = "nao_checkpoint";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub algorithm: String,
    pub observation_size: usize,
    pub action_size: usize,
    pub action_low: Option<Vec<f32>>,
    pub action_high: Option<Vec<f32>>,
    pub hidden_layers: Vec<usize>,
    pub timesteps: usize,
    pub created_at: DateTime<Utc>,
}

impl CheckpointMetadata {
    pub fn new(
        algorithm: &str,
        description: &EnvironmentDescription,
        hidden_layers: &[usize],
        timesteps: usize,
    ) -> Self {
        let (action_low, action_high) = match description.action_space.bounds() {
            Some((low, high)) => (Some(low.data.clone()), Some(high.data.clone())),
            None => (None, None),
        };
        Self {
            algorithm: algorithm.to_owned(),
            observation_size: description.observation_size(),
            action_size: description.action_size(),
            action_low,
            action_high,
            hidden_layers: hidden_layers.to_vec(),
            timesteps,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds the environment description the checkpoint was trained against.
    pub fn env_description(&self) -> EnvironmentDescription {
        let observation_space = Space::continuous_from_dims(vec![self.observation_size]);
        let action_space = match (&self.action_low, &self.action_high) {
            (Some(low), Some(high)) => Space::Continuous {
                min: Some(Buffer::from_vec(low.clone())),
                max: Some(Buffer::from_vec(high.clone())),
                size: self.action_size,
            },
            _ => Space::continuous_from_dims(vec![self.action_size]),
        };
        EnvironmentDescription::new(observation_space, action_space)
    }

    pub fn expect_algorithm(&self, accepted: &[&str]) -> Result<()> {
        if accepted.contains(&self.algorithm.as_str()) {
            Ok(())
        } else {
            Err(CheckpointError::AlgorithmMismatch {
                expected: accepted.join(" or "),
                found: self.algorithm.clone(),
            }
            .into())
        }
    }
}

/// Little endian `f32` copy of a variable, in the layout safetensors expects.
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl StoredTensor {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let values: Vec<f32> = tensor.flatten_all()?.to_vec1()?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        })
    }
}

impl View for StoredTensor {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.data)
    }

    fn data_len(&self) -> usize {
        self.data.len()
    }
}

/// `<path>.safetensors`, unless `path` already carries the extension.
pub fn checkpoint_file(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == CHECKPOINT_EXTENSION) {
        return path.to_owned();
    }
    let mut file: OsString = path.as_os_str().to_owned();
    file.push(".");
    file.push(CHECKPOINT_EXTENSION);
    PathBuf::from(file)
}

/// Writes the variables of every `(group, varmap)` pair, tensors are named `<group>.<var>`.
pub fn save_checkpoint(
    path: &Path,
    groups: &[(&str, &VarMap)],
    metadata: &CheckpointMetadata,
) -> Result<PathBuf> {
    let file = checkpoint_file(path);
    if let Some(parent) = file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tensors: Vec<(String, StoredTensor)> = vec![];
    for (group, varmap) in groups {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map of {group} is poisoned"))?;
        for (name, var) in data.iter() {
            tensors.push((
                format!("{group}.{name}"),
                StoredTensor::from_tensor(var.as_tensor())?,
            ));
        }
    }
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    let info = HashMap::from([(METADATA_KEY.to_owned(), serde_json::to_string(metadata)?)]);
    safetensors::serialize_to_file(tensors, &Some(info), &file)
        .with_context(|| format!("failed to write {}", file.display()))?;
    tracing::debug!(path = %file.display(), "checkpoint written");
    Ok(file)
}

pub struct Checkpoint {
    pub path: PathBuf,
    pub metadata: CheckpointMetadata,
    tensors: HashMap<String, Tensor>,
}

impl Checkpoint {
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let file = checkpoint_file(path);
        if !file.is_file() {
            return Err(CheckpointError::NotFound(file).into());
        }
        let bytes = std::fs::read(&file)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)
            .with_context(|| format!("{} is not a safetensors file", file.display()))?;
        let metadata = header
            .metadata()
            .as_ref()
            .and_then(|info| info.get(METADATA_KEY))
            .ok_or_else(|| CheckpointError::MissingMetadata { path: file.clone() })?;
        let metadata: CheckpointMetadata = serde_json::from_str(metadata)?;
        let tensors = candle_core::safetensors::load_buffer(&bytes, device)?;
        Ok(Self {
            path: file,
            metadata,
            tensors,
        })
    }

    pub fn metadata(path: &Path) -> Result<CheckpointMetadata> {
        Ok(Self::read(path, &Device::Cpu)?.metadata)
    }

    pub fn has_group(&self, group: &str) -> bool {
        let prefix = format!("{group}.");
        self.tensors.keys().any(|name| name.starts_with(&prefix))
    }

    /// Copies the stored tensors of `group` into `varmap`. Every variable must be present with
    /// the shape the network was built with.
    pub fn restore(&self, group: &str, varmap: &VarMap) -> Result<()> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("variable map of {group} is poisoned"))?;
        for (name, var) in data.iter() {
            let key = format!("{group}.{name}");
            let stored = self
                .tensors
                .get(&key)
                .ok_or_else(|| CheckpointError::MissingTensor(key.clone()))?;
            if stored.dims() != var.dims() {
                return Err(CheckpointError::ShapeMismatch {
                    name: key,
                    expected: var.dims().to_vec(),
                    found: stored.dims().to_vec(),
                }
                .into());
            }
            var.set(stored)?;
        }
        Ok(())
    }
}
