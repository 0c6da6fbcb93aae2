use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use candle_core::{safetensors::load as load_safetensors, Tensor};
use candle_nn::VarMap;
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::CheckpointConfig, TrainingError};

const BEST_EXTENSION: &str = "safetensors";

/// Where and how a saved weight file landed on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

impl CheckpointRecord {
    /// Re-hashes the file and compares against the recorded digest.
    pub fn verify(&self) -> Result<(), TrainingError> {
        let actual = sha256_file(&self.path)?;
        if actual != self.sha256 {
            return Err(TrainingError::runtime(format!(
                "checkpoint file {} failed checksum validation",
                self.path.display()
            )));
        }
        Ok(())
    }
}

/// Per-epoch weight file: `<dir>/<prefix><epoch_index + 1><suffix>`.
pub fn checkpoint_path(cfg: &CheckpointConfig, epoch_index: usize) -> PathBuf {
    cfg.directory
        .join(format!("{}{}{}", cfg.prefix, epoch_index + 1, cfg.suffix))
}

/// Weight file rewritten on every validation improvement when `save_best` is on.
pub fn best_checkpoint_path(cfg: &CheckpointConfig) -> PathBuf {
    cfg.directory
        .join(format!("{}.{}", cfg.prefix, BEST_EXTENSION))
}

/// Serializes every named variable to safetensors. The file is written in
/// place, so an interrupted write leaves a truncated file behind.
pub fn save_model_weights(varmap: &VarMap, path: &Path) -> Result<CheckpointRecord, TrainingError> {
    let tensors: HashMap<String, Tensor> = {
        let vars = varmap
            .data()
            .lock()
            .map_err(|_| TrainingError::runtime("model parameter map is poisoned"))?;
        vars.iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect()
    };
    if tensors.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })?;

    file_record(path)
}

/// Restores every variable of `varmap` from `path`. Names must match exactly
/// in both directions and shapes must agree.
pub fn load_model_weights(varmap: &VarMap, path: &Path) -> Result<(), TrainingError> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TrainingError::runtime("model parameter map is poisoned"))?;
    let device = match vars.values().next() {
        Some(var) => var.device().clone(),
        None => {
            return Err(TrainingError::runtime(
                "model contains no parameters to restore",
            ))
        }
    };

    let mut tensors = load_safetensors(path, &device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read model weights from {}: {err}",
            path.display()
        ))
    })?;

    for (name, var) in vars.iter() {
        let tensor = tensors.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.dims()
            )));
        }
        let tensor = if tensor.dtype() == var.dtype() {
            tensor
        } else {
            tensor.to_dtype(var.dtype()).map_err(candle_to_training_error)?
        };
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !tensors.is_empty() {
        let mut extra = tensors.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

fn file_record(path: &Path) -> Result<CheckpointRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    Ok(CheckpointRecord {
        path: path.to_path_buf(),
        sha256,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
