//! Top-K checkpoint retention.
//!
//! A checkpoint is one safetensors file holding the model parameters under
//! `model_state_dict.` and the optimizer state under `optimizer_state_dict.`.
//! [`CheckpointSlots`] keeps exactly `K` slots; an unfilled slot carries an
//! infinite metric and no file. Each improvement evicts the single worst slot.
//! Selecting that slot is a linear scan, which is fine for the handful of
//! slots a run keeps and avoids heap bookkeeping on every eviction.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use hex::encode as hex_encode;
use nmr_networks::Network;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{config::to_runtime_error, optimizer::TrainerOptimizer, TrainingError};

pub const MODEL_STATE_PREFIX: &str = "model_state_dict.";
pub const OPTIMIZER_STATE_PREFIX: &str = "optimizer_state_dict.";
const FILENAME_PREFIX: &str = "model_epoch=";
const LOSS_MARKER: &str = "_loss=";
const EXTENSION: &str = ".safetensors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub path: PathBuf,
    pub sha256: String,
}

impl CheckpointRecord {
    pub fn file_name(&self) -> Option<String> {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Epoch, loss and tag recovered from a checkpoint file name.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointName {
    pub epoch: usize,
    pub loss: f64,
    pub tag: Option<String>,
}

/// A tag becomes part of a file name, so it may not name another directory.
pub fn check_checkpoint_tag(tag: &str) -> Result<(), String> {
    match tag.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
        Some(c) => Err(format!("checkpoint tag {tag:?} must not contain {c:?}")),
        None => Ok(()),
    }
}

/// `model_epoch={epoch}_loss={metric:.6}[_{tag}].safetensors`
pub fn checkpoint_filename(epoch: usize, metric: f64, tag: Option<&str>) -> String {
    match tag {
        Some(tag) if !tag.is_empty() => {
            format!("{FILENAME_PREFIX}{epoch}{LOSS_MARKER}{metric:.6}_{tag}{EXTENSION}")
        }
        _ => format!("{FILENAME_PREFIX}{epoch}{LOSS_MARKER}{metric:.6}{EXTENSION}"),
    }
}

pub fn parse_checkpoint_filename(name: &str) -> Option<CheckpointName> {
    let stem = name.strip_prefix(FILENAME_PREFIX)?.strip_suffix(EXTENSION)?;
    let (epoch, rest) = stem.split_once(LOSS_MARKER)?;
    let (loss, tag) = match rest.split_once('_') {
        Some((loss, tag)) => (loss, Some(tag.to_string())),
        None => (rest, None),
    };
    Some(CheckpointName {
        epoch: epoch.parse().ok()?,
        loss: loss.parse().ok()?,
        tag,
    })
}

/// Writes model and optimizer state to `dir` and waits for the file to reach
/// the disk.
pub fn save_model<N: Network + ?Sized>(
    dir: &Path,
    model: &N,
    optimizer: &TrainerOptimizer,
    epoch: usize,
    metric: f64,
    tag: Option<&str>,
) -> Result<CheckpointRecord, TrainingError> {
    fs::create_dir_all(dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            dir.display()
        ))
    })?;

    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let optimizer_state = optimizer.state_tensors()?;

    let mut tensors = HashMap::with_capacity(named_parameters.len() + optimizer_state.len());
    for (name, var) in named_parameters {
        tensors.insert(format!("{MODEL_STATE_PREFIX}{name}"), var.as_tensor().clone());
    }
    for (name, tensor) in optimizer_state {
        tensors.insert(format!("{OPTIMIZER_STATE_PREFIX}{name}"), tensor);
    }

    let path = dir.join(checkpoint_filename(epoch, metric, tag));
    candle_core::safetensors::save(&tensors, &path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to write checkpoint {}: {err}",
            path.display()
        ))
    })?;
    File::open(&path)
        .and_then(|file| file.sync_all())
        .map_err(|err| {
            TrainingError::runtime(format!("failed to sync {}: {err}", path.display()))
        })?;

    let sha256 = sha256_file(&path)?;
    log::debug!("saved checkpoint {} ({})", path.display(), &sha256[..12]);
    Ok(CheckpointRecord { path, sha256 })
}

pub fn delete_checkpoint(path: &Path) -> Result<(), TrainingError> {
    fs::remove_file(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to delete checkpoint {}: {err}",
            path.display()
        ))
    })
}

/// The two state blobs of a checkpoint file, with prefixes stripped.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub model_state: HashMap<String, Tensor>,
    pub optimizer_state: HashMap<String, Tensor>,
}

pub fn load_checkpoint(path: &Path, device: &Device) -> Result<LoadedCheckpoint, TrainingError> {
    let tensors = candle_core::safetensors::load(path, device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read checkpoint {}: {err}",
            path.display()
        ))
    })?;

    let mut model_state = HashMap::new();
    let mut optimizer_state = HashMap::new();
    for (name, tensor) in tensors {
        if let Some(param) = name.strip_prefix(MODEL_STATE_PREFIX) {
            model_state.insert(param.to_string(), tensor);
        } else if let Some(entry) = name.strip_prefix(OPTIMIZER_STATE_PREFIX) {
            optimizer_state.insert(entry.to_string(), tensor);
        } else {
            return Err(TrainingError::runtime(format!(
                "checkpoint {} contains unexpected tensor '{name}'",
                path.display()
            )));
        }
    }

    Ok(LoadedCheckpoint {
        model_state,
        optimizer_state,
    })
}

/// Loads a checkpoint into `model` and `optimizer`, optionally checking its
/// digest first.
pub fn restore_checkpoint<N: Network + ?Sized>(
    path: &Path,
    expected_sha256: Option<&str>,
    model: &N,
    optimizer: &mut TrainerOptimizer,
) -> Result<(), TrainingError> {
    if let Some(expected) = expected_sha256 {
        if sha256_file(path)? != expected {
            return Err(TrainingError::runtime(format!(
                "checkpoint file {} failed checksum validation",
                path.display()
            )));
        }
    }
    let loaded = load_checkpoint(path, model.device())?;
    apply_model_weights(model, loaded.model_state)?;
    optimizer.load_state_tensors(&loaded.optimizer_state)
}

pub fn apply_model_weights<N: Network + ?Sized>(
    model: &N,
    mut weights: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in model.named_parameters() {
        let tensor = weights.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !weights.is_empty() {
        let mut extra = weights.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
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

/// Fixed set of `K` best-so-far slots.
#[derive(Debug, Clone)]
pub struct CheckpointSlots {
    metrics: Vec<f64>,
    records: Vec<Option<CheckpointRecord>>,
}

impl CheckpointSlots {
    pub fn new(k: usize) -> Self {
        assert!(k > 0, "at least one checkpoint slot is required");
        Self {
            metrics: vec![f64::INFINITY; k],
            records: vec![None; k],
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Index of the largest metric; the first one wins ties.
    pub fn worst_slot(&self) -> usize {
        let mut worst = 0;
        for (idx, metric) in self.metrics.iter().enumerate().skip(1) {
            if *metric > self.metrics[worst] {
                worst = idx;
            }
        }
        worst
    }

    /// Replaces the worst slot when `metric` beats it.
    ///
    /// The evicted file is deleted before `persist` runs. If either step
    /// fails the slot is left unfilled and the error is returned.
    pub fn consider_with<F>(&mut self, metric: f64, persist: F) -> Result<bool, TrainingError>
    where
        F: FnOnce() -> Result<CheckpointRecord, TrainingError>,
    {
        let idx = self.worst_slot();
        if !(metric < self.metrics[idx]) {
            return Ok(false);
        }

        if let Some(old) = self.records[idx].take() {
            self.metrics[idx] = f64::INFINITY;
            delete_checkpoint(&old.path)?;
            log::debug!("evicted checkpoint {}", old.path.display());
        }

        let record = persist()?;
        self.metrics[idx] = metric;
        self.records[idx] = Some(record);
        Ok(true)
    }

    pub fn metrics(&self) -> &[f64] {
        &self.metrics
    }

    pub fn records(&self) -> &[Option<CheckpointRecord>] {
        &self.records
    }

    pub fn all_filled(&self) -> bool {
        self.records.iter().all(Option::is_some) && self.metrics.iter().all(|m| m.is_finite())
    }

    pub fn retained(&self) -> Vec<Option<PathBuf>> {
        self.records
            .iter()
            .map(|record| record.as_ref().map(|r| r.path.clone()))
            .collect()
    }
}

/// Owns the checkpoint directory and its slots for one run.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    tag: Option<String>,
    slots: CheckpointSlots,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, k: usize, tag: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            tag,
            slots: CheckpointSlots::new(k),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn slots(&self) -> &CheckpointSlots {
        &self.slots
    }

    /// Persists a checkpoint for `epoch` if `metric` ranks in the top `K`.
    pub fn consider<N: Network + ?Sized>(
        &mut self,
        metric: f64,
        model: &N,
        optimizer: &TrainerOptimizer,
        epoch: usize,
    ) -> Result<bool, TrainingError> {
        let dir = self.dir.as_path();
        let tag = self.tag.as_deref();
        let kept = self.slots.consider_with(metric, || {
            save_model(dir, model, optimizer, epoch, metric, tag)
        })?;
        if kept {
            log::info!("epoch {epoch}: retained checkpoint with loss {metric:.6}");
        }
        Ok(kept)
    }

    pub fn into_slots(self) -> CheckpointSlots {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_persist(dir: &Path, metric: f64) -> Result<CheckpointRecord, TrainingError> {
        let path = dir.join(checkpoint_filename(0, metric, None));
        fs::write(&path, metric.to_string())?;
        Ok(CheckpointRecord {
            sha256: sha256_file(&path)?,
            path,
        })
    }

    #[test]
    fn keeps_two_best_and_deletes_evicted_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = CheckpointSlots::new(2);

        for metric in [5.0, 3.0, 4.0, 1.0] {
            slots
                .consider_with(metric, || fake_persist(dir.path(), metric))
                .unwrap();
        }

        let mut kept = slots.metrics().to_vec();
        kept.sort_by(f64::total_cmp);
        assert_eq!(kept, vec![1.0, 3.0]);
        assert!(!dir.path().join(checkpoint_filename(0, 5.0, None)).exists());
        assert!(!dir.path().join(checkpoint_filename(0, 4.0, None)).exists());
        for path in slots.retained().into_iter().flatten() {
            assert!(path.exists());
        }
    }

    #[test]
    fn improving_metrics_fill_slots_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = CheckpointSlots::new(3);

        for metric in [0.9, 0.7, 0.5] {
            assert!(slots
                .consider_with(metric, || fake_persist(dir.path(), metric))
                .unwrap());
        }

        assert_eq!(slots.metrics(), &[0.9, 0.7, 0.5]);
        assert!(slots.all_filled());
        assert_eq!(slots.records().iter().filter(|r| r.is_some()).count(), 3);
    }

    #[test]
    fn worse_metric_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = CheckpointSlots::new(1);
        slots
            .consider_with(1.0, || fake_persist(dir.path(), 1.0))
            .unwrap();

        let kept = slots
            .consider_with(2.0, || panic!("must not persist"))
            .unwrap();

        assert!(!kept);
        assert_eq!(slots.metrics(), &[1.0]);
    }

    #[test]
    fn ties_evict_the_first_worst_slot() {
        let mut slots = CheckpointSlots::new(3);
        assert_eq!(slots.worst_slot(), 0);
        slots.metrics = vec![2.0, 4.0, 4.0];
        assert_eq!(slots.worst_slot(), 1);
    }

    #[test]
    fn failed_delete_aborts_and_leaves_slot_unfilled() {
        let dir = tempfile::tempdir().unwrap();
        let mut slots = CheckpointSlots::new(1);
        slots
            .consider_with(3.0, || fake_persist(dir.path(), 3.0))
            .unwrap();
        fs::remove_file(dir.path().join(checkpoint_filename(0, 3.0, None))).unwrap();

        let result = slots.consider_with(1.0, || fake_persist(dir.path(), 1.0));

        assert!(result.is_err());
        assert!(slots.records()[0].is_none());
        assert!(slots.metrics()[0].is_infinite());
    }

    #[test]
    fn filenames_round_trip() {
        let name = checkpoint_filename(12, 0.1234567, Some("mha"));
        assert_eq!(name, "model_epoch=12_loss=0.123457_mha.safetensors");

        let parsed = parse_checkpoint_filename(&name).unwrap();
        assert_eq!(parsed.epoch, 12);
        assert!((parsed.loss - 0.123457).abs() < 1e-12);
        assert_eq!(parsed.tag.as_deref(), Some("mha"));

        let untagged = parse_checkpoint_filename("model_epoch=0_loss=2.500000.safetensors").unwrap();
        assert_eq!(untagged.tag, None);
        assert!(parse_checkpoint_filename("weights.bin").is_none());
    }
}
