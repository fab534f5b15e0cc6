use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{trainer::FitOutcome, TrainingConfig, TrainingError};

pub const LOSSES_FILENAME: &str = "losses.json";
pub const MODEL_NAMES_FILENAME: &str = "model_names_losses.json";
pub const COMPLETED_CONFIG_FILENAME: &str = "full_config.toml";
pub const TOKEN_SIZE_FILENAME: &str = "token_size_dict.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    pub train_losses: Vec<f64>,
    pub val_losses: Vec<f64>,
    pub test_losses: Vec<f64>,
}

/// One checkpoint slot. Unfilled slots have neither a name nor a loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetainedCheckpoint {
    pub model_name: Option<PathBuf>,
    pub best_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainHistory {
    pub losses: LossHistory,
    pub checkpoints: Vec<RetainedCheckpoint>,
}

impl From<&FitOutcome> for TrainHistory {
    fn from(outcome: &FitOutcome) -> Self {
        let checkpoints = outcome
            .records
            .iter()
            .zip(&outcome.best_losses)
            .map(|(record, loss)| RetainedCheckpoint {
                model_name: record.as_ref().map(|r| r.path.clone()),
                best_loss: loss.is_finite().then_some(*loss),
                sha256: record.as_ref().map(|r| r.sha256.clone()),
            })
            .collect();
        Self {
            losses: LossHistory {
                train_losses: outcome.train_losses.clone(),
                val_losses: outcome.val_losses.clone(),
                test_losses: outcome.test_losses.clone(),
            },
            checkpoints,
        }
    }
}

/// Writes `losses.json` and `model_names_losses.json` into `dir`.
pub fn save_train_history(dir: &Path, history: &TrainHistory) -> Result<(), TrainingError> {
    log::info!("saving loss history to {}", dir.display());
    write_json(&dir.join(LOSSES_FILENAME), &history.losses)?;
    write_json(&dir.join(MODEL_NAMES_FILENAME), &history.checkpoints)
}

pub fn load_train_history(dir: &Path) -> Result<TrainHistory, TrainingError> {
    Ok(TrainHistory {
        losses: read_json(&dir.join(LOSSES_FILENAME))?,
        checkpoints: read_json(&dir.join(MODEL_NAMES_FILENAME))?,
    })
}

/// Dumps the fully-resolved configuration next to the run outputs.
pub fn save_completed_config(dir: &Path, config: &TrainingConfig) -> Result<PathBuf, TrainingError> {
    let path = dir.join(COMPLETED_CONFIG_FILENAME);
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        TrainingError::runtime(format!("failed to render completed config: {err}"))
    })?;
    fs::write(&path, rendered)?;
    Ok(path)
}

pub fn save_token_size_dict(
    dir: &Path,
    token_sizes: &BTreeMap<String, usize>,
) -> Result<(), TrainingError> {
    write_json(&dir.join(TOKEN_SIZE_FILENAME), token_sizes)
}

pub fn load_token_size_dict(dir: &Path) -> Result<BTreeMap<String, usize>, TrainingError> {
    read_json(&dir.join(TOKEN_SIZE_FILENAME))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut data = serde_json::to_vec_pretty(value)?;
    data.push(b'\n');
    fs::write(path, data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, TrainingError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointRecord;

    fn outcome() -> FitOutcome {
        FitOutcome {
            train_losses: vec![3.0, 2.0],
            val_losses: vec![3.5, 2.5],
            test_losses: vec![3.2, 2.4],
            checkpoints: vec![Some(PathBuf::from("run/a.safetensors")), None],
            records: vec![
                Some(CheckpointRecord {
                    path: PathBuf::from("run/a.safetensors"),
                    sha256: "ab".repeat(32),
                }),
                None,
            ],
            best_losses: vec![2.5, f64::INFINITY],
            epochs_run: 2,
        }
    }

    #[test]
    fn unfilled_slots_serialize_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let history = TrainHistory::from(&outcome());
        save_train_history(dir.path(), &history).unwrap();

        let raw = fs::read_to_string(dir.path().join(MODEL_NAMES_FILENAME)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value[1]["model_name"], serde_json::Value::Null);
        assert_eq!(value[1]["best_loss"], serde_json::Value::Null);
        assert_eq!(value[0]["best_loss"], 2.5);

        assert_eq!(load_train_history(dir.path()).unwrap(), history);
    }

    #[test]
    fn token_sizes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = BTreeMap::from([("C".to_string(), 1usize), ("Cl".to_string(), 2)]);
        save_token_size_dict(dir.path(), &sizes).unwrap();
        assert_eq!(load_token_size_dict(dir.path()).unwrap(), sizes);
    }
}
