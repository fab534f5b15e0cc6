use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::{invalid, PredictionsError, Result};
use crate::format::{PredictionBatch, SavedSplit};

pub const PREDICTIONS_FILENAME: &str = "predictions.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

/// Top-level predictions layout. Splits that were not supplied are left out
/// of the file entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<SavedSplit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<SavedSplit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SavedSplit>,
}

impl PredictionsFile {
    pub fn split(&self, split: Split) -> Option<&SavedSplit> {
        match split {
            Split::Train => self.train.as_ref(),
            Split::Val => self.val.as_ref(),
            Split::Test => self.test.as_ref(),
        }
    }

    fn slot_mut(&mut self, split: Split) -> &mut Option<SavedSplit> {
        match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        }
    }

    pub fn present(&self) -> Vec<Split> {
        Split::ALL
            .into_iter()
            .filter(|split| self.split(*split).is_some())
            .collect()
    }
}

/// Formats the supplied splits and writes `predictions.json` into `dir`.
///
/// All supplied batches must share one payload kind. Numeric batches are
/// padded with `pad_token`.
pub fn save_inference_predictions(
    dir: &Path,
    train: Option<&PredictionBatch>,
    val: Option<&PredictionBatch>,
    test: Option<&PredictionBatch>,
    pad_token: i64,
) -> Result<PathBuf> {
    let supplied = [(Split::Train, train), (Split::Val, val), (Split::Test, test)];
    let mut kinds = supplied.iter().filter_map(|(_, batch)| batch.map(PredictionBatch::kind));
    if let Some(first) = kinds.next() {
        if let Some(other) = kinds.find(|kind| *kind != first) {
            return Err(invalid(format!(
                "cannot mix {first} and {other} predictions in one file"
            )));
        }
    }

    let mut file = PredictionsFile::default();
    for (split, batch) in supplied {
        if let Some(batch) = batch {
            *file.slot_mut(split) = Some(batch.to_saved(pad_token)?);
        }
    }

    let path = dir.join(PREDICTIONS_FILENAME);
    log::info!("saving predictions to {}", path.display());
    write_json(&path, &file)?;
    Ok(path)
}

pub fn load_inference_predictions(dir: &Path) -> Result<PredictionsFile> {
    read_json(&dir.join(PREDICTIONS_FILENAME))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    if !path.is_file() {
        return Err(PredictionsError::Missing(path.display().to_string()));
    }
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
