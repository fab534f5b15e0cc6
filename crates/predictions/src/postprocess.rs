use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{invalid, Result};
use crate::format::{PredictionBatch, SavedSplit};
use crate::store::{read_json, write_json};

pub const SUBSTRUCTURE_METRICS_FILENAME: &str = "substructure_metrics.json";

/// Concatenates saved prediction sets, in order, into one batch of records.
///
/// Numeric sets are unpadded first, so sets padded to different widths can
/// be combined. All sets must share one payload kind.
pub fn collate_predictions<'a>(
    sets: impl IntoIterator<Item = &'a SavedSplit>,
) -> Result<PredictionBatch> {
    let mut collated: Option<PredictionBatch> = None;
    for set in sets {
        let batch = set.to_batch()?;
        collated = Some(match (collated, batch) {
            (None, batch) => batch,
            (Some(PredictionBatch::Strings(mut all)), PredictionBatch::Strings(more)) => {
                all.extend(more);
                PredictionBatch::Strings(all)
            }
            (Some(PredictionBatch::Arrays(mut all)), PredictionBatch::Arrays(more)) => {
                all.extend(more);
                PredictionBatch::Arrays(all)
            }
            (Some(all), more) => {
                return Err(invalid(format!(
                    "cannot collate {} predictions with {} predictions",
                    all.kind(),
                    more.kind()
                )))
            }
        });
    }
    collated.ok_or_else(|| invalid("no prediction sets to collate"))
}

/// Writes substructure metrics to `substructure_metrics.json` as given.
pub fn save_substructure_metrics<T: Serialize + ?Sized>(dir: &Path, metrics: &T) -> Result<PathBuf> {
    let path = dir.join(SUBSTRUCTURE_METRICS_FILENAME);
    write_json(&path, metrics)?;
    Ok(path)
}

pub fn load_substructure_metrics<T: DeserializeOwned>(dir: &Path) -> Result<T> {
    read_json(&dir.join(SUBSTRUCTURE_METRICS_FILENAME))
}
