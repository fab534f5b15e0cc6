//! SMILES generation results, split into parsed and unparsed predictions.
//!
//! Valid predictions keep one group per target since each target may retain a
//! different number of predictions, each with its own substructure loss.
//! Invalid predictions carry nothing per prediction, so they are stored as a
//! single target list and an equal-width string matrix.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PredictionsError, Result};
use crate::store::{read_json, write_json, Split};

pub const SMILES_RESULTS_FILENAME: &str = "smiles_predictions.json";

/// Output of processing one chunk of SMILES predictions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedSmiles {
    pub good_targets: Vec<String>,
    /// Per good target, each retained prediction with its substructure BCE.
    pub preds_with_losses: Vec<Vec<(String, f64)>>,
    pub bad_targets: Vec<String>,
    pub bad_predictions: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidPrediction {
    pub target: String,
    pub prediction_strings: Vec<String>,
    pub prediction_bce_losses: Vec<f64>,
    pub num_heavy_atoms: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BadPredictions {
    pub targets: Vec<String>,
    pub predictions: Vec<Vec<String>>,
}

impl BadPredictions {
    /// # Panics
    ///
    /// Panics unless there is one prediction row per target and every row has
    /// the same width.
    pub fn new(targets: Vec<String>, predictions: Vec<Vec<String>>) -> Self {
        assert_eq!(
            targets.len(),
            predictions.len(),
            "bad predictions need one row per target"
        );
        if let Some(first) = predictions.first() {
            assert!(
                predictions.iter().all(|row| row.len() == first.len()),
                "bad prediction rows must all have the same width"
            );
        }
        Self {
            targets,
            predictions,
        }
    }

    pub fn width(&self) -> usize {
        self.predictions.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmilesSplitResults {
    pub valid_predictions: Vec<ValidPrediction>,
    pub bad_predictions: BadPredictions,
}

impl SmilesSplitResults {
    /// Gathers processed chunks into one split.
    ///
    /// # Panics
    ///
    /// Panics if a chunk's good targets and prediction groups differ in
    /// length, or if the bad predictions are not rectangular.
    pub fn from_processed(processed: impl IntoIterator<Item = ProcessedSmiles>) -> Result<Self> {
        let mut gathered = ProcessedSmiles::default();
        for chunk in processed {
            assert_eq!(
                chunk.good_targets.len(),
                chunk.preds_with_losses.len(),
                "each good target needs one prediction group"
            );
            gathered.good_targets.extend(chunk.good_targets);
            gathered.preds_with_losses.extend(chunk.preds_with_losses);
            gathered.bad_targets.extend(chunk.bad_targets);
            gathered.bad_predictions.extend(chunk.bad_predictions);
        }

        let valid_predictions = gathered
            .good_targets
            .into_iter()
            .zip(gathered.preds_with_losses)
            .map(|(target, group)| {
                let (prediction_strings, prediction_bce_losses) = group.into_iter().unzip();
                Ok(ValidPrediction {
                    num_heavy_atoms: count_heavy_atoms(&target)?,
                    target,
                    prediction_strings,
                    prediction_bce_losses,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            valid_predictions,
            bad_predictions: BadPredictions::new(gathered.bad_targets, gathered.bad_predictions),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmilesResultsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train: Option<SmilesSplitResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<SmilesSplitResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SmilesSplitResults>,
}

impl SmilesResultsFile {
    pub fn split(&self, split: Split) -> Option<&SmilesSplitResults> {
        match split {
            Split::Train => self.train.as_ref(),
            Split::Val => self.val.as_ref(),
            Split::Test => self.test.as_ref(),
        }
    }

    pub fn insert(&mut self, split: Split, results: SmilesSplitResults) {
        let slot = match split {
            Split::Train => &mut self.train,
            Split::Val => &mut self.val,
            Split::Test => &mut self.test,
        };
        *slot = Some(results);
    }
}

/// Gathers processed results per split and writes `smiles_predictions.json`.
pub fn postprocess_save_smiles_results(
    dir: &Path,
    splits: Vec<(Split, Vec<ProcessedSmiles>)>,
) -> Result<PathBuf> {
    let mut file = SmilesResultsFile::default();
    for (split, processed) in splits {
        let results = SmilesSplitResults::from_processed(processed)?;
        log::info!(
            "{}: {} valid and {} invalid SMILES targets",
            split.name(),
            results.valid_predictions.len(),
            results.bad_predictions.targets.len()
        );
        file.insert(split, results);
    }

    let path = dir.join(SMILES_RESULTS_FILENAME);
    write_json(&path, &file)?;
    Ok(path)
}

pub fn load_smiles_results(dir: &Path) -> Result<SmilesResultsFile> {
    read_json(&dir.join(SMILES_RESULTS_FILENAME))
}

const ORGANIC_SUBSET: [&str; 10] = ["Cl", "Br", "B", "C", "N", "O", "P", "S", "F", "I"];
const AROMATIC_SUBSET: [char; 6] = ['b', 'c', 'n', 'o', 'p', 's'];

/// Number of non-hydrogen atoms in a SMILES string.
///
/// Hydrogens written as bracket atoms are not counted, and neither are
/// wildcard atoms.
pub fn count_heavy_atoms(smiles: &str) -> Result<usize> {
    let error = |reason: String| PredictionsError::Smiles {
        smiles: smiles.to_string(),
        reason,
    };

    let mut count = 0;
    let mut rest = smiles;
    while let Some(c) = rest.chars().next() {
        if c == '[' {
            let close = rest
                .find(']')
                .ok_or_else(|| error("unterminated bracket atom".into()))?;
            if bracket_element(&rest[1..close]) != "H" {
                count += 1;
            }
            rest = &rest[close + 1..];
            continue;
        }

        if let Some(symbol) = ORGANIC_SUBSET.iter().find(|s| rest.starts_with(**s)) {
            count += 1;
            rest = &rest[symbol.len()..];
            continue;
        }
        if AROMATIC_SUBSET.contains(&c) {
            count += 1;
        } else if !(c.is_ascii_digit() || "-=#$:/\\.()%+*@".contains(c)) {
            return Err(error(format!("unexpected character '{c}'")));
        }
        rest = &rest[c.len_utf8()..];
    }
    Ok(count)
}

/// Element symbol of a bracket atom body such as `13CH3+` or `nH`.
fn bracket_element(body: &str) -> &str {
    let body = body.trim_start_matches(|c: char| c.is_ascii_digit());
    let mut chars = body.char_indices();
    match chars.next() {
        Some((_, first)) if first.is_ascii_uppercase() => {
            let end = match chars.next() {
                Some((idx, second)) if second.is_ascii_lowercase() => idx + second.len_utf8(),
                _ => first.len_utf8(),
            };
            &body[..end]
        }
        Some((_, first)) => &body[..first.len_utf8()],
        None => "",
    }
}
