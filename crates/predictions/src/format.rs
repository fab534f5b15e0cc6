//! In-memory prediction records and their fixed-shape on-disk forms.
//!
//! String predictions are stored as they are. Numeric predictions are ragged,
//! so every sequence is right-padded to the longest one in the batch and the
//! pad token is stored next to the matrices. The pad token must never occur
//! in real data; [`PaddedArraySet::from_records`] rejects batches where it
//! does, which keeps [`strip_padding`] exact.

use serde::{Deserialize, Serialize};

use crate::errors::{invalid, PredictionsError, Result};

/// Sentinel used for padding numeric predictions, far outside any token id.
pub const DEFAULT_PAD_TOKEN: i64 = 999_999;

/// One target and the predictions generated for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord<T> {
    pub target: T,
    pub predictions: Vec<T>,
}

impl<T> PredictionRecord<T> {
    pub fn new(target: T, predictions: Vec<T>) -> Self {
        Self {
            target,
            predictions,
        }
    }
}

/// Records of one split, tagged by payload kind.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionBatch {
    Strings(Vec<PredictionRecord<String>>),
    Arrays(Vec<PredictionRecord<Vec<i64>>>),
}

impl PredictionBatch {
    pub fn len(&self) -> usize {
        match self {
            PredictionBatch::Strings(records) => records.len(),
            PredictionBatch::Arrays(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PredictionBatch::Strings(_) => "strings",
            PredictionBatch::Arrays(_) => "arrays",
        }
    }

    /// Converts to the on-disk form, padding numeric sequences with
    /// `pad_token`.
    pub fn to_saved(&self, pad_token: i64) -> Result<SavedSplit> {
        Ok(match self {
            PredictionBatch::Strings(records) => {
                SavedSplit::Strings(StringPredictionSet::from_records(records))
            }
            PredictionBatch::Arrays(records) => {
                SavedSplit::Arrays(PaddedArraySet::from_records(records, pad_token)?)
            }
        })
    }
}

/// Targets and predictions stored directly as strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StringPredictionSet {
    pub targets: Vec<String>,
    pub predictions: Vec<Vec<String>>,
}

impl StringPredictionSet {
    pub fn from_records(records: &[PredictionRecord<String>]) -> Self {
        Self {
            targets: records.iter().map(|r| r.target.clone()).collect(),
            predictions: records.iter().map(|r| r.predictions.clone()).collect(),
        }
    }

    pub fn to_records(&self) -> Result<Vec<PredictionRecord<String>>> {
        if self.targets.len() != self.predictions.len() {
            return Err(invalid(format!(
                "{} targets but {} prediction rows",
                self.targets.len(),
                self.predictions.len()
            )));
        }
        Ok(self
            .targets
            .iter()
            .zip(&self.predictions)
            .map(|(target, predictions)| PredictionRecord::new(target.clone(), predictions.clone()))
            .collect())
    }
}

/// Row-major integer matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumericMatrix {
    pub shape: Vec<usize>,
    pub data: Vec<i64>,
}

impl NumericMatrix {
    pub fn new(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        let matrix = Self { shape, data };
        matrix.check()?;
        Ok(matrix)
    }

    /// Fails when `data` does not hold exactly as many values as `shape`
    /// describes. Deserialized matrices are not checked until used.
    pub fn check(&self) -> Result<()> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(invalid(format!(
                "matrix of shape {:?} needs {} values, got {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Length of the innermost dimension.
    pub fn width(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Innermost rows in storage order.
    pub fn rows(&self) -> Vec<&[i64]> {
        let width = self.width();
        if width == 0 {
            let count = self.shape.iter().rev().skip(1).product();
            return vec![&[][..]; count];
        }
        self.data.chunks(width).collect()
    }
}

/// Ragged numeric predictions padded into fixed-shape matrices.
///
/// `targets` has shape `(records, target_width)` and `predictions`
/// `(records, per_target, width)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaddedArraySet {
    pub targets: NumericMatrix,
    pub predictions: NumericMatrix,
    pub additional_pad_token: i64,
}

impl PaddedArraySet {
    /// # Panics
    ///
    /// Panics if the records do not all carry the same number of predictions.
    pub fn from_records(records: &[PredictionRecord<Vec<i64>>], pad_token: i64) -> Result<Self> {
        let per_target = records.first().map_or(0, |r| r.predictions.len());
        assert!(
            records.iter().all(|r| r.predictions.len() == per_target),
            "every target must carry the same number of predictions"
        );

        let collides = records
            .iter()
            .flat_map(|r| std::iter::once(&r.target).chain(&r.predictions))
            .any(|seq| seq.contains(&pad_token));
        if collides {
            return Err(PredictionsError::PadCollision(pad_token));
        }

        let predictions: Vec<&[Vec<i64>]> =
            records.iter().map(|r| r.predictions.as_slice()).collect();
        let width = find_max_length(&predictions);
        let target_width = records.iter().map(|r| r.target.len()).max().unwrap_or(0);

        let mut target_data = Vec::with_capacity(records.len() * target_width);
        for record in records {
            target_data.extend(pad_sequence(&record.target, target_width, pad_token));
        }
        let mut prediction_data = Vec::with_capacity(records.len() * per_target * width);
        for pred in &predictions {
            prediction_data.extend(pad_single_prediction(pred, width, pad_token).into_iter().flatten());
        }

        log::debug!(
            "padded {} records with {} predictions each to width {}",
            records.len(),
            per_target,
            width
        );
        Ok(Self {
            targets: NumericMatrix::new(vec![records.len(), target_width], target_data)?,
            predictions: NumericMatrix::new(
                vec![records.len(), per_target, width],
                prediction_data,
            )?,
            additional_pad_token: pad_token,
        })
    }

    /// Recovers the variable-length records by stripping trailing padding.
    pub fn to_records(&self) -> Result<Vec<PredictionRecord<Vec<i64>>>> {
        self.targets.check()?;
        self.predictions.check()?;
        let &[records, per_target, _] = self.predictions.shape.as_slice() else {
            return Err(invalid(format!(
                "prediction matrix must be 3-dimensional, got shape {:?}",
                self.predictions.shape
            )));
        };
        let target_rows = self.targets.rows();
        if target_rows.len() != records {
            return Err(invalid(format!(
                "{} target rows but {} prediction groups",
                target_rows.len(),
                records
            )));
        }

        let pad = self.additional_pad_token;
        let prediction_rows = self.predictions.rows();
        Ok(target_rows
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let group = &prediction_rows[i * per_target..(i + 1) * per_target];
                PredictionRecord::new(
                    strip_padding(target, pad),
                    group.iter().map(|row| strip_padding(row, pad)).collect(),
                )
            })
            .collect())
    }
}

/// On-disk form of one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SavedSplit {
    Arrays(PaddedArraySet),
    Strings(StringPredictionSet),
}

impl SavedSplit {
    pub fn to_batch(&self) -> Result<PredictionBatch> {
        Ok(match self {
            SavedSplit::Arrays(set) => PredictionBatch::Arrays(set.to_records()?),
            SavedSplit::Strings(set) => PredictionBatch::Strings(set.to_records()?),
        })
    }
}

/// Longest sequence across every prediction of every record.
pub fn find_max_length(predictions: &[&[Vec<i64>]]) -> usize {
    predictions
        .iter()
        .flat_map(|pred| pred.iter())
        .map(Vec::len)
        .max()
        .unwrap_or(0)
}

/// Right-pads each sequence of one record to `max_len`.
pub fn pad_single_prediction(pred: &[Vec<i64>], max_len: usize, pad_token: i64) -> Vec<Vec<i64>> {
    pred.iter()
        .map(|seq| pad_sequence(seq, max_len, pad_token))
        .collect()
}

pub fn strip_padding(row: &[i64], pad_token: i64) -> Vec<i64> {
    let end = row
        .iter()
        .rposition(|&value| value != pad_token)
        .map_or(0, |idx| idx + 1);
    row[..end].to_vec()
}

fn pad_sequence(seq: &[i64], max_len: usize, pad_token: i64) -> Vec<i64> {
    let mut padded = Vec::with_capacity(max_len);
    padded.extend_from_slice(seq);
    padded.resize(max_len, pad_token);
    padded
}
