use std::{fs, path::Path, sync::Arc};

use candle_core::{Device, Tensor};
use nmr_networks::SpectrumBatch;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{config::to_runtime_error, seed::Determinism, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

const FRACTION_TOLERANCE: f64 = 1e-6;

/// One spectrum with its target.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Tensor,
    pub target: Tensor,
}

/// Indexable collection of samples.
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, index: usize) -> Result<Sample>;

    /// Samples at `indices` stacked along a new leading dimension.
    fn get_batch(&self, indices: &[usize]) -> Result<SpectrumBatch> {
        let samples = indices
            .iter()
            .map(|&idx| self.get(idx))
            .collect::<Result<Vec<_>>>()?;
        let inputs: Vec<&Tensor> = samples.iter().map(|s| &s.input).collect();
        let targets: Vec<&Tensor> = samples.iter().map(|s| &s.target).collect();
        Ok(SpectrumBatch::new(
            Tensor::stack(&inputs, 0).map_err(to_runtime_error)?,
            Tensor::stack(&targets, 0).map_err(to_runtime_error)?,
        ))
    }
}

/// Dataset backed by two tensors sharing their leading dimension.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Tensor,
    targets: Tensor,
}

impl TensorDataset {
    pub fn new(inputs: Tensor, targets: Tensor) -> Result<Self> {
        let n_inputs = inputs.dim(0).map_err(to_runtime_error)?;
        let n_targets = targets.dim(0).map_err(to_runtime_error)?;
        if n_inputs != n_targets {
            return Err(TrainingError::initialization(format!(
                "dataset has {n_inputs} inputs but {n_targets} targets"
            )));
        }
        Ok(Self { inputs, targets })
    }

    /// Reads `input_key` and `target_key` from a safetensors file.
    pub fn load(path: &Path, input_key: &str, target_key: &str, device: &Device) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path, device).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to read dataset {}: {err}",
                path.display()
            ))
        })?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                TrainingError::initialization(format!(
                    "dataset {} has no tensor named '{key}'",
                    path.display()
                ))
            })
        };
        let inputs = take(input_key)?;
        let targets = take(target_key)?;
        Self::new(inputs, targets)
    }

    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }
}

impl Dataset for TensorDataset {
    fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    fn get(&self, index: usize) -> Result<Sample> {
        Ok(Sample {
            input: self.inputs.get(index).map_err(to_runtime_error)?,
            target: self.targets.get(index).map_err(to_runtime_error)?,
        })
    }

    fn get_batch(&self, indices: &[usize]) -> Result<SpectrumBatch> {
        let ids: Vec<u32> = indices.iter().map(|&idx| idx as u32).collect();
        let ids = Tensor::new(ids.as_slice(), self.inputs.device()).map_err(to_runtime_error)?;
        Ok(SpectrumBatch::new(
            self.inputs.index_select(&ids, 0).map_err(to_runtime_error)?,
            self.targets.index_select(&ids, 0).map_err(to_runtime_error)?,
        ))
    }
}

/// Dataset indices assigned to each split.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitIndices {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
    pub test: Vec<usize>,
}

impl SplitIndices {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }
}

#[derive(Debug, Clone)]
pub enum SplitStrategy {
    /// Random split; the three fractions must sum to 1.
    Fractions { train: f64, val: f64, test: f64 },
    /// Fixed indices, typically read from a split file.
    Indices(SplitIndices),
}

/// Partitions `0..len` into train/val/test index sets.
///
/// Panics when fractional sizes do not sum to 1.
pub fn split_data_subsets(
    len: usize,
    strategy: &SplitStrategy,
    determinism: &mut Determinism,
) -> Result<SplitIndices> {
    match strategy {
        SplitStrategy::Indices(indices) => {
            let out_of_range = [&indices.train, &indices.val, &indices.test]
                .into_iter()
                .flatten()
                .find(|&&idx| idx >= len);
            if let Some(idx) = out_of_range {
                return Err(TrainingError::initialization(format!(
                    "split index {idx} is out of range for a dataset of {len} samples"
                )));
            }
            Ok(indices.clone())
        }
        SplitStrategy::Fractions { train, val, test } => {
            let fractions = [*train, *val, *test];
            let sum: f64 = fractions.iter().sum();
            assert!(
                (sum - 1.0).abs() < FRACTION_TOLERANCE,
                "split fractions must sum to 1 (got {sum})"
            );

            // Floors of fractions within the tolerance can overshoot `len`.
            let mut assigned = 0;
            let mut lengths = fractions.map(|f| {
                let n = ((f * len as f64).floor() as usize).min(len - assigned);
                assigned += n;
                n
            });
            let remainder = len - assigned;
            for i in 0..remainder {
                lengths[i % lengths.len()] += 1;
            }

            let mut order: Vec<usize> = (0..len).collect();
            order.shuffle(determinism.rng());

            let val_start = lengths[0];
            let test_start = val_start + lengths[1];
            let indices = SplitIndices {
                train: order[..val_start].to_vec(),
                val: order[val_start..test_start].to_vec(),
                test: order[test_start..].to_vec(),
            };
            log::info!(
                "split {len} samples into train={} val={} test={}",
                indices.train.len(),
                indices.val.len(),
                indices.test.len()
            );
            Ok(indices)
        }
    }
}

/// Ordered batches for one split.
pub trait BatchSource {
    fn num_batches(&self) -> usize;

    fn batch(&self, index: usize) -> Result<SpectrumBatch>;

    fn batches(&self) -> Box<dyn Iterator<Item = Result<SpectrumBatch>> + '_> {
        Box::new((0..self.num_batches()).map(move |idx| self.batch(idx)))
    }
}

impl BatchSource for Vec<SpectrumBatch> {
    fn num_batches(&self) -> usize {
        self.len()
    }

    fn batch(&self, index: usize) -> Result<SpectrumBatch> {
        self.get(index)
            .cloned()
            .ok_or_else(|| TrainingError::runtime(format!("batch {index} out of range")))
    }
}

/// Batches a subset of a dataset in index order. The last batch may be short.
pub struct DataLoader<D: Dataset> {
    dataset: Arc<D>,
    indices: Vec<usize>,
    batch_size: usize,
}

impl<D: Dataset> DataLoader<D> {
    pub fn new(dataset: Arc<D>, indices: Vec<usize>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        Ok(Self {
            dataset,
            indices,
            batch_size,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

impl<D: Dataset> BatchSource for DataLoader<D> {
    fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    fn batch(&self, index: usize) -> Result<SpectrumBatch> {
        let start = index * self.batch_size;
        if start >= self.indices.len() {
            return Err(TrainingError::runtime(format!("batch {index} out of range")));
        }
        let end = (start + self.batch_size).min(self.indices.len());
        self.dataset.get_batch(&self.indices[start..end])
    }
}
