//! Persistence for model predictions.
//!
//! Inference produces, per split, a list of targets each paired with one or
//! more predictions. Predictions are either strings (SMILES) or ragged
//! integer sequences; the caller picks the [`PredictionBatch`] variant and
//! this crate turns it into a fixed JSON layout with `train`, `val` and
//! `test` sections for whichever splits were supplied.
//!
//! SMILES generation results use a separate layout that keeps structurally
//! valid predictions apart from invalid ones, see [`smiles`].

pub mod errors;
pub mod format;
pub mod postprocess;
pub mod smiles;
pub mod store;

pub use errors::{PredictionsError, Result};
pub use format::{
    find_max_length, pad_single_prediction, strip_padding, NumericMatrix, PaddedArraySet,
    PredictionBatch, PredictionRecord, SavedSplit, StringPredictionSet, DEFAULT_PAD_TOKEN,
};
pub use postprocess::{collate_predictions, load_substructure_metrics, save_substructure_metrics};
pub use smiles::{
    count_heavy_atoms, load_smiles_results, postprocess_save_smiles_results, BadPredictions,
    ProcessedSmiles, SmilesResultsFile, SmilesSplitResults, ValidPrediction,
};
pub use store::{
    load_inference_predictions, save_inference_predictions, PredictionsFile, Split,
};
