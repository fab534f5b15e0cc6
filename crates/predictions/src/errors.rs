use thiserror::Error;

pub type Result<T> = std::result::Result<T, PredictionsError>;

#[derive(Error, Debug)]
pub enum PredictionsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("pad token {0} occurs in prediction data")]
    PadCollision(i64),

    #[error("invalid SMILES '{smiles}': {reason}")]
    Smiles { smiles: String, reason: String },

    #[error("invalid predictions: {0}")]
    Invalid(String),

    #[error("predictions file not found at {0}")]
    Missing(String),
}

pub(crate) fn invalid<S: Into<String>>(msg: S) -> PredictionsError {
    PredictionsError::Invalid(msg.into())
}
