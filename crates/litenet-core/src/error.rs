use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Model config error: {field}: {reason}")]
    Config { field: String, reason: String },

    #[error("Checkpoint shape mismatch for '{key}': model expects {expected:?}, checkpoint has {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Strict checkpoint load failed: {missing} missing and {unexpected} unexpected keys")]
    StrictLoad { missing: usize, unexpected: usize },

    #[error("Parameter store lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    pub(crate) fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config { field: field.into(), reason: reason.into() }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
