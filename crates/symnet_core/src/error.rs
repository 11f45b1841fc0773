use thiserror::Error;

/// Errors surfaced by the symbolic network core.
///
/// Numeric divergence below the restart cap never reaches the caller; the training loop
/// handles it locally and only reports [`SymNetError::Diverged`] once the cap is exhausted.
#[derive(Debug, Error)]
pub enum SymNetError {
    /// Weight shapes, catalogue contents or other construction-time settings are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The dataset's input width does not match the network's input width.
    #[error("dataset has {found} input column(s) but the network expects {expected}")]
    DatasetShape { expected: usize, found: usize },

    /// Every training attempt produced a non-finite loss.
    #[error("training diverged in all {attempts} attempt(s)")]
    Diverged { attempts: usize },

    /// A formula could not be tokenized, parsed or compiled.
    #[error("formula error: {0}")]
    Formula(String),

    /// `backward` was called before any training-mode `forward`.
    #[error("no cached forward pass; call forward before backward")]
    MissingForward,
}

pub type Result<T> = std::result::Result<T, SymNetError>;

pub(crate) fn config_err(message: impl Into<String>) -> SymNetError {
    SymNetError::Configuration(message.into())
}
