use std::path::PathBuf;

/// Result alias that carries the custom [`DriftError`] type.
pub type Result<T> = std::result::Result<T, DriftError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DriftError {
    /// A tempo of zero, a negative tempo or a non-finite value was supplied
    /// to the beat clock.
    #[error("invalid tempo {0} bpm: tempo must be a positive number")]
    InvalidTempo(f64),
    /// The pattern source exists but could not be decoded or validated.
    #[error("failed to parse pattern `{}`: {reason}", path.display())]
    PatternParse { path: PathBuf, reason: String },
    /// The motion backend refused a command.
    #[error("motion command rejected: {0}")]
    CommandDispatch(String),
    /// The requested capability only exists as a stub.
    #[error("{0} is not implemented")]
    NotImplemented(String),
    /// An operation was attempted in the wrong engine state.
    #[error("{0}")]
    EngineState(String),
    /// The configuration document or one of its overrides is invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl DriftError {
    pub(crate) fn pattern_parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::PatternParse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` for errors that must abort session startup rather than
    /// being absorbed by the running scheduler.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::InvalidTempo(_) | Self::PatternParse { .. } | Self::Config(_) | Self::Io(_)
        )
    }
}

impl From<toml::de::Error> for DriftError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config(value.to_string())
    }
}
