use thiserror::Error;

/// Errors surfaced by pipes, stage runners and components.
///
/// `Eof` is not a failure: sources return it to signal a clean end of
/// stream, and the runtime consumes it silently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipeError {
    /// Clean end of stream, returned by a source.
    #[error("end of stream")]
    Eof,
    /// A control event was delivered in a state that cannot accept it.
    #[error("invalid state")]
    InvalidState,
    /// A single-use component was run a second time.
    #[error("single-use component reused")]
    SingleUseReused,
    /// The pipe was built with an unusable topology.
    #[error("invalid routing: {0}")]
    InvalidRouting(String),
    /// Any other failure reported by a component callback or hook.
    #[error("stage failure: {0}")]
    StageFailure(String),
}

impl PipeError {
    /// Shorthand for a component failure with a message.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::StageFailure(message.into())
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

impl From<String> for PipeError {
    fn from(value: String) -> Self {
        Self::StageFailure(value)
    }
}
