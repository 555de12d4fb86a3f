use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecordError {
    /// Underlying page or file I/O failed.
    #[error("page I/O failed")]
    Io(#[source] std::io::Error),
    /// Caller-supplied argument violates a documented precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// Operation attempted on a closed store or cache.
    #[error("operation attempted on a closed store")]
    InvalidState,
    /// An on-disk invariant was violated; the store cannot continue safely.
    #[error("data corruption: {0}")]
    Corruption(&'static str),
}
