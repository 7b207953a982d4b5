use thiserror::Error;

/// A selection referred to an offer the registry does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no offer with number {index} ({len} offers known)")]
pub struct IndexOutOfRange {
    pub index: usize,
    pub len: usize,
}

/// Operator input that could not be turned into a retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("input error: {token:?} is not an offer number")]
    Parse { token: String },
    #[error(transparent)]
    OutOfRange(#[from] IndexOutOfRange),
}
