use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid invoice number `{0}` (expected INV-<digits>)")]
    InvalidInvoiceNumber(String),
    #[error("amount out of range: {0}")]
    AmountOverflow(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

/// Failures crossing a crate boundary: storage, the model backend or config.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}
