use thiserror::Error;

/// Failure taxonomy for every store-touching operation.
///
/// `NotFound` during find-or-create / refresh is recovered locally and is
/// often not an error at all; everything else propagates to the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("conflict: stale tip {0}")]
    Conflict(String),

    #[error("unauthorized signer: {0}")]
    Unauthorized(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("no authenticated actor: {0}")]
    Unauthenticated(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid document data: {0}")]
    InvalidData(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}
