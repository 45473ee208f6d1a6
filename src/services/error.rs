use super::lock::LockError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NamespaceError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("object `{path}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, path: String },
    #[error("version `{version}` of `{path}` not found in bucket `{bucket}`")]
    VersionNotFound {
        bucket: String,
        path: String,
        version: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    /// The target is the synthetic root directory, which is never a real entry.
    #[error("operation targets the root directory")]
    Root,
    #[error("counters of bucket `{bucket}` cannot absorb delta (count {count}, size {size})")]
    CounterInconsistency {
        bucket: String,
        count: i64,
        size: i64,
    },
    #[error("timed out waiting for lock `{0}`")]
    LockTimeout(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("metadata statement failed: {0}")]
    WriteFailed(#[from] sqlx::Error),
}

impl NamespaceError {
    pub fn object_not_found(bucket: &str, path: impl Into<String>) -> Self {
        NamespaceError::ObjectNotFound {
            bucket: bucket.to_string(),
            path: path.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            NamespaceError::BucketNotFound(_)
                | NamespaceError::ObjectNotFound { .. }
                | NamespaceError::VersionNotFound { .. }
        )
    }
}

pub type NamespaceResult<T> = Result<T, NamespaceError>;
