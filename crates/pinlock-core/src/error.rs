use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type PinlockResult<T> = Result<T, PinlockError>;

/// Failure raised by a [`CredentialStore`](crate::store::CredentialStore).
///
/// Storage faults are surfaced to the caller as-is; nothing in this crate
/// retries them.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("store i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value for `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("failed to encode store contents: {0}")]
    Encode(String),

    #[error("store lock poisoned")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum PinlockError {
    #[error("[PL1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[PL1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[PL1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[PL1003] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[PL1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[PL2000] storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("[PL3000] unlock worker is no longer running")]
    WorkerGone,
}

impl PinlockError {
    pub fn code(&self) -> &'static str {
        match self {
            PinlockError::Io(_) => "PL1000",
            PinlockError::Toml(_) => "PL1001",
            PinlockError::Yaml(_) => "PL1002",
            PinlockError::Json(_) => "PL1003",
            PinlockError::InvalidConfig(_) => "PL1100",
            PinlockError::Storage(_) => "PL2000",
            PinlockError::WorkerGone => "PL3000",
        }
    }
}
