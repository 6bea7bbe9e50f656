//! Error taxonomy shared by all pipeline stages

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required configuration structure was not loaded before use
    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    /// A caller-supplied argument is unusable (empty file list, thread
    /// count out of range, duplicate names, ...)
    #[error("invalid argument: {0}")]
    Validation(String),

    /// An index points outside the loaded tables
    #[error("out of range: {0}")]
    Range(String),

    /// A configuration file is not valid JSON for its schema
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A decoded record violates a format invariant
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// The cancellation flag was observed
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Error {
        Error::Json {
            path: path.into(),
            source,
        }
    }

    /// Process exit code the CLI maps this error kind to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigMissing(_)
            | Error::Validation(_)
            | Error::Range(_)
            | Error::Json { .. } => 1,
            Error::Cancelled => 130,
            Error::Io(_) | Error::Corrupt(_) => 2,
        }
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Error {
        match e.into_kind() {
            csv::ErrorKind::Io(io) => Error::Io(io),
            other => Error::Corrupt(format!("tsv: {other:?}")),
        }
    }
}
