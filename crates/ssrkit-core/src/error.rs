use std::path::PathBuf;
use thiserror::Error;

/// Core error type for ssrkit operations outside the module loader.
///
/// Module loading has its own [`crate::module::LoadError`], which must be
/// cloneable so it can be shared by every waiter on an in-flight load.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid route {file}: {message}")]
    InvalidRoute { file: String, message: String },

    #[error("The routes {first} and {second} both match {pattern}")]
    RouteConflict {
        first: String,
        second: String,
        pattern: String,
    },

    #[error("File watcher failed: {0}")]
    Watch(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    #[must_use]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}
