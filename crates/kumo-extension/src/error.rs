//! Extension runtime error types.

use thiserror::Error;

use crate::exception::HostError;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("conversion error: extension {id}: {message}")]
    Conversion { id: String, message: String },

    #[error("evaluation error: extension {id}: {message}")]
    Evaluation { id: String, message: String },

    #[error("initialization error: extension {id}: {message}")]
    Initialization { id: String, message: String },

    #[error("registration error: extension {id}: {message}")]
    Registration { id: String, message: String },

    #[error("extension {id} panicked while loading: {message}")]
    LoadPanicked { id: String, message: String },

    #[error("runtime pool exhausted: extension {0} timed out waiting for an instance")]
    AcquireTimeout(String),

    #[error("runtime pool acquire cancelled: extension {0}")]
    AcquireCancelled(String),

    #[error("runtime pool closed: extension {0}")]
    PoolClosed(String),

    #[error("invocation cancelled: extension {0}")]
    Cancelled(String),

    #[error("runtime instance error: {0}")]
    Instance(String),

    #[error("invocation of {function} failed in extension {id}: {source}")]
    Invocation {
        id: String,
        function: String,
        #[source]
        source: Box<ExtensionError>,
    },

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("script error: {0}")]
    Script(#[from] Box<rhai::EvalAltResult>),

    #[error("extension not found: {0}")]
    NotFound(String),

    #[error("extension {id} is a {actual}, not a {expected}")]
    TypeMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ExtensionError {
    /// Pool exhaustion and caller cancellation are retryable; everything
    /// else is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AcquireTimeout(_) | Self::AcquireCancelled(_) | Self::Cancelled(_) => true,
            Self::Invocation { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Wrap an error raised while invoking a script function.
    pub(crate) fn invocation(id: &str, function: &str, source: ExtensionError) -> Self {
        Self::Invocation {
            id: id.to_string(),
            function: function.to_string(),
            source: Box::new(source),
        }
    }
}
