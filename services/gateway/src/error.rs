//! Error types for building gateway runtime state from resources.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while compiling resources into listeners, matchers and backends.
///
/// A build error only fails the listener, rule or backend it belongs to.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A regular expression in a match or filter failed to compile.
    #[error("invalid regular expression {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A filter type is not one of the built-ins.
    #[error("unknown filter type: {0}")]
    UnknownFilter(String),

    /// A filter is missing its config block or the block is invalid.
    #[error("invalid {filter_type} filter: {reason}")]
    InvalidFilter { filter_type: String, reason: String },

    /// A header name or value in a match or filter is not valid HTTP.
    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    /// A `retryOn` entry is neither a status code nor a `Nxx` class.
    #[error("invalid retryOn entry {0:?}")]
    InvalidRetryOn(String),

    /// An HTTP method in a match is not valid.
    #[error("invalid method {0:?}")]
    InvalidMethod(String),

    /// Certificate or key material could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Certificate or key material is unusable.
    #[error("tls configuration: {0}")]
    Tls(String),

    /// The listener spec is inconsistent.
    #[error("listener {listener}: {reason}")]
    Listener { listener: String, reason: String },
}

impl From<rustls::Error> for BuildError {
    fn from(err: rustls::Error) -> Self {
        BuildError::Tls(err.to_string())
    }
}
