//! Error types for resource loading and store updates.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ResourceKind;

/// Errors that can occur when loading or publishing resources.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A resource document failed to parse.
    #[error("failed to parse resource document {index}: {message}")]
    Parse { index: usize, message: String },

    /// The resource file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two resources of the same kind share a name.
    #[error("duplicate {kind} resource: {name}")]
    Duplicate { kind: ResourceKind, name: String },

    /// A resource has an empty name.
    #[error("{0} resource has an empty name")]
    EmptyName(ResourceKind),
}
