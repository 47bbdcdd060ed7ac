//! Resource file parsing.
//!
//! Accepts either a JSON array of resources or a multi-document YAML stream.
//! Empty YAML documents (`---` separators with nothing between) are skipped.

use std::path::Path;

use serde::Deserialize;

use crate::error::ResourceError;
use crate::types::Resource;

/// Parse resources from text.
pub fn parse_resources(text: &str) -> Result<Vec<Resource>, ResourceError> {
    if text.trim_start().starts_with('[') {
        return serde_json::from_str(text).map_err(|e| ResourceError::Parse {
            index: 0,
            message: e.to_string(),
        });
    }

    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| ResourceError::Parse {
            index,
            message: e.to_string(),
        })?;
        if value.is_null() {
            continue;
        }

        let resource = serde_yaml::from_value(value).map_err(|e| ResourceError::Parse {
            index,
            message: e.to_string(),
        })?;
        resources.push(resource);
    }

    Ok(resources)
}

/// Read and parse a resource file.
pub fn load_file(path: &Path) -> Result<Vec<Resource>, ResourceError> {
    let text = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_resources(&text)
}
