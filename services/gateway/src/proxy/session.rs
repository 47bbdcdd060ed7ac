//! Session persistence via cookie or header.
//!
//! The persisted value is an opaque token derived from the chosen target (or
//! backend) so internal addresses never leak to clients.

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue};
use sha2::{Digest, Sha256};

use edgeway_resources::{SessionPersistenceSpec, SessionPersistenceType};

use crate::error::BuildError;

/// Hex prefix of the SHA-256 of `key`.
pub fn session_token(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
enum Carrier {
    Cookie { name: String },
    Header { name: HeaderName },
}

/// Compiled session persistence settings.
#[derive(Debug, Clone)]
pub struct SessionPersistence {
    carrier: Carrier,
    max_age: Option<u64>,
}

impl SessionPersistence {
    pub fn from_spec(spec: &SessionPersistenceSpec) -> Result<Self, BuildError> {
        let carrier = match spec.persistence_type {
            SessionPersistenceType::Cookie => Carrier::Cookie {
                name: spec.session_name.clone(),
            },
            SessionPersistenceType::Header => Carrier::Header {
                name: HeaderName::from_bytes(spec.session_name.as_bytes())
                    .map_err(|_| BuildError::InvalidHeader(spec.session_name.clone()))?,
            },
        };
        Ok(Self {
            carrier,
            max_age: spec.absolute_timeout,
        })
    }

    /// Extract the persisted token from a request.
    pub fn restore(&self, headers: &HeaderMap) -> Option<String> {
        match &self.carrier {
            Carrier::Cookie { name } => headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(';'))
                .filter_map(|pair| pair.trim().split_once('='))
                .find(|(k, _)| *k == name.as_str())
                .map(|(_, v)| v.to_string()),
            Carrier::Header { name } => headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        }
    }

    /// Write the token onto a response.
    pub fn preserve(&self, headers: &mut HeaderMap, token: &str) {
        match &self.carrier {
            Carrier::Cookie { name } => {
                let cookie = match self.max_age {
                    Some(age) => format!("{name}={token}; Path=/; Max-Age={age}"),
                    None => format!("{name}={token}; Path=/"),
                };
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.append(SET_COOKIE, value);
                }
            }
            Carrier::Header { name } => {
                if let Ok(value) = HeaderValue::from_str(token) {
                    headers.insert(name.clone(), value);
                }
            }
        }
    }
}
