//! Error types for the property store

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a change attempt did not commit
///
/// Carried on [`ChangeRecord::error`](crate::ChangeRecord::error); protocol
/// operations report these as data and never return them as `Err`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeError {
    #[error("key is not valid")]
    InvalidKey,

    #[error("init ignored, slot already holds a value")]
    Ignore,

    #[error("request duplicates the pending one")]
    Duplicated,

    #[error("superseded by a later request")]
    Expired,

    #[error("value rejected")]
    Invalid,

    #[error("not implemented for this handle")]
    NotImplemented,
}

impl ChangeError {
    /// Stable tag, identical to the serialized form
    pub fn tag(&self) -> &'static str {
        match self {
            ChangeError::InvalidKey => "invalid-key",
            ChangeError::Ignore => "ignore",
            ChangeError::Duplicated => "duplicated",
            ChangeError::Expired => "expired",
            ChangeError::Invalid => "invalid",
            ChangeError::NotImplemented => "not-implemented",
        }
    }
}

/// Failures of the typed accessors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to serialize value for `{key}`: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to deserialize value of `{key}`: {source}")]
    Deserialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No value for key `{0}`")]
    Missing(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_match_serialized_form() {
        for error in [
            ChangeError::InvalidKey,
            ChangeError::Ignore,
            ChangeError::Duplicated,
            ChangeError::Expired,
            ChangeError::Invalid,
            ChangeError::NotImplemented,
        ] {
            let json = serde_json::to_value(error).unwrap();
            assert_eq!(json, serde_json::Value::String(error.tag().to_string()));
        }
    }

    #[test]
    fn test_missing_message() {
        let err = StoreError::Missing("volume".into());
        assert_eq!(err.to_string(), "No value for key `volume`");
    }
}
