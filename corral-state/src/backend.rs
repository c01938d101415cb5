//! State backend trait and error types

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{DocumentError, Revision, StateDocument};

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// The manager name cannot be mapped onto a storage location
    #[error("Invalid state name: {0:?}")]
    InvalidName(String),

    /// The stored document changed since it was loaded
    #[error(
        "State {name} was modified concurrently (loaded revision: {expected}, stored revision: {actual})"
    )]
    ConcurrentModification {
        name: String,
        expected: String,
        actual: String,
    },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// Configuration error
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// Persisted document is corrupted or invalid
    #[error("Invalid state file: {0}")]
    InvalidState(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(String),

    /// Object store request failed
    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl BackendError {
    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn concurrent_modification(
        name: &str,
        expected: Option<&Revision>,
        actual: Option<&Revision>,
    ) -> Self {
        let describe = |r: Option<&Revision>| {
            r.map(|r| r.to_string())
                .unwrap_or_else(|| "<absent>".to_string())
        };
        Self::ConcurrentModification {
            name: name.to_string(),
            expected: describe(expected),
            actual: describe(actual),
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Where the provisioning engine keeps its own execution state
///
/// Written into a state document under `terraform.backend.<provider>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerraformBackend {
    /// Engine backend type (e.g., "local", "s3")
    pub provider: String,
    /// Engine backend settings
    pub config: serde_json::Value,
}

impl TerraformBackend {
    /// Dotted path of this configuration inside a state document
    pub fn path(&self) -> String {
        format!("terraform.backend.{}", self.provider)
    }
}

/// Trait for state storage backends
///
/// A backend maps manager names onto persisted state documents. Documents are
/// fully overwritten on persist; the revision a document was loaded from must
/// still be the stored one, otherwise the write is rejected.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Load the document for `name`
    ///
    /// Returns a new empty document if none has been persisted yet.
    async fn state(&self, name: &str) -> BackendResult<StateDocument>;

    /// Remove everything persisted for `name`
    ///
    /// Does not check whether anything still depends on the manager.
    async fn delete_state(&self, name: &str) -> BackendResult<()>;

    /// Overwrite the persisted document with `doc`
    ///
    /// On success the document's revision is updated to the stored one.
    async fn persist_state(&self, doc: &mut StateDocument) -> BackendResult<()>;

    /// Names of all managers with persisted state
    async fn states(&self) -> BackendResult<Vec<String>>;

    /// Engine backend configuration for the manager's execution state
    fn terraform_backend(&self, name: &str) -> BackendResult<TerraformBackend>;
}

/// Reject names that cannot be used as a single storage path component
pub(crate) fn validate_name(name: &str) -> BackendResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(BackendError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Configuration for a state backend
///
/// ```json
/// { "type": "s3", "bucket": "my-state", "region": "eu-west-1" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Backend type (e.g., "s3", "local")
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Backend-specific attributes
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    /// Get a required string attribute value
    pub fn require_string(&self, key: &str) -> BackendResult<&str> {
        self.get_string(key).ok_or_else(|| {
            BackendError::configuration(format!("Missing required attribute: {}", key))
        })
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.as_bool())
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }
}
