//! Backend implementations for state storage

mod local;
mod object_store;
mod s3;

pub use local::{DOCUMENT_FILE, ENGINE_STATE_FILE, LocalBackend};
pub use object_store::{
    DEFAULT_ROOT, MemoryObjectStore, ObjectResult, ObjectStore, ObjectStoreBackend,
    ObjectStoreError, PutCondition, StoredObject,
};
pub use s3::S3ObjectStore;

use crate::backend::{BackendConfig, BackendError, BackendResult, StateBackend};

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    match config.backend_type.as_str() {
        "local" => {
            let backend = LocalBackend::from_config(config)?;
            Ok(Box::new(backend))
        }
        "s3" => {
            let backend = ObjectStoreBackend::<S3ObjectStore>::from_config(config).await?;
            Ok(Box::new(backend))
        }
        other => Err(BackendError::unsupported_backend(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_unsupported_backend() {
        let config = BackendConfig::new("unsupported");

        let result = create_backend(&config).await;
        assert!(result.is_err());

        if let Err(BackendError::UnsupportedBackend(name)) = result {
            assert_eq!(name, "unsupported");
        } else {
            panic!("Expected UnsupportedBackend error");
        }
    }

    #[tokio::test]
    async fn test_local_backend_through_factory() {
        let dir = tempfile::tempdir().unwrap();
        let config: BackendConfig = serde_json::from_value(json!({
            "type": "local",
            "path": dir.path().to_string_lossy(),
        }))
        .unwrap();

        let backend = create_backend(&config).await.unwrap();
        let mut doc = backend.state("m").await.unwrap();
        doc.set_manager(json!({"region": "eu-west-1"})).unwrap();
        backend.persist_state(&mut doc).await.unwrap();

        assert_eq!(backend.states().await.unwrap(), vec!["m"]);
        assert!(dir.path().join("m").join(DOCUMENT_FILE).exists());
    }

    #[tokio::test]
    async fn test_s3_backend_config_error_through_factory() {
        let config = BackendConfig::new("s3");
        let result = create_backend(&config).await;
        assert!(matches!(result, Err(BackendError::Configuration(_))));
    }
}
