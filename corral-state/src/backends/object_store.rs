//! Object store backend for state storage
//!
//! Managers map to key prefixes under a fixed root:
//!
//! ```text
//! <root>/<name>/main.tf.json
//! <root>/<name>/terraform.tfstate
//! ```
//!
//! The store itself is abstracted behind [`ObjectStore`] so the backend logic
//! is the same for S3 and for the in-memory store used in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use super::local::{DOCUMENT_FILE, ENGINE_STATE_FILE};
use crate::backend::{BackendError, BackendResult, StateBackend, TerraformBackend, validate_name};
use crate::document::{Revision, StateDocument};

/// Errors reported by an object store, classified by the store client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A conditional write found a different version in place
    #[error("Precondition failed for object: {0}")]
    PreconditionFailed(String),

    #[error("Object store request failed: {0}")]
    Request(String),
}

pub type ObjectResult<T> = Result<T, ObjectStoreError>;

/// Condition attached to a put
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite
    None,
    /// Only succeed if no object exists under the key
    IfAbsent,
    /// Only succeed if the stored object has this ETag
    IfMatch(String),
}

/// Object fetched from a store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub etag: Option<String>,
}

/// Minimal object storage interface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object
    async fn get(&self, key: &str) -> ObjectResult<StoredObject>;

    /// Store an object, returning its new ETag when the store reports one
    async fn put(&self, key: &str, body: Vec<u8>, condition: PutCondition)
    -> ObjectResult<Option<String>>;

    /// Delete an object; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> ObjectResult<()>;

    /// Names of the immediate children of `prefix` (which ends with `/`)
    async fn list_children(&self, prefix: &str) -> ObjectResult<Vec<String>>;
}

/// In-process store kept in an ordered map, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> ObjectResult<std::sync::MutexGuard<'_, BTreeMap<String, StoredObject>>> {
        self.objects
            .lock()
            .map_err(|_| ObjectStoreError::Request("memory store lock poisoned".to_string()))
    }

    /// Keys currently stored, in order
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> ObjectResult<StoredObject> {
        self.objects()?
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        condition: PutCondition,
    ) -> ObjectResult<Option<String>> {
        let mut objects = self.objects()?;
        let current = objects.get(key).and_then(|o| o.etag.clone());
        let allowed = match &condition {
            PutCondition::None => true,
            PutCondition::IfAbsent => !objects.contains_key(key),
            PutCondition::IfMatch(etag) => current.as_deref() == Some(etag.as_str()),
        };
        if !allowed {
            return Err(ObjectStoreError::PreconditionFailed(key.to_string()));
        }

        let etag = format!("\"{}\"", Revision::of_bytes(&body));
        objects.insert(
            key.to_string(),
            StoredObject {
                body,
                etag: Some(etag.clone()),
            },
        );
        Ok(Some(etag))
    }

    async fn delete(&self, key: &str) -> ObjectResult<()> {
        self.objects()?.remove(key);
        Ok(())
    }

    async fn list_children(&self, prefix: &str) -> ObjectResult<Vec<String>> {
        let children: BTreeSet<String> = self
            .objects()?
            .keys()
            .filter_map(|key| key.strip_prefix(prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|child| !child.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }
}

/// Default root prefix
pub const DEFAULT_ROOT: &str = "cluster-managers";

/// State backend on top of any [`ObjectStore`]
pub struct ObjectStoreBackend<S> {
    store: S,
    /// Key prefix holding one "directory" per manager, without trailing `/`
    root: String,
    /// Engine backend settings shared by all managers; `key` is added per manager
    engine: TerraformBackend,
}

impl<S: ObjectStore> ObjectStoreBackend<S> {
    pub fn new(store: S, root: impl Into<String>, engine: TerraformBackend) -> Self {
        let root = root.into().trim_matches('/').to_string();
        Self {
            store,
            root,
            engine,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn state_dir(&self, name: &str) -> String {
        format!("{}/{}/", self.root, name)
    }

    /// Object key of the state document for a manager
    pub fn document_key(&self, name: &str) -> String {
        format!("{}{}", self.state_dir(name), DOCUMENT_FILE)
    }

    /// Object key of the engine execution state for a manager
    pub fn engine_state_key(&self, name: &str) -> String {
        format!("{}{}", self.state_dir(name), ENGINE_STATE_FILE)
    }

    /// Fetch the stored document bytes and ETag, `None` if there are none
    async fn read_stored(&self, name: &str) -> BackendResult<Option<StoredObject>> {
        match self.store.get(&self.document_key(name)).await {
            Ok(object) => Ok(Some(object)),
            Err(ObjectStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(BackendError::ObjectStore(e.to_string())),
        }
    }
}

#[async_trait]
impl<S: ObjectStore> StateBackend for ObjectStoreBackend<S> {
    async fn state(&self, name: &str) -> BackendResult<StateDocument> {
        validate_name(name)?;

        let Some(object) = self.read_stored(name).await? else {
            log::debug!("No state object for {}, starting empty", name);
            return Ok(StateDocument::new(name));
        };

        let doc = StateDocument::from_slice(name, &object.body)
            .map_err(|e| BackendError::InvalidState(e.to_string()))?;
        Ok(doc.with_revision(object.etag.map(Revision::new)))
    }

    async fn delete_state(&self, name: &str) -> BackendResult<()> {
        validate_name(name)?;

        // The directory marker goes last; some stores only drop a prefix
        // once it has no children.
        for key in [
            self.document_key(name),
            self.engine_state_key(name),
            self.state_dir(name),
        ] {
            self.store
                .delete(&key)
                .await
                .map_err(|e| BackendError::ObjectStore(e.to_string()))?;
        }

        log::debug!("Deleted state objects for {}", name);
        Ok(())
    }

    async fn persist_state(&self, doc: &mut StateDocument) -> BackendResult<()> {
        validate_name(doc.name())?;

        let body = doc.to_bytes()?;
        let condition = match doc.revision() {
            Some(revision) => PutCondition::IfMatch(revision.as_str().to_string()),
            None => PutCondition::IfAbsent,
        };

        let key = self.document_key(doc.name());
        let etag = match self.store.put(&key, body.clone(), condition).await {
            Ok(etag) => etag,
            Err(ObjectStoreError::PreconditionFailed(_)) => {
                log::warn!("Refusing to overwrite state {}: stale revision", doc.name());
                let stored = self
                    .read_stored(doc.name())
                    .await?
                    .and_then(|o| o.etag)
                    .map(Revision::new);
                return Err(BackendError::concurrent_modification(
                    doc.name(),
                    doc.revision(),
                    stored.as_ref(),
                ));
            }
            Err(e) => return Err(BackendError::ObjectStore(e.to_string())),
        };

        // Stores that don't echo the ETag on put get it read back, so the
        // next conditional write compares against what is actually stored.
        let etag = match etag {
            Some(etag) => Some(etag),
            None => self.read_stored(doc.name()).await?.and_then(|o| o.etag),
        };
        doc.set_revision(etag.map(Revision::new));
        log::debug!("Persisted state for {} ({} bytes)", doc.name(), body.len());
        Ok(())
    }

    async fn states(&self) -> BackendResult<Vec<String>> {
        self.store
            .list_children(&format!("{}/", self.root))
            .await
            .map_err(|e| BackendError::ObjectStore(e.to_string()))
    }

    fn terraform_backend(&self, name: &str) -> BackendResult<TerraformBackend> {
        validate_name(name)?;

        let mut config = match &self.engine.config {
            serde_json::Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        config.insert(
            "key".to_string(),
            serde_json::Value::String(self.engine_state_key(name)),
        );

        Ok(TerraformBackend {
            provider: self.engine.provider.clone(),
            config: serde_json::Value::Object(config),
        })
    }
}
