//! Local file backend for state storage
//!
//! Each manager gets a directory under the backend root:
//!
//! ```text
//! <root>/<name>/main.tf.json       # state document
//! <root>/<name>/terraform.tfstate  # engine execution state (never touched here)
//! ```

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::backend::{
    BackendConfig, BackendError, BackendResult, StateBackend, TerraformBackend, validate_name,
};
use crate::document::{Revision, StateDocument};

/// File name of the state document
pub const DOCUMENT_FILE: &str = "main.tf.json";

/// File name reserved for the engine's execution state
pub const ENGINE_STATE_FILE: &str = "terraform.tfstate";

/// Local file backend for development and single-machine use
pub struct LocalBackend {
    /// Directory holding one subdirectory per manager
    root: PathBuf,
}

impl LocalBackend {
    /// Default root directory
    pub const DEFAULT_ROOT: &'static str = ".corral/states";

    /// Create a new LocalBackend with the default root directory
    pub fn new() -> Self {
        Self::with_root(PathBuf::from(Self::DEFAULT_ROOT))
    }

    /// Create a new LocalBackend rooted at a specific directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a LocalBackend from configuration
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let root = config
            .get_string("path")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_ROOT));

        Ok(Self::with_root(root))
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path of the state document for a manager
    pub fn document_path(&self, name: &str) -> PathBuf {
        self.state_dir(name).join(DOCUMENT_FILE)
    }

    /// Path of the engine execution state for a manager
    pub fn engine_state_path(&self, name: &str) -> PathBuf {
        self.state_dir(name).join(ENGINE_STATE_FILE)
    }

    /// Read the stored document bytes, `None` if there are none
    async fn read_stored(&self, name: &str) -> BackendResult<Option<Vec<u8>>> {
        let path = self.document_path(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(format!(
                "Failed to read state file {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a file or empty directory, treating absence as success
async fn remove_if_present(path: &Path, is_dir: bool) -> BackendResult<()> {
    let result = if is_dir {
        fs::remove_dir(path).await
    } else {
        fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::Io(format!(
            "Failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn state(&self, name: &str) -> BackendResult<StateDocument> {
        validate_name(name)?;

        let Some(bytes) = self.read_stored(name).await? else {
            log::debug!("No state for {}, starting empty", name);
            return Ok(StateDocument::new(name));
        };

        let doc = StateDocument::from_slice(name, &bytes)
            .map_err(|e| BackendError::InvalidState(e.to_string()))?;
        Ok(doc.with_revision(Some(Revision::of_bytes(&bytes))))
    }

    async fn delete_state(&self, name: &str) -> BackendResult<()> {
        validate_name(name)?;

        remove_if_present(&self.document_path(name), false).await?;
        remove_if_present(&self.engine_state_path(name), false).await?;
        remove_if_present(&self.state_dir(name), true).await?;

        log::debug!("Deleted state for {}", name);
        Ok(())
    }

    async fn persist_state(&self, doc: &mut StateDocument) -> BackendResult<()> {
        validate_name(doc.name())?;

        let content = doc.to_bytes()?;

        let stored = self
            .read_stored(doc.name())
            .await?
            .map(|bytes| Revision::of_bytes(&bytes));
        if stored.as_ref() != doc.revision() {
            log::warn!("Refusing to overwrite state {}: stale revision", doc.name());
            return Err(BackendError::concurrent_modification(
                doc.name(),
                doc.revision(),
                stored.as_ref(),
            ));
        }

        let dir = self.state_dir(doc.name());
        fs::create_dir_all(&dir).await.map_err(|e| {
            BackendError::Io(format!(
                "Failed to create state directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = self.document_path(doc.name());
        fs::write(&path, &content)
            .await
            .map_err(|e| BackendError::Io(format!("Failed to write state file: {}", e)))?;

        doc.set_revision(Some(Revision::of_bytes(&content)));
        log::debug!("Persisted state for {} ({} bytes)", doc.name(), content.len());
        Ok(())
    }

    async fn states(&self) -> BackendResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(BackendError::Io(format!(
                    "Failed to list {}: {}",
                    self.root.display(),
                    e
                )));
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackendError::Io(e.to_string()))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| BackendError::Io(e.to_string()))?;
            if !file_type.is_dir() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn terraform_backend(&self, name: &str) -> BackendResult<TerraformBackend> {
        validate_name(name)?;
        Ok(TerraformBackend {
            provider: "local".to_string(),
            config: serde_json::json!({
                "path": self.engine_state_path(name).to_string_lossy(),
            }),
        })
    }
}
