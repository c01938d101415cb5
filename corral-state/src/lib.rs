//! Corral State Management
//!
//! This crate persists the state of everything Corral has created for a
//! cluster manager. The state is a single JSON document that doubles as the
//! declarative input of the provisioning engine (Terraform/OpenTofu).
//!
//! # Overview
//!
//! - **StateDocument**: The JSON tree for one manager, with typed accessors for
//!   clusters, nodes and backups stored under `module`
//! - **ModuleKey**: The naming scheme that packs entity identity into module keys
//! - **allocate_hostnames**: Collision-free node names across repeated runs
//! - **StateBackend**: A trait for document storage (local directory, S3)
//!
//! # Example
//!
//! ```ignore
//! use corral_state::{create_backend, BackendConfig};
//!
//! let config: BackendConfig = serde_json::from_str(
//!     r#"{"type": "s3", "bucket": "my-state-bucket", "region": "eu-west-1"}"#,
//! )?;
//! let backend = create_backend(&config).await?;
//!
//! let mut doc = backend.state("manager-1").await?;
//! doc.set_terraform_backend(&backend.terraform_backend("manager-1")?)?;
//! let cluster = doc.add_cluster("aws", "prod", serde_json::json!({"source": "./cluster"}))?;
//! for name in doc.allocate_node_names(&cluster.to_string(), "web", 3)? {
//!     doc.add_node(&cluster.to_string(), &name, serde_json::json!({}))?;
//! }
//!
//! // ... run the provisioning engine on doc.to_bytes()? ...
//!
//! // Fails with ConcurrentModification if someone else wrote in between
//! backend.persist_state(&mut doc).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod document;
pub mod hostnames;
pub mod keys;

// Re-export main types for convenience
pub use backend::{BackendConfig, BackendError, BackendResult, StateBackend, TerraformBackend};
pub use backends::{LocalBackend, MemoryObjectStore, ObjectStoreBackend, S3ObjectStore, create_backend};
pub use document::{DocumentError, Revision, Scan, SkipReason, Skipped, StateDocument};
pub use hostnames::allocate_hostnames;
pub use keys::{BackupKey, Category, ClusterKey, KeyError, ModuleKey, NodeKey};
