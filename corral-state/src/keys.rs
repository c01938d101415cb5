//! Module key naming scheme
//!
//! Every entity tracked in a state document lives under `module.<key>`, where
//! the key encodes what the entity is and who it belongs to:
//!
//! | Category       | Pattern                                   |
//! |----------------|-------------------------------------------|
//! | Manager        | `cluster-manager`                         |
//! | Cluster        | `cluster_{provider}_{name}`               |
//! | Node           | `node_{provider}_{clusterName}_{nodeName}`|
//! | Cluster backup | `cluster-backup_{clusterKey}`             |
//!
//! The typed keys below are the only way the rest of the crate builds or
//! reads these strings. Identifiers are validated on construction so that a
//! key always decodes back into the parts it was built from.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Separator between key segments
pub const SEPARATOR: char = '_';

/// Literal key of the manager entry
pub const MANAGER_KEY: &str = "cluster-manager";

/// Errors produced while building or decoding module keys
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// A cluster key does not decode into `cluster_{provider}_{name}`
    #[error("Malformed cluster key: {0}")]
    MalformedClusterKey(String),

    /// A node key does not decode into `node_{provider}_{cluster}_{node}`
    #[error("Malformed node key: {0}")]
    MalformedNodeKey(String),

    /// A backup key does not decode into `cluster-backup_{clusterKey}`
    #[error("Malformed backup key: {0}")]
    MalformedBackupKey(String),

    /// The key does not start with any known category prefix
    #[error("Unknown module key category: {0}")]
    UnknownCategory(String),

    /// An identifier cannot be embedded in a key
    #[error("Invalid {kind} identifier {value:?}: must be non-empty and contain neither '_' nor '.'")]
    InvalidIdentifier { kind: &'static str, value: String },
}

pub type KeyResult<T> = Result<T, KeyError>;

/// Entity categories recognised under `module`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Manager,
    Cluster,
    Node,
    ClusterBackup,
}

impl Category {
    /// The string every key of this category starts with
    ///
    /// For `Manager` this is the whole key.
    pub fn prefix(self) -> &'static str {
        match self {
            Category::Manager => MANAGER_KEY,
            Category::Cluster => "cluster_",
            Category::Node => "node_",
            Category::ClusterBackup => "cluster-backup_",
        }
    }
}

/// Check whether a module key belongs to the given category
pub fn has_category_prefix(key: &str, category: Category) -> bool {
    match category {
        Category::Manager => key == MANAGER_KEY,
        other => key.starts_with(other.prefix()),
    }
}

fn validate_identifier(kind: &'static str, value: &str) -> KeyResult<()> {
    if value.is_empty() || value.contains(SEPARATOR) || value.contains('.') {
        return Err(KeyError::InvalidIdentifier {
            kind,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Key of a cluster entry: `cluster_{provider}_{name}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    provider: String,
    name: String,
}

impl ClusterKey {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> KeyResult<Self> {
        let provider = provider.into();
        let name = name.into();
        validate_identifier("provider", &provider)?;
        validate_identifier("cluster name", &name)?;
        Ok(Self { provider, name })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Prefix shared by the keys of every node in this cluster
    pub fn node_prefix(&self) -> String {
        format!("node_{}_{}_", self.provider, self.name)
    }

    /// Key of a node belonging to this cluster
    pub fn node(&self, node_name: impl Into<String>) -> KeyResult<NodeKey> {
        NodeKey::new(self.clone(), node_name)
    }

    /// Key of this cluster's backup entry
    pub fn backup(&self) -> BackupKey {
        BackupKey {
            cluster: self.clone(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster_{}_{}", self.provider, self.name)
    }
}

impl FromStr for ClusterKey {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        let malformed = || KeyError::MalformedClusterKey(s.to_string());
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        match parts.as_slice() {
            ["cluster", provider, name] => {
                Self::new(*provider, *name).map_err(|_| malformed())
            }
            _ => Err(malformed()),
        }
    }
}

/// Key of a node entry: `node_{provider}_{clusterName}_{nodeName}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    cluster: ClusterKey,
    node: String,
}

impl NodeKey {
    pub fn new(cluster: ClusterKey, node: impl Into<String>) -> KeyResult<Self> {
        let node = node.into();
        validate_identifier("node name", &node)?;
        Ok(Self { cluster, node })
    }

    pub fn cluster(&self) -> &ClusterKey {
        &self.cluster
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.cluster.node_prefix(), self.node)
    }
}

impl FromStr for NodeKey {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        let malformed = || KeyError::MalformedNodeKey(s.to_string());
        let parts: Vec<&str> = s.split(SEPARATOR).collect();
        match parts.as_slice() {
            ["node", provider, cluster, node] => {
                let cluster = ClusterKey::new(*provider, *cluster).map_err(|_| malformed())?;
                Self::new(cluster, *node).map_err(|_| malformed())
            }
            _ => Err(malformed()),
        }
    }
}

/// Key of a cluster backup entry: `cluster-backup_{clusterKey}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupKey {
    cluster: ClusterKey,
}

impl BackupKey {
    pub fn cluster(&self) -> &ClusterKey {
        &self.cluster
    }
}

impl fmt::Display for BackupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Category::ClusterBackup.prefix(), self.cluster)
    }
}

impl FromStr for BackupKey {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        let cluster = s
            .strip_prefix(Category::ClusterBackup.prefix())
            .and_then(|rest| rest.parse::<ClusterKey>().ok())
            .ok_or_else(|| KeyError::MalformedBackupKey(s.to_string()))?;
        Ok(Self { cluster })
    }
}

/// Any key that may appear under `module`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleKey {
    Manager,
    Cluster(ClusterKey),
    Node(NodeKey),
    ClusterBackup(BackupKey),
}

impl ModuleKey {
    pub fn category(&self) -> Category {
        match self {
            ModuleKey::Manager => Category::Manager,
            ModuleKey::Cluster(_) => Category::Cluster,
            ModuleKey::Node(_) => Category::Node,
            ModuleKey::ClusterBackup(_) => Category::ClusterBackup,
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleKey::Manager => f.write_str(MANAGER_KEY),
            ModuleKey::Cluster(key) => key.fmt(f),
            ModuleKey::Node(key) => key.fmt(f),
            ModuleKey::ClusterBackup(key) => key.fmt(f),
        }
    }
}

impl FromStr for ModuleKey {
    type Err = KeyError;

    fn from_str(s: &str) -> KeyResult<Self> {
        if has_category_prefix(s, Category::Manager) {
            Ok(ModuleKey::Manager)
        } else if has_category_prefix(s, Category::ClusterBackup) {
            s.parse().map(ModuleKey::ClusterBackup)
        } else if has_category_prefix(s, Category::Cluster) {
            s.parse().map(ModuleKey::Cluster)
        } else if has_category_prefix(s, Category::Node) {
            s.parse().map(ModuleKey::Node)
        } else {
            Err(KeyError::UnknownCategory(s.to_string()))
        }
    }
}

impl From<ClusterKey> for ModuleKey {
    fn from(key: ClusterKey) -> Self {
        ModuleKey::Cluster(key)
    }
}

impl From<NodeKey> for ModuleKey {
    fn from(key: NodeKey) -> Self {
        ModuleKey::Node(key)
    }
}

impl From<BackupKey> for ModuleKey {
    fn from(key: BackupKey) -> Self {
        ModuleKey::ClusterBackup(key)
    }
}

/// Encode a cluster key string
pub fn encode_cluster_key(provider: &str, name: &str) -> KeyResult<String> {
    Ok(ClusterKey::new(provider, name)?.to_string())
}

/// Encode a node key string
pub fn encode_node_key(provider: &str, cluster_name: &str, node_name: &str) -> KeyResult<String> {
    Ok(ClusterKey::new(provider, cluster_name)?
        .node(node_name)?
        .to_string())
}

/// Split a key into its provider and name segments
///
/// This is the legacy, lenient reading: any key with at least three
/// `_`-separated segments decodes, and segments past the third are ignored.
/// It cannot tell `cluster_aws_prod_eu` (name `prod_eu`) apart from a
/// cluster named `prod`; use [`ClusterKey::from_str`] for an exact decode.
pub fn decode_cluster_key_parts(key: &str) -> KeyResult<(String, String)> {
    let parts: Vec<&str> = key.split(SEPARATOR).collect();
    if parts.len() < 3 {
        return Err(KeyError::MalformedClusterKey(key.to_string()));
    }
    Ok((parts[1].to_string(), parts[2].to_string()))
}
