//! State document: the JSON tree describing everything created for a manager
//!
//! The tree is kept untyped so per-provider configuration can be stored
//! verbatim. Entities live under `module.<key>` (see [`crate::keys`]) and the
//! provisioning engine's own backend configuration under
//! `terraform.backend.<provider>`.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::backend::TerraformBackend;
use crate::hostnames::allocate_hostnames;
use crate::keys::{
    BackupKey, Category, ClusterKey, KeyError, MANAGER_KEY, NodeKey, has_category_prefix,
};

const MODULE: &str = "module";
const TERRAFORM: &str = "terraform";
const BACKEND: &str = "backend";

/// Errors that can occur when reading or mutating a state document
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Empty path or empty path segment
    #[error("Malformed path: {0:?}")]
    MalformedPath(String),

    /// A path segment other than the last one points at a non-object value
    #[error("Path {0} runs through a non-object value")]
    PathConflict(String),

    /// Entity configuration must be a JSON object
    #[error("Configuration for {0} must be a JSON object")]
    ConfigNotObject(String),

    /// The identity field inside a config disagrees with its module key
    #[error("Field {field} of {key} is {actual}, expected {expected:?}")]
    FieldMismatch {
        key: String,
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Persisted bytes are not a JSON object
    #[error("Failed to parse state document {name}: {message}")]
    Parse { name: String, message: String },

    #[error("Failed to serialize state document {name}: {message}")]
    Serialization { name: String, message: String },
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Opaque token identifying the persisted version a document was loaded from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Revision derived from the SHA-256 of the stored bytes
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a module entry was left out of a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The key has the category prefix but does not decode
    MalformedKey,
    /// The identity field is absent
    MissingField(&'static str),
    /// The identity field is present but not a string
    WrongType(&'static str),
    /// The identity field disagrees with the name encoded in the key
    FieldMismatch(&'static str),
    /// An earlier entry already uses the same display name
    DuplicateName(String),
}

/// A module entry a scan could not use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skipped {
    pub key: String,
    pub reason: SkipReason,
}

/// Result of scanning `module` for one category of entries
///
/// Entries that look like the category but are partially written end up in
/// `skipped` instead of failing the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan<K> {
    /// Display name (cluster `name`, node `hostname`, ...) to key
    pub entries: BTreeMap<String, K>,
    pub skipped: Vec<Skipped>,
}

impl<K> Scan<K> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            skipped: Vec::new(),
        }
    }

    fn skip(&mut self, key: &str, reason: SkipReason) {
        log::warn!("Skipping module {}: {:?}", key, reason);
        self.skipped.push(Skipped {
            key: key.to_string(),
            reason,
        });
    }

    /// Record an entry under its display name unless another entry holds it
    fn insert(&mut self, key: &str, name: &str, value: K) {
        if self.entries.contains_key(name) {
            self.skip(key, SkipReason::DuplicateName(name.to_string()));
        } else {
            self.entries.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&K> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when no entry had to be skipped
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// In-memory state document for one manager
#[derive(Debug, Clone)]
pub struct StateDocument {
    name: String,
    tree: Map<String, Value>,
    revision: Option<Revision>,
}

impl StateDocument {
    /// Create an empty document (`{}`) that has never been persisted
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tree: Map::new(),
            revision: None,
        }
    }

    /// Load a document from its serialized form
    pub fn from_slice(name: impl Into<String>, bytes: &[u8]) -> DocumentResult<Self> {
        let name = name.into();
        let tree = match serde_json::from_slice::<Value>(bytes) {
            Ok(Value::Object(tree)) => tree,
            Ok(other) => {
                return Err(DocumentError::Parse {
                    name,
                    message: format!("expected a JSON object at the root, found {}", other),
                });
            }
            Err(e) => {
                return Err(DocumentError::Parse {
                    name,
                    message: e.to_string(),
                });
            }
        };

        Ok(Self {
            name,
            tree,
            revision: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Revision this document was loaded from, `None` if it was never persisted
    pub fn revision(&self) -> Option<&Revision> {
        self.revision.as_ref()
    }

    pub(crate) fn set_revision(&mut self, revision: Option<Revision>) {
        self.revision = revision;
    }

    pub fn with_revision(mut self, revision: Option<Revision>) -> Self {
        self.revision = revision;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// A copy of the whole tree
    pub fn to_value(&self) -> Value {
        Value::Object(self.tree.clone())
    }

    /// Serialize with sorted keys and two-space indentation
    ///
    /// These bytes are handed to the provisioning engine as-is.
    pub fn to_bytes(&self) -> DocumentResult<Vec<u8>> {
        let mut bytes =
            serde_json::to_vec_pretty(&self.tree).map_err(|e| DocumentError::Serialization {
                name: self.name.clone(),
                message: e.to_string(),
            })?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// String at a dotted path
    ///
    /// Returns an empty string when the path is absent, malformed or not a
    /// string; use [`StateDocument::get_value`] to tell those cases apart.
    pub fn get(&self, path: &str) -> String {
        match self.lookup(path) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }

    /// Copy of the value at a dotted path
    ///
    /// Numeric segments index into arrays.
    pub fn get_value(&self, path: &str) -> Option<Value> {
        self.lookup(path).cloned()
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let segments = split_path(path).ok()?;
        let (first, rest) = segments.split_first()?;
        let mut current = self.tree.get(*first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set the value at a dotted path, creating intermediate objects
    pub fn set(&mut self, path: &str, value: Value) -> DocumentResult<()> {
        let segments = split_path(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(DocumentError::MalformedPath(path.to_string()));
        };

        let mut current = &mut self.tree;
        for segment in parents {
            let child = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            current = match child {
                Value::Object(map) => map,
                _ => return Err(DocumentError::PathConflict(path.to_string())),
            };
        }
        current.insert(last.to_string(), value);
        Ok(())
    }

    /// Delete the value at a dotted path
    ///
    /// Deleting an absent path is a no-op; only a malformed path fails.
    pub fn delete(&mut self, path: &str) -> DocumentResult<()> {
        let segments = split_path(path)?;
        let Some((last, parents)) = segments.split_last() else {
            return Err(DocumentError::MalformedPath(path.to_string()));
        };

        let mut current = &mut self.tree;
        for segment in parents {
            match current.get_mut(*segment) {
                Some(Value::Object(map)) => current = map,
                _ => return Ok(()),
            }
        }
        current.remove(*last);
        Ok(())
    }

    fn modules(&self) -> Option<&Map<String, Value>> {
        self.tree.get(MODULE).and_then(Value::as_object)
    }

    fn modules_mut(&mut self) -> DocumentResult<&mut Map<String, Value>> {
        let modules = self
            .tree
            .entry(MODULE)
            .or_insert_with(|| Value::Object(Map::new()));
        match modules {
            Value::Object(map) => Ok(map),
            _ => Err(DocumentError::PathConflict(MODULE.to_string())),
        }
    }

    fn module(&self, key: &str) -> Option<Value> {
        self.modules().and_then(|m| m.get(key)).cloned()
    }

    /// Set the manager entry (`module.cluster-manager`)
    pub fn set_manager(&mut self, config: Value) -> DocumentResult<()> {
        if !config.is_object() {
            return Err(DocumentError::ConfigNotObject(MANAGER_KEY.to_string()));
        }
        self.modules_mut()?.insert(MANAGER_KEY.to_string(), config);
        Ok(())
    }

    pub fn manager(&self) -> Option<Value> {
        self.module(MANAGER_KEY)
    }

    /// Add or replace a cluster entry
    ///
    /// The config's `name` field is filled in when missing.
    pub fn add_cluster(
        &mut self,
        provider: &str,
        name: &str,
        config: Value,
    ) -> DocumentResult<ClusterKey> {
        let key = ClusterKey::new(provider, name)?;
        let config = with_identity_field(&key.to_string(), config, "name", name)?;

        self.modules_mut()?.insert(key.to_string(), config);
        log::debug!("Added cluster {} to {}", key, self.name);
        Ok(key)
    }

    /// Add or replace a node entry in an existing cluster key's namespace
    ///
    /// The config's `hostname` field is filled in with `node_name` when missing.
    pub fn add_node(
        &mut self,
        cluster_key: &str,
        node_name: &str,
        config: Value,
    ) -> DocumentResult<NodeKey> {
        let cluster: ClusterKey = cluster_key.parse()?;
        let key = cluster.node(node_name)?;
        let config = with_identity_field(&key.to_string(), config, "hostname", node_name)?;

        self.modules_mut()?.insert(key.to_string(), config);
        log::debug!("Added node {} to {}", key, self.name);
        Ok(key)
    }

    /// Add or replace the backup entry of a cluster
    pub fn add_cluster_backup(
        &mut self,
        cluster_key: &str,
        config: Value,
    ) -> DocumentResult<BackupKey> {
        let cluster: ClusterKey = cluster_key.parse()?;
        let key = cluster.backup();
        if !config.is_object() {
            return Err(DocumentError::ConfigNotObject(key.to_string()));
        }

        self.modules_mut()?.insert(key.to_string(), config);
        log::debug!("Added backup {} to {}", key, self.name);
        Ok(key)
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<Value> {
        self.module(&key.to_string())
    }

    pub fn node(&self, key: &NodeKey) -> Option<Value> {
        self.module(&key.to_string())
    }

    pub fn backup(&self, key: &BackupKey) -> Option<Value> {
        self.module(&key.to_string())
    }

    /// All clusters, by their `name` field
    pub fn clusters(&self) -> Scan<ClusterKey> {
        let mut scan = Scan::new();
        let Some(modules) = self.modules() else {
            return scan;
        };

        for (key, config) in modules {
            if !has_category_prefix(key, Category::Cluster) {
                continue;
            }
            let Ok(cluster) = key.parse::<ClusterKey>() else {
                scan.skip(key, SkipReason::MalformedKey);
                continue;
            };
            match identity_field(config, "name", cluster.name()) {
                Ok(name) => scan.insert(key, name, cluster),
                Err(reason) => scan.skip(key, reason),
            }
        }
        scan
    }

    /// All nodes of a cluster, by their `hostname` field
    pub fn nodes(&self, cluster_key: &str) -> DocumentResult<Scan<NodeKey>> {
        let cluster: ClusterKey = cluster_key.parse()?;
        let prefix = cluster.node_prefix();

        let mut scan = Scan::new();
        let Some(modules) = self.modules() else {
            return Ok(scan);
        };

        for (key, config) in modules.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            let Ok(node) = key.parse::<NodeKey>() else {
                scan.skip(key, SkipReason::MalformedKey);
                continue;
            };
            match identity_field(config, "hostname", node.node_name()) {
                Ok(hostname) => scan.insert(key, hostname, node),
                Err(reason) => scan.skip(key, reason),
            }
        }
        Ok(scan)
    }

    /// All cluster backups, by the key of the cluster they belong to
    pub fn backups(&self) -> Scan<BackupKey> {
        let mut scan = Scan::new();
        let Some(modules) = self.modules() else {
            return scan;
        };

        for key in modules.keys() {
            if !has_category_prefix(key, Category::ClusterBackup) {
                continue;
            }
            match key.parse::<BackupKey>() {
                Ok(backup) => {
                    scan.entries.insert(backup.cluster().to_string(), backup);
                }
                Err(_) => scan.skip(key, SkipReason::MalformedKey),
            }
        }
        scan
    }

    /// Remove a cluster together with its nodes and backup
    ///
    /// Returns the module keys that were removed.
    pub fn remove_cluster(&mut self, cluster_key: &str) -> DocumentResult<Vec<String>> {
        let cluster: ClusterKey = cluster_key.parse()?;
        let prefix = cluster.node_prefix();
        let backup = cluster.backup().to_string();
        let cluster = cluster.to_string();

        let Some(Value::Object(modules)) = self.tree.get_mut(MODULE) else {
            return Ok(Vec::new());
        };

        let doomed: Vec<String> = modules
            .keys()
            .filter(|k| **k == cluster || **k == backup || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &doomed {
            modules.remove(key);
        }

        log::debug!("Removed {} modules of {} from {}", doomed.len(), cluster, self.name);
        Ok(doomed)
    }

    /// Remove a single node, returning whether it was present
    pub fn remove_node(&mut self, node_key: &str) -> DocumentResult<bool> {
        let node: NodeKey = node_key.parse()?;
        let removed = match self.tree.get_mut(MODULE) {
            Some(Value::Object(modules)) => modules.remove(&node.to_string()).is_some(),
            _ => false,
        };
        Ok(removed)
    }

    /// Allocate fresh node names for a cluster, avoiding every name it already uses
    pub fn allocate_node_names(
        &self,
        cluster_key: &str,
        base: &str,
        count: i64,
    ) -> DocumentResult<Vec<String>> {
        let nodes = self.nodes(cluster_key)?;
        let mut taken: HashSet<String> = nodes.entries.keys().cloned().collect();
        taken.extend(nodes.entries.values().map(|k| k.node_name().to_string()));
        // Skipped entries still occupy their key
        taken.extend(
            nodes
                .skipped
                .iter()
                .filter_map(|s| s.key.parse::<NodeKey>().ok())
                .map(|k| k.node_name().to_string()),
        );
        Ok(allocate_hostnames(&taken, base, count))
    }

    /// Point the provisioning engine at its own execution-state storage
    ///
    /// Replaces any previously configured engine backend.
    pub fn set_terraform_backend(&mut self, backend: &TerraformBackend) -> DocumentResult<()> {
        let terraform = self
            .tree
            .entry(TERRAFORM)
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(terraform) = terraform else {
            return Err(DocumentError::PathConflict(TERRAFORM.to_string()));
        };

        let mut providers = Map::new();
        providers.insert(backend.provider.clone(), backend.config.clone());
        terraform.insert(BACKEND.to_string(), Value::Object(providers));
        Ok(())
    }

    pub fn terraform_backend(&self) -> Option<TerraformBackend> {
        let providers = self
            .tree
            .get(TERRAFORM)?
            .get(BACKEND)?
            .as_object()?;
        let (provider, config) = providers.iter().next()?;
        Some(TerraformBackend {
            provider: provider.clone(),
            config: config.clone(),
        })
    }
}

fn split_path(path: &str) -> DocumentResult<Vec<&str>> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(DocumentError::MalformedPath(path.to_string()));
    }
    Ok(segments)
}

/// Identity field of a scanned entry, which must match the name in its key
fn identity_field<'a>(
    config: &'a Value,
    field: &'static str,
    expected: &str,
) -> Result<&'a str, SkipReason> {
    match config.get(field) {
        None => Err(SkipReason::MissingField(field)),
        Some(Value::String(s)) if s == expected => Ok(s.as_str()),
        Some(Value::String(_)) => Err(SkipReason::FieldMismatch(field)),
        Some(_) => Err(SkipReason::WrongType(field)),
    }
}

fn with_identity_field(
    key: &str,
    config: Value,
    field: &'static str,
    expected: &str,
) -> DocumentResult<Value> {
    let Value::Object(mut map) = config else {
        return Err(DocumentError::ConfigNotObject(key.to_string()));
    };

    match map.get(field) {
        None => {
            map.insert(field.to_string(), Value::String(expected.to_string()));
        }
        Some(Value::String(actual)) if actual == expected => {}
        Some(actual) => {
            return Err(DocumentError::FieldMismatch {
                key: key.to_string(),
                field,
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> StateDocument {
        let mut doc = StateDocument::new("manager-1");
        doc.set_manager(json!({"source": "./modules/manager", "region": "eu-west-1"}))
            .unwrap();
        let prod = doc
            .add_cluster("aws", "prod", json!({"source": "./modules/cluster"}))
            .unwrap();
        doc.add_cluster("gcp", "dev", json!({"name": "dev", "zone": "b"}))
            .unwrap();
        doc.add_node(&prod.to_string(), "web-1", json!({"size": "m5.large"}))
            .unwrap();
        doc.add_node(&prod.to_string(), "web-2", json!({"size": "m5.large"}))
            .unwrap();
        doc
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = StateDocument::new("m");
        assert!(doc.is_empty());
        assert_eq!(doc.to_value(), json!({}));
        assert!(doc.revision().is_none());
        assert_eq!(doc.to_bytes().unwrap(), b"{}\n");
    }

    #[test]
    fn test_get_set_delete() {
        let mut doc = StateDocument::new("m");
        doc.set("a.b.c", json!("value")).unwrap();
        doc.set("a.n", json!(3)).unwrap();
        doc.set("list", json!(["x", "y"])).unwrap();

        assert_eq!(doc.get("a.b.c"), "value");
        // Present but not a string reads as empty, like an absent path
        assert_eq!(doc.get("a.n"), "");
        assert_eq!(doc.get("a.missing"), "");
        assert_eq!(doc.get_value("a.n"), Some(json!(3)));
        assert_eq!(doc.get_value("a.missing"), None);
        assert_eq!(doc.get("list.1"), "y");

        doc.delete("a.b.c").unwrap();
        assert_eq!(doc.get_value("a.b"), Some(json!({})));
        doc.delete("does.not.exist").unwrap();
        doc.delete("a.n.deeper").unwrap();
        assert_eq!(doc.get_value("a.n"), Some(json!(3)));
    }

    #[test]
    fn test_malformed_paths() {
        let mut doc = StateDocument::new("m");
        for path in ["", "a..b", ".a", "a."] {
            assert!(matches!(
                doc.set(path, json!(1)),
                Err(DocumentError::MalformedPath(_))
            ));
            assert!(matches!(
                doc.delete(path),
                Err(DocumentError::MalformedPath(_))
            ));
            assert_eq!(doc.get(path), "");
        }
    }

    #[test]
    fn test_set_through_scalar_conflicts() {
        let mut doc = StateDocument::new("m");
        doc.set("a", json!("leaf")).unwrap();
        assert!(matches!(
            doc.set("a.b", json!(1)),
            Err(DocumentError::PathConflict(_))
        ));
        assert_eq!(doc.get("a"), "leaf");
    }

    #[test]
    fn test_bytes_are_stable_and_sorted() {
        let mut a = StateDocument::new("m");
        a.set("zeta", json!(1)).unwrap();
        a.set("alpha.beta", json!(true)).unwrap();

        let mut b = StateDocument::new("m");
        b.set("alpha.beta", json!(true)).unwrap();
        b.set("zeta", json!(1)).unwrap();

        let bytes = a.to_bytes().unwrap();
        assert_eq!(bytes, b.to_bytes().unwrap());
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "{\n  \"alpha\": {\n    \"beta\": true\n  },\n  \"zeta\": 1\n}\n"
        );
    }

    #[test]
    fn test_round_trip() {
        let doc = sample();
        let bytes = doc.to_bytes().unwrap();
        let loaded = StateDocument::from_slice("manager-1", &bytes).unwrap();
        assert_eq!(loaded.to_value(), doc.to_value());
        assert_eq!(loaded.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_from_slice_rejects_garbage() {
        assert!(matches!(
            StateDocument::from_slice("m", b"{not json"),
            Err(DocumentError::Parse { .. })
        ));
        assert!(matches!(
            StateDocument::from_slice("m", b"[1, 2]"),
            Err(DocumentError::Parse { .. })
        ));
    }

    #[test]
    fn test_add_cluster_fills_and_checks_name() {
        let mut doc = StateDocument::new("m");
        let key = doc.add_cluster("aws", "prod", json!({})).unwrap();
        assert_eq!(key.to_string(), "cluster_aws_prod");
        assert_eq!(doc.get("module.cluster_aws_prod.name"), "prod");

        let err = doc
            .add_cluster("aws", "prod", json!({"name": "other"}))
            .unwrap_err();
        assert!(matches!(err, DocumentError::FieldMismatch { field: "name", .. }));

        let err = doc.add_cluster("aws", "prod", json!("nope")).unwrap_err();
        assert!(matches!(err, DocumentError::ConfigNotObject(_)));
    }

    #[test]
    fn test_add_node_with_malformed_cluster_key_does_not_mutate() {
        let mut doc = sample();
        let before = doc.to_value();

        let err = doc
            .add_node("cluster_onlytwo", "n", json!({"size": "small"}))
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::Key(KeyError::MalformedClusterKey(ref k)) if k == "cluster_onlytwo"
        ));
        assert_eq!(doc.to_value(), before);

        let mut empty = StateDocument::new("m");
        assert!(empty.add_node("cluster_onlytwo", "n", json!({})).is_err());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_add_node_sets_hostname() {
        let doc = sample();
        assert_eq!(doc.get("module.node_aws_prod_web-1.hostname"), "web-1");
        assert_eq!(doc.get("module.node_aws_prod_web-2.size"), "m5.large");
    }

    #[test]
    fn test_clusters_scan() {
        let doc = sample();
        let clusters = doc.clusters();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.is_clean());
        assert_eq!(clusters.get("prod").unwrap().to_string(), "cluster_aws_prod");
        assert_eq!(clusters.get("dev").unwrap().provider(), "gcp");
    }

    #[test]
    fn test_scans_skip_partial_entries() {
        let mut doc = sample();
        doc.set("module.cluster_azure_broken", json!({"region": "x"}))
            .unwrap();
        doc.set("module.cluster_azure_typed", json!({"name": 7}))
            .unwrap();
        doc.set("module.cluster_aws_too_many", json!({"name": "too"}))
            .unwrap();
        doc.set("module.node_aws_prod_web-3", json!({"size": "m5.large"}))
            .unwrap();

        let clusters = doc.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(
            clusters.skipped,
            vec![
                Skipped {
                    key: "cluster_aws_too_many".to_string(),
                    reason: SkipReason::MalformedKey,
                },
                Skipped {
                    key: "cluster_azure_broken".to_string(),
                    reason: SkipReason::MissingField("name"),
                },
                Skipped {
                    key: "cluster_azure_typed".to_string(),
                    reason: SkipReason::WrongType("name"),
                },
            ]
        );

        let nodes = doc.nodes("cluster_aws_prod").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes.skipped.len(), 1);
        assert_eq!(nodes.skipped[0].key, "node_aws_prod_web-3");
    }

    #[test]
    fn test_clusters_with_same_name_are_all_accounted_for() {
        let mut doc = StateDocument::new("m");
        doc.add_cluster("aws", "prod", json!({})).unwrap();
        doc.add_cluster("azure", "prod", json!({})).unwrap();

        let clusters = doc.clusters();
        assert_eq!(clusters.len() + clusters.skipped.len(), 2);
        assert_eq!(clusters.get("prod").unwrap().to_string(), "cluster_aws_prod");
        assert_eq!(
            clusters.skipped,
            vec![Skipped {
                key: "cluster_azure_prod".to_string(),
                reason: SkipReason::DuplicateName("prod".to_string()),
            }]
        );

        // Nodes are keyed per cluster, so equal hostnames never meet in one scan
        doc.add_node("cluster_aws_prod", "web-1", json!({})).unwrap();
        doc.add_node("cluster_azure_prod", "web-1", json!({})).unwrap();
        let nodes = doc.nodes("cluster_azure_prod").unwrap();
        assert!(nodes.is_clean());
        assert_eq!(
            nodes.get("web-1").unwrap().to_string(),
            "node_azure_prod_web-1"
        );
    }

    #[test]
    fn test_scans_skip_identity_mismatch() {
        let mut doc = sample();
        doc.set("module.cluster_aws_staging", json!({"name": "prod"}))
            .unwrap();
        doc.set("module.node_aws_prod_web-3", json!({"hostname": "web-1"}))
            .unwrap();

        let clusters = doc.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters.get("prod").unwrap().to_string(), "cluster_aws_prod");
        assert_eq!(
            clusters.skipped,
            vec![Skipped {
                key: "cluster_aws_staging".to_string(),
                reason: SkipReason::FieldMismatch("name"),
            }]
        );

        let nodes = doc.nodes("cluster_aws_prod").unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(
            nodes.get("web-1").unwrap().to_string(),
            "node_aws_prod_web-1"
        );
        assert_eq!(
            nodes.skipped,
            vec![Skipped {
                key: "node_aws_prod_web-3".to_string(),
                reason: SkipReason::FieldMismatch("hostname"),
            }]
        );
    }

    #[test]
    fn test_nodes_scan_is_scoped_to_cluster() {
        let mut doc = sample();
        doc.add_node("cluster_gcp_dev", "db-1", json!({})).unwrap();
        // Same cluster name under a different provider
        doc.add_node("cluster_azure_prod", "web-9", json!({})).unwrap();

        let nodes = doc.nodes("cluster_aws_prod").unwrap();
        assert_eq!(nodes.entries.keys().collect::<Vec<_>>(), vec!["web-1", "web-2"]);
        assert_eq!(
            nodes.get("web-1").unwrap().to_string(),
            "node_aws_prod_web-1"
        );

        assert_eq!(doc.nodes("cluster_gcp_dev").unwrap().len(), 1);
        assert!(doc.nodes("cluster_gcp_none").unwrap().is_empty());
        assert!(matches!(
            doc.nodes("cluster_onlytwo"),
            Err(DocumentError::Key(KeyError::MalformedClusterKey(_)))
        ));
    }

    #[test]
    fn test_backups_and_removal() {
        let mut doc = sample();
        let backup = doc
            .add_cluster_backup("cluster_aws_prod", json!({"schedule": "daily"}))
            .unwrap();
        assert_eq!(backup.to_string(), "cluster-backup_cluster_aws_prod");
        assert_eq!(doc.backups().len(), 1);
        assert_eq!(doc.backup(&backup).unwrap()["schedule"], "daily");

        let removed = doc.remove_cluster("cluster_aws_prod").unwrap();
        assert_eq!(
            removed,
            vec![
                "cluster-backup_cluster_aws_prod",
                "cluster_aws_prod",
                "node_aws_prod_web-1",
                "node_aws_prod_web-2",
            ]
        );
        assert_eq!(doc.clusters().len(), 1);
        assert!(doc.backups().is_empty());
        assert!(doc.manager().is_some());
    }

    #[test]
    fn test_remove_node() {
        let mut doc = sample();
        assert!(doc.remove_node("node_aws_prod_web-1").unwrap());
        assert!(!doc.remove_node("node_aws_prod_web-1").unwrap());
        assert!(doc.remove_node("node_aws").is_err());
        assert_eq!(doc.nodes("cluster_aws_prod").unwrap().len(), 1);
    }

    #[test]
    fn test_allocate_node_names() {
        let doc = sample();
        assert_eq!(
            doc.allocate_node_names("cluster_aws_prod", "web", 2).unwrap(),
            vec!["web-3", "web-4"]
        );
        assert_eq!(
            doc.allocate_node_names("cluster_aws_prod", "db", 1).unwrap(),
            vec!["db"]
        );

        let mut doc = doc;
        doc.set("module.node_aws_prod_web-3", json!({"hostname": "other"}))
            .unwrap();
        assert_eq!(
            doc.allocate_node_names("cluster_aws_prod", "web", 2).unwrap(),
            vec!["web-4", "web-5"]
        );
    }

    #[test]
    fn test_terraform_backend() {
        let mut doc = StateDocument::new("m");
        assert!(doc.terraform_backend().is_none());

        let backend = TerraformBackend {
            provider: "local".to_string(),
            config: json!({"path": "/tmp/m/terraform.tfstate"}),
        };
        doc.set_terraform_backend(&backend).unwrap();
        assert_eq!(doc.get("terraform.backend.local.path"), "/tmp/m/terraform.tfstate");

        let s3 = TerraformBackend {
            provider: "s3".to_string(),
            config: json!({"bucket": "b"}),
        };
        doc.set_terraform_backend(&s3).unwrap();
        assert_eq!(doc.terraform_backend(), Some(s3));
        assert_eq!(doc.get_value("terraform.backend.local"), None);
    }

    #[test]
    fn test_revision_of_bytes() {
        let a = Revision::of_bytes(b"{}\n");
        assert_eq!(a, Revision::of_bytes(b"{}\n"));
        assert_ne!(a, Revision::of_bytes(b"{ }\n"));
        assert_eq!(a.as_str().len(), 64);
    }
}
