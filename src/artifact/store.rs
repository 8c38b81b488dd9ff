use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    artifact::{
        canonical,
        manifest::{ArtifactDescriptor, ArtifactKind, ArtifactStatus},
    },
    error::{ArtifactError, MintlabResult},
};

/// Content-addressed artifact store rooted at the data directory.
///
/// Objects live at `objects/<hh>/<hash>` (first two hex chars bucket the
/// directory); the descriptor index is a JSON file replaced atomically.
/// `put` of identical content is a no-op returning the same id, which is
/// what makes partial publication recoverable: a retry with the same inputs
/// deduplicates instead of conflicting.
pub struct ArtifactStore {
    root: PathBuf,
    index: Mutex<HashMap<String, ArtifactDescriptor>>,
}

impl ArtifactStore {
    pub fn open(root: impl Into<PathBuf>) -> MintlabResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects")).map_err(ArtifactError::Io)?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let bytes = fs::read(&index_path).map_err(ArtifactError::Io)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| ArtifactError::Canonical(e.to_string()))?
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Stores raw content. The artifact id is the blake3 hex of the bytes;
    /// identical content yields the identical id and a deduplicated write.
    pub fn put_bytes(
        &self,
        kind: ArtifactKind,
        content: &[u8],
        lineage: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> MintlabResult<String> {
        let artifact_id = canonical::hash_bytes(content);
        let path = self.object_path(&artifact_id);

        if !path.exists() {
            // Temp + rename: a partially written object is never observable
            // under its final name.
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(ArtifactError::Io)?;
            }
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, content).map_err(ArtifactError::Io)?;
            fs::rename(&tmp, &path).map_err(ArtifactError::Io)?;
            debug!(%artifact_id, %kind, "artifact written");
        }

        let mut index = self.lock();
        index
            .entry(artifact_id.clone())
            .and_modify(|d| {
                // Re-publishing resurrects a deleted object.
                if d.status == ArtifactStatus::Deleted {
                    d.status = ArtifactStatus::Active;
                }
            })
            .or_insert(ArtifactDescriptor {
                artifact_id: artifact_id.clone(),
                kind,
                content_hash: artifact_id.clone(),
                created_at,
                status: ArtifactStatus::Active,
                lineage,
            });
        self.persist_index(&index)?;

        Ok(artifact_id)
    }

    /// Stores a value in canonical JSON form. This is the only hashing path
    /// for structured content.
    pub fn put_canonical<T: Serialize>(
        &self,
        kind: ArtifactKind,
        value: &T,
        lineage: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> MintlabResult<String> {
        let bytes = canonical::to_canonical_json(value)?;
        self.put_bytes(kind, bytes.as_bytes(), lineage, created_at)
    }

    pub fn get_bytes(&self, artifact_id: &str) -> MintlabResult<Vec<u8>> {
        let path = self.object_path(artifact_id);
        fs::read(&path).map_err(|_| ArtifactError::NotFound(artifact_id.to_string()).into())
    }

    pub fn get_json<T: DeserializeOwned>(&self, artifact_id: &str) -> MintlabResult<T> {
        let bytes = self.get_bytes(artifact_id)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ArtifactError::Canonical(e.to_string()).into())
    }

    pub fn descriptor(&self, artifact_id: &str) -> MintlabResult<ArtifactDescriptor> {
        self.lock()
            .get(artifact_id)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()).into())
    }

    /// Retrieval by `(kind, content_hash)`.
    pub fn find(&self, kind: ArtifactKind, content_hash: &str) -> Option<ArtifactDescriptor> {
        self.lock()
            .values()
            .find(|d| d.kind == kind && d.content_hash == content_hash)
            .cloned()
    }

    pub fn list(
        &self,
        kind: Option<ArtifactKind>,
        status: Option<ArtifactStatus>,
    ) -> Vec<ArtifactDescriptor> {
        let mut out: Vec<ArtifactDescriptor> = self
            .lock()
            .values()
            .filter(|d| kind.is_none_or(|k| d.kind == k))
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.artifact_id.cmp(&b.artifact_id));
        out
    }

    pub fn mark_superseded(&self, artifact_id: &str) -> MintlabResult<()> {
        let mut index = self.lock();
        let descriptor = index
            .get_mut(artifact_id)
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))?;
        descriptor.status = ArtifactStatus::Superseded;
        self.persist_index(&index)
    }

    /// Errors unless the artifact exists and is active. Used by the
    /// experiment handler's input validation step.
    pub fn require_active(&self, artifact_id: &str) -> MintlabResult<ArtifactDescriptor> {
        let descriptor = self.descriptor(artifact_id)?;
        if descriptor.status != ArtifactStatus::Active {
            return Err(ArtifactError::NotActive {
                id: artifact_id.to_string(),
                status: descriptor.status.to_string(),
            }
            .into());
        }
        Ok(descriptor)
    }

    /// Breadth-first ancestor traversal over lineage edges, excluding the
    /// starting artifact, deduplicated in first-visit order.
    pub fn ancestors(&self, artifact_id: &str) -> MintlabResult<Vec<String>> {
        let index = self.lock();
        let mut queue: VecDeque<String> = index
            .get(artifact_id)
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))?
            .lineage
            .iter()
            .cloned()
            .collect();

        let mut seen = Vec::new();
        while let Some(id) = queue.pop_front() {
            if seen.contains(&id) {
                continue;
            }
            if let Some(descriptor) = index.get(&id) {
                queue.extend(descriptor.lineage.iter().cloned());
            }
            seen.push(id);
        }
        Ok(seen)
    }

    /// Removes an object file but keeps its descriptor (status `deleted`).
    /// Used by replay tests; content-addressing restores it on re-publish.
    pub fn delete_object(&self, artifact_id: &str) -> MintlabResult<()> {
        let path = self.object_path(artifact_id);
        if path.exists() {
            fs::remove_file(&path).map_err(ArtifactError::Io)?;
        }
        let mut index = self.lock();
        if let Some(descriptor) = index.get_mut(artifact_id) {
            descriptor.status = ArtifactStatus::Deleted;
        }
        self.persist_index(&index)
    }

    /// The store's root directory (scratch space for projections lives
    /// under it).
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn object_path(&self, artifact_id: &str) -> PathBuf {
        let bucket = &artifact_id[..artifact_id.len().min(2)];
        self.root.join("objects").join(bucket).join(artifact_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ArtifactDescriptor>> {
        self.index.lock().expect("artifact index lock")
    }

    fn persist_index(
        &self,
        index: &HashMap<String, ArtifactDescriptor>,
    ) -> MintlabResult<()> {
        let path = self.root.join("index.json");
        let tmp = path.with_extension("json.tmp");
        let bytes =
            serde_json::to_vec_pretty(index).map_err(|e| ArtifactError::Canonical(e.to_string()))?;
        fs::write(&tmp, bytes).map_err(ArtifactError::Io)?;
        fs::rename(&tmp, &path).map_err(ArtifactError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn identical_content_deduplicates() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let a = store
            .put_canonical(ArtifactKind::Metrics, &json!({"pnl": 1.5}), vec![], now())
            .unwrap();
        let b = store
            .put_canonical(ArtifactKind::Metrics, &json!({"pnl": 1.5}), vec![], now())
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list(Some(ArtifactKind::Metrics), None).len(), 1);
    }

    #[test]
    fn semantically_equal_content_hashes_identically() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let a = store
            .put_canonical(ArtifactKind::Metrics, &json!({"a": 1, "b": 2}), vec![], now())
            .unwrap();
        let b = store
            .put_canonical(ArtifactKind::Metrics, &json!({"b": 2, "a": 1}), vec![], now())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn get_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let id = store
            .put_canonical(ArtifactKind::Trades, &json!({"trades": [1, 2]}), vec![], now())
            .unwrap();
        let value: serde_json::Value = store.get_json(&id).unwrap();
        assert_eq!(value, json!({"trades": [1, 2]}));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let err = store.get_bytes("deadbeef").unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn superseded_artifacts_fail_active_check() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let id = store
            .put_canonical(ArtifactKind::Strategy, &json!({"v": 1}), vec![], now())
            .unwrap();
        store.require_active(&id).unwrap();
        store.mark_superseded(&id).unwrap();
        assert!(store.require_active(&id).is_err());
    }

    #[test]
    fn lineage_traversal_walks_ancestors() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let grandparent = store
            .put_canonical(ArtifactKind::Snapshot, &json!({"g": 1}), vec![], now())
            .unwrap();
        let parent = store
            .put_canonical(
                ArtifactKind::Metrics,
                &json!({"p": 1}),
                vec![grandparent.clone()],
                now(),
            )
            .unwrap();
        let child = store
            .put_canonical(
                ArtifactKind::Manifest,
                &json!({"c": 1}),
                vec![parent.clone()],
                now(),
            )
            .unwrap();

        let ancestors = store.ancestors(&child).unwrap();
        assert_eq!(ancestors, vec![parent, grandparent]);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let store = ArtifactStore::open(dir.path()).unwrap();
            store
                .put_canonical(ArtifactKind::Metrics, &json!({"x": 1}), vec![], now())
                .unwrap()
        };
        let store = ArtifactStore::open(dir.path()).unwrap();
        let descriptor = store.descriptor(&id).unwrap();
        assert_eq!(descriptor.kind, ArtifactKind::Metrics);
    }

    #[test]
    fn deleted_object_restores_on_republish() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();

        let id = store
            .put_canonical(ArtifactKind::Trades, &json!({"t": 1}), vec![], now())
            .unwrap();
        store.delete_object(&id).unwrap();
        assert!(store.get_bytes(&id).is_err());

        let id2 = store
            .put_canonical(ArtifactKind::Trades, &json!({"t": 1}), vec![], now())
            .unwrap();
        assert_eq!(id, id2);
        assert!(store.get_bytes(&id).is_ok());
    }
}
