//! Filesystem-backed object store.
//!
//! Production deployments point the store at a bucket; this backend
//! keeps the same contract on a local directory so the pipeline runs
//! without cloud credentials. Objects live at `<root>/<key>` with a
//! `.meta.json` sidecar for metadata; presigned URLs are `file://`
//! URLs with an expiry query parameter.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::error::LedgerError;
use crate::hashing;
use crate::providers::ObjectStore;
use crate::types::HexHash;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Opens (or creates) a store rooted at `root`.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, LedgerError> {
        fs::create_dir_all(&root).map_err(|e| LedgerError::ExternalFailed {
            source: format!("create object store root: {e}"),
        })?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Resolves a key under the root, rejecting path traversal.
    fn resolve(&self, key: &str) -> Result<PathBuf, LedgerError> {
        let rel = Path::new(key);
        let traversal = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || traversal {
            return Err(LedgerError::ExternalFailed {
                source: format!("invalid object key '{key}'"),
            });
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for FsObjectStore {
    fn put(
        &self,
        key: &str,
        bytes: &[u8],
        metadata: &BTreeMap<String, String>,
    ) -> Result<String, LedgerError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| LedgerError::ExternalFailed {
                source: format!("create object directory: {e}"),
            })?;
        }

        fs::write(&path, bytes).map_err(|e| LedgerError::ExternalFailed {
            source: format!("write object {key}: {e}"),
        })?;

        if !metadata.is_empty() {
            let meta_path = path.with_extension(format!(
                "{}.meta.json",
                path.extension().and_then(|e| e.to_str()).unwrap_or("bin")
            ));
            let text = serde_json::to_string_pretty(metadata)
                .expect("metadata maps serialize to JSON");
            fs::write(&meta_path, text).map_err(|e| LedgerError::ExternalFailed {
                source: format!("write object metadata {key}: {e}"),
            })?;
        }

        Ok(format!("file://{}", path.display()))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, LedgerError> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(LedgerError::not_found(format!("object {key}")))
            }
            Err(e) => Err(LedgerError::ExternalFailed {
                source: format!("read object {key}: {e}"),
            }),
        }
    }

    fn presign(&self, key: &str, ttl: Duration) -> Result<String, LedgerError> {
        let path = self.resolve(key)?;
        if !path.exists() {
            return Err(LedgerError::not_found(format!("object {key}")));
        }
        let expires = chrono::Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        Ok(format!(
            "file://{}?expires={}",
            path.display(),
            expires.timestamp()
        ))
    }

    fn verify(&self, key: &str, expected_hash: &HexHash) -> Result<bool, LedgerError> {
        let bytes = self.get(key)?;
        Ok(&hashing::hash_bytes(&bytes) == expected_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, FsObjectStore) {
        let tmp = TempDir::new().expect("create temp dir");
        let store = FsObjectStore::new(tmp.path()).expect("create store");
        (tmp, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_tmp, store) = store();
        let url = store
            .put("sheets/2026/03/07/abc_SHEET_1.jpg", b"image-bytes", &BTreeMap::new())
            .expect("put");
        assert!(url.starts_with("file://"));

        let bytes = store.get("sheets/2026/03/07/abc_SHEET_1.jpg").expect("get");
        assert_eq!(bytes, b"image-bytes");
    }

    #[test]
    fn missing_object_is_not_found() {
        let (_tmp, store) = store();
        let err = store.get("sheets/none").unwrap_err();
        assert!(matches!(err, LedgerError::NotFound { .. }));
    }

    #[test]
    fn verify_checks_content_address() {
        let (_tmp, store) = store();
        let bytes = b"scan data";
        let hash = hashing::hash_bytes(bytes);
        store
            .put("sheets/a", bytes, &BTreeMap::new())
            .expect("put");

        assert!(store.verify("sheets/a", &hash).expect("verify"));
        let other = hashing::hash_str("other");
        assert!(!store.verify("sheets/a", &other).expect("verify"));
    }

    #[test]
    fn presign_embeds_expiry() {
        let (_tmp, store) = store();
        store
            .put("sheets/a", b"x", &BTreeMap::new())
            .expect("put");
        let url = store
            .presign("sheets/a", Duration::from_secs(3600))
            .expect("presign");
        assert!(url.contains("expires="));
    }

    #[test]
    fn metadata_sidecar_is_written() {
        let (tmp, store) = store();
        let mut meta = BTreeMap::new();
        meta.insert("sheet_id".to_string(), "SHEET_1".to_string());
        store.put("sheets/a.jpg", b"x", &meta).expect("put");

        let sidecar = tmp.path().join("sheets/a.jpg.meta.json");
        assert!(sidecar.exists());
    }

    #[test]
    fn traversal_keys_are_rejected() {
        let (_tmp, store) = store();
        assert!(store.get("../outside").is_err());
        assert!(store.put("", b"x", &BTreeMap::new()).is_err());
    }
}
