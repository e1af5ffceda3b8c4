//! Filesystem driver. Implements the same key semantics as the object-store
//! driver using directory walks and byte copies, so the engine can run (and
//! be tested) without credentials.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    fail_writes_containing: Option<String>,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fail_writes_containing: None,
        }
    }

    /// Fault injection: writes whose key contains `needle` fail with
    /// `StorageUnavailable`. The driver exists to make the engine testable;
    /// this makes its failure paths testable too.
    pub fn with_write_failure(root: impl Into<PathBuf>, needle: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            fail_writes_containing: Some(needle.into()),
        }
    }

    fn check_write(&self, key: &str) -> Result<()> {
        match &self.fail_writes_containing {
            Some(needle) if key.contains(needle.as_str()) => Err(Error::StorageUnavailable(
                format!("injected write failure for {key}"),
            )),
            _ => Ok(()),
        }
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_file(&self, local: &Path, path: &str) -> Result<()> {
        self.check_write(path)?;
        let dst = self.resolve(path);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, dst).await?;
        Ok(())
    }

    pub async fn write_bytes(&self, bytes: &[u8], path: &str) -> Result<()> {
        self.check_write(path)?;
        let dst = self.resolve(path);
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dst, bytes).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, prefix: &str, suffix: Option<&str>) -> Result<Vec<String>> {
        let base = self.resolve(prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&base)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            let key = rel.to_string_lossy().replace('\\', "/");
            if suffix.is_none_or(|s| key.ends_with(s)) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn pull_tree(&self, remote_prefix: &str, local_dir: &Path) -> Result<Vec<String>> {
        let keys = self.list(remote_prefix, None).await?;
        for key in &keys {
            let dst = local_dir.join(key);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(self.resolve(remote_prefix).join(key), dst).await?;
        }
        Ok(keys)
    }

    pub async fn push_tree(&self, local_dir: &Path, remote_prefix: &str) -> Result<Vec<String>> {
        let mut pushed = Vec::new();
        for entry in WalkDir::new(local_dir) {
            let entry = entry.map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(|e| Error::StorageUnavailable(e.to_string()))?;
            let key = rel.to_string_lossy().replace('\\', "/");
            self.write_file(entry.path(), &super::join_key(remote_prefix, &key))
                .await?;
            pushed.push(key);
        }
        pushed.sort();
        Ok(pushed)
    }

    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let to = self.resolve(dst);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(self.resolve(src), to).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(src.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn describe(&self) -> Vec<(String, String)> {
        vec![
            ("backend".to_string(), "local".to_string()),
            ("root".to_string(), self.root.display().to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_of_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        assert!(matches!(
            backend.read("el9/x86_64/repodata/repomd.xml").await,
            Err(Error::NotFound(_))
        ));
    }

    /// `delete` of a missing key succeeds.
    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.delete("nope.rpm").await.unwrap();
    }

    #[tokio::test]
    async fn list_returns_relative_keys_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.write_bytes(b"a", "repo/repodata/repomd.xml").await.unwrap();
        backend.write_bytes(b"b", "repo/pkg.rpm").await.unwrap();
        let keys = backend.list("repo", None).await.unwrap();
        assert_eq!(keys, vec!["pkg.rpm", "repodata/repomd.xml"]);
        let xml = backend.list("repo", Some(".xml")).await.unwrap();
        assert_eq!(xml, vec!["repodata/repomd.xml"]);
    }

    #[tokio::test]
    async fn tree_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let stage = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.write_bytes(b"x", "dists/stable/Release").await.unwrap();
        backend
            .write_bytes(b"y", "dists/stable/main/binary-amd64/Packages")
            .await
            .unwrap();
        let pulled = backend.pull_tree("dists/stable", stage.path()).await.unwrap();
        assert_eq!(pulled.len(), 2);
        let pushed = backend
            .push_tree(stage.path(), "dists/copy")
            .await
            .unwrap();
        assert_eq!(pushed.len(), 2);
        assert!(backend.exists("dists/copy/Release").await.unwrap());
    }
}
