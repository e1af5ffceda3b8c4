//! Pluggable byte-level storage.
//!
//! Paths are `/`-separated keys relative to the backend root. The object
//! store has no directories; `list` and the tree operations synthesize them
//! by splitting at `/`. `delete` is idempotent and swallows missing keys.
//! The engine assumes a single writer per repository; no ordering guarantees
//! are made across concurrent operations.

pub mod local;
pub mod s3;

use std::path::Path;

pub use local::LocalBackend;
pub use s3::S3Backend;

use crate::error::Result;

/// A storage driver. The set of drivers is closed, so dispatch is an enum
/// rather than a trait object (the capabilities are async).
#[derive(Debug, Clone)]
pub enum Backend {
    S3(S3Backend),
    Local(LocalBackend),
}

impl Backend {
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self {
            Backend::S3(b) => b.exists(path).await,
            Backend::Local(b) => b.exists(path).await,
        }
    }

    /// Read a whole object. Only used for metadata documents, which are
    /// bounded; package payloads never travel through this.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        match self {
            Backend::S3(b) => b.read(path).await,
            Backend::Local(b) => b.read(path).await,
        }
    }

    pub async fn write_file(&self, local: &Path, path: &str) -> Result<()> {
        match self {
            Backend::S3(b) => b.write_file(local, path).await,
            Backend::Local(b) => b.write_file(local, path).await,
        }
    }

    pub async fn write_bytes(&self, bytes: &[u8], path: &str) -> Result<()> {
        match self {
            Backend::S3(b) => b.write_bytes(bytes, path).await,
            Backend::Local(b) => b.write_bytes(bytes, path).await,
        }
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        match self {
            Backend::S3(b) => b.delete(path).await,
            Backend::Local(b) => b.delete(path).await,
        }
    }

    /// List keys under `prefix`, relative to it, optionally filtered by
    /// suffix. Nested keys keep their `/` separators.
    pub async fn list(&self, prefix: &str, suffix: Option<&str>) -> Result<Vec<String>> {
        match self {
            Backend::S3(b) => b.list(prefix, suffix).await,
            Backend::Local(b) => b.list(prefix, suffix).await,
        }
    }

    pub async fn pull_tree(&self, remote_prefix: &str, local_dir: &Path) -> Result<Vec<String>> {
        match self {
            Backend::S3(b) => b.pull_tree(remote_prefix, local_dir).await,
            Backend::Local(b) => b.pull_tree(remote_prefix, local_dir).await,
        }
    }

    pub async fn push_tree(&self, local_dir: &Path, remote_prefix: &str) -> Result<Vec<String>> {
        match self {
            Backend::S3(b) => b.push_tree(local_dir, remote_prefix).await,
            Backend::Local(b) => b.push_tree(local_dir, remote_prefix).await,
        }
    }

    /// Copy an object within the backend. Server-side on S3.
    pub async fn copy(&self, src: &str, dst: &str) -> Result<()> {
        match self {
            Backend::S3(b) => b.copy(src, dst).await,
            Backend::Local(b) => b.copy(src, dst).await,
        }
    }

    /// Human-readable label/value pairs describing where writes land.
    pub fn describe(&self) -> Vec<(String, String)> {
        match self {
            Backend::S3(b) => b.describe(),
            Backend::Local(b) => b.describe(),
        }
    }
}

/// Join two storage keys, tolerating an empty prefix.
pub fn join_key(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{}/{}", prefix.trim_end_matches('/'), rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_key_handles_empty_and_trailing_slash() {
        assert_eq!(join_key("", "repomd.xml"), "repomd.xml");
        assert_eq!(join_key("el9/x86_64/", "repodata"), "el9/x86_64/repodata");
        assert_eq!(join_key("dists", "stable/Release"), "dists/stable/Release");
    }
}
