//! Object-store driver over an S3 bucket.
//!
//! Credentials resolve through the SDK's standard chain; a named profile can
//! be selected explicitly or via `$REPO_PROFILE`. Transient transport
//! failures are retried by the SDK's default retry policy; whatever survives
//! that surfaces as `StorageUnavailable` and aborts the transaction.

use std::path::Path;

use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    bucket: String,
    profile: Option<String>,
    endpoint: Option<String>,
}

fn map_sdk<E, R>(err: SdkError<E, R>, what: &str) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some("AccessDenied") => Error::AccessDenied(what.to_string()),
        Some("NoSuchKey") | Some("NotFound") => Error::NotFound(what.to_string()),
        _ => Error::StorageUnavailable(format!("{what}: {}", DisplayErrorContext(&err))),
    }
}

impl S3Backend {
    /// Build a client against `bucket`. The endpoint override exists for
    /// S3-compatible stores and test servers; it forces path-style addressing.
    pub async fn connect(
        bucket: String,
        profile: Option<String>,
        endpoint: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = &profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&config);
        if let Some(endpoint) = &endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        debug!(%bucket, ?profile, ?endpoint, "connected S3 backend");
        Self {
            client,
            bucket,
            profile,
            endpoint,
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(map_sdk(e, path)),
        }
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| map_sdk(e, path))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| Error::StorageUnavailable(format!("{path}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    pub async fn write_file(&self, local: &Path, path: &str) -> Result<()> {
        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk(e, path))?;
        Ok(())
    }

    pub async fn write_bytes(&self, bytes: &[u8], path: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(bytes.to_vec().into())
            .send()
            .await
            .map_err(|e| map_sdk(e, path))?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        // S3 DeleteObject succeeds for missing keys, which matches the
        // idempotence contract.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| map_sdk(e, path))?;
        Ok(())
    }

    pub async fn list(&self, prefix: &str, suffix: Option<&str>) -> Result<Vec<String>> {
        let key_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix.trim_end_matches('/'))
        };
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&key_prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| map_sdk(e, prefix))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rel) = key.strip_prefix(&key_prefix) else {
                    continue;
                };
                if rel.is_empty() {
                    continue;
                }
                if suffix.is_none_or(|s| rel.ends_with(s)) {
                    keys.push(rel.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub async fn pull_tree(&self, remote_prefix: &str, local_dir: &Path) -> Result<Vec<String>> {
        let keys = self.list(remote_prefix, None).await?;
        for key in &keys {
            let bytes = self.read(&super::join_key(remote_prefix, key)).await?;
            let dst = local_dir.join(key);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dst, bytes).await?;
        }
        Ok(keys)
    }

    pub async fn push_tree(&self, local_dir: &Path, remote_prefix: &str) -> Result<Vec<String>> {
        let mut pushed = Vec::new();
        for entry in walkdir::WalkDir::new(local_dir) {
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
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .key(dst)
            .send()
            .await
            .map_err(|e| map_sdk(e, src))?;
        Ok(())
    }

    pub fn describe(&self) -> Vec<(String, String)> {
        let mut out = vec![
            ("backend".to_string(), "s3".to_string()),
            ("bucket".to_string(), self.bucket.clone()),
        ];
        if let Some(profile) = &self.profile {
            out.push(("profile".to_string(), profile.clone()));
        }
        if let Some(endpoint) = &self.endpoint {
            out.push(("endpoint".to_string(), endpoint.clone()));
        }
        out
    }
}
