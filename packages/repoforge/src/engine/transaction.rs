//! Backup / commit / restore over the live metadata prefix.
//!
//! Begin snapshots every object under the metadata prefix into a timestamped
//! sibling (`<dir>.backup-YYYYMMDD-HHMMSS`) with backend-side copies.
//! Commit deletes the snapshot; restore copies it back, deletes live objects
//! the snapshot doesn't know, and leaves the snapshot in place for
//! inspection. The snapshot covers metadata only, never packages.

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::storage::{Backend, join_key};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Committed,
    Restored,
}

pub struct Transaction<'a> {
    backend: &'a Backend,
    live_prefix: String,
    backup_prefix: Option<String>,
    outcome: Outcome,
    /// Backup prefixes left behind by earlier interrupted runs. Reported,
    /// never auto-recovered.
    pub legacy_backups: Vec<String>,
}

impl<'a> Transaction<'a> {
    /// Snapshot the live metadata prefix and open the transaction.
    pub async fn begin(
        backend: &'a Backend,
        live_prefix: &str,
        with_backup: bool,
    ) -> Result<Transaction<'a>> {
        let (parent, base) = match live_prefix.rsplit_once('/') {
            Some((parent, base)) => (parent.to_string(), base.to_string()),
            None => (String::new(), live_prefix.to_string()),
        };

        let marker = format!("{base}.backup-");
        let mut legacy_backups: Vec<String> = backend
            .list(&parent, None)
            .await?
            .into_iter()
            .filter_map(|key| {
                let first = key.split('/').next().unwrap_or(&key);
                first
                    .starts_with(&marker)
                    .then(|| join_key(&parent, first))
            })
            .collect();
        legacy_backups.dedup();
        for prefix in &legacy_backups {
            warn!(
                %prefix,
                "stale backup prefix from an earlier run; roll it back or delete it manually"
            );
        }

        let backup_prefix = if with_backup {
            let stamp = OffsetDateTime::now_utc()
                .format(format_description!(
                    "[year][month][day]-[hour][minute][second]"
                ))
                .unwrap();
            let backup = join_key(&parent, &format!("{base}.backup-{stamp}"));
            let keys = backend.list(live_prefix, None).await?;
            for key in &keys {
                backend
                    .copy(&join_key(live_prefix, key), &join_key(&backup, key))
                    .await?;
            }
            debug!(%backup, objects = keys.len(), "snapshotted metadata prefix");
            Some(backup)
        } else {
            None
        };

        Ok(Transaction {
            backend,
            live_prefix: live_prefix.to_string(),
            backup_prefix,
            outcome: Outcome::Pending,
            legacy_backups,
        })
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn backup_prefix(&self) -> Option<&str> {
        self.backup_prefix.as_deref()
    }

    /// Delete the snapshot; the new live state stands.
    pub async fn commit(&mut self) -> Result<()> {
        if let Some(backup) = &self.backup_prefix {
            for key in self.backend.list(backup, None).await? {
                self.backend.delete(&join_key(backup, key.as_str())).await?;
            }
            debug!(%backup, "deleted backup prefix");
        }
        self.outcome = Outcome::Committed;
        Ok(())
    }

    /// Rewind the live prefix to the snapshot. The snapshot is retained.
    pub async fn restore(&mut self) -> Result<()> {
        let backup = self.backup_prefix.clone().ok_or_else(|| {
            Error::Config("cannot restore: transaction was opened without a backup".to_string())
        })?;
        let backup_keys = self.backend.list(&backup, None).await?;
        for key in &backup_keys {
            self.backend
                .copy(&join_key(&backup, key), &join_key(&self.live_prefix, key))
                .await?;
        }
        for key in self.backend.list(&self.live_prefix, None).await? {
            if !backup_keys.contains(&key) {
                self.backend
                    .delete(&join_key(&self.live_prefix, &key))
                    .await?;
            }
        }
        warn!(
            %backup,
            live = %self.live_prefix,
            "restored metadata prefix from backup; backup retained"
        );
        self.outcome = Outcome::Restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBackend;

    async fn backend_with_live() -> (tempfile::TempDir, Backend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::Local(LocalBackend::new(dir.path()));
        backend
            .write_bytes(b"old-index", "el9/x86_64/repodata/repomd.xml")
            .await
            .unwrap();
        backend
            .write_bytes(b"old-primary", "el9/x86_64/repodata/aaa-primary.xml.gz")
            .await
            .unwrap();
        (dir, backend)
    }

    /// Restore rewinds live bytes and deletes objects the snapshot doesn't
    /// know, keeping the backup for inspection.
    #[tokio::test]
    async fn restore_rewinds_to_snapshot() {
        let (_dir, backend) = backend_with_live().await;
        let mut txn = Transaction::begin(&backend, "el9/x86_64/repodata", true)
            .await
            .unwrap();

        backend
            .write_bytes(b"new-index", "el9/x86_64/repodata/repomd.xml")
            .await
            .unwrap();
        backend
            .write_bytes(b"new-primary", "el9/x86_64/repodata/bbb-primary.xml.gz")
            .await
            .unwrap();

        txn.restore().await.unwrap();
        assert_eq!(txn.outcome(), Outcome::Restored);
        assert_eq!(
            backend.read("el9/x86_64/repodata/repomd.xml").await.unwrap(),
            b"old-index"
        );
        assert!(
            !backend
                .exists("el9/x86_64/repodata/bbb-primary.xml.gz")
                .await
                .unwrap()
        );
        let backup = txn.backup_prefix().unwrap();
        assert!(
            backend
                .exists(&join_key(backup, "repomd.xml"))
                .await
                .unwrap()
        );
    }

    /// Commit deletes every backup object.
    #[tokio::test]
    async fn commit_drops_backup() {
        let (_dir, backend) = backend_with_live().await;
        let mut txn = Transaction::begin(&backend, "el9/x86_64/repodata", true)
            .await
            .unwrap();
        let backup = txn.backup_prefix().unwrap().to_string();
        txn.commit().await.unwrap();
        assert_eq!(txn.outcome(), Outcome::Committed);
        assert!(backend.list(&backup, None).await.unwrap().is_empty());
    }

    /// A backup prefix from an interrupted earlier run is detected, not
    /// touched.
    #[tokio::test]
    async fn legacy_backups_are_reported() {
        let (_dir, backend) = backend_with_live().await;
        backend
            .write_bytes(b"x", "el9/x86_64/repodata.backup-20240101-000000/repomd.xml")
            .await
            .unwrap();
        let txn = Transaction::begin(&backend, "el9/x86_64/repodata", true)
            .await
            .unwrap();
        assert_eq!(
            txn.legacy_backups,
            vec!["el9/x86_64/repodata.backup-20240101-000000".to_string()]
        );
        assert!(
            backend
                .exists("el9/x86_64/repodata.backup-20240101-000000/repomd.xml")
                .await
                .unwrap()
        );
    }
}
