//! The repository engines: the add/remove/validate protocols shared by both
//! families, parameterized by their document models.

pub mod deb;
pub mod rpm;
pub mod transaction;
pub mod validate;

use std::collections::HashMap;

pub use transaction::{Outcome, Transaction};

/// Switches the CLI and configuration feed into an operation.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Run quick validation before commit.
    pub validate: bool,
    /// Snapshot the metadata prefix at begin. Disabling this forfeits
    /// restore-on-failure.
    pub backup: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            validate: true,
            backup: true,
        }
    }
}

/// How an input package relates to the repository's current contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Filename present with the same sha256: skip entirely.
    Duplicate,
    /// Filename present with a different sha256: replace.
    Update,
    /// Filename absent: add.
    New,
}

/// Classify one input against the `{filename -> sha256}` map extracted from
/// the existing metadata.
pub fn classify(
    filename: &str,
    sha256: &str,
    existing: &HashMap<String, String>,
) -> Classification {
    match existing.get(filename) {
        Some(current) if current == sha256 => Classification::Duplicate,
        Some(_) => Classification::Update,
        None => Classification::New,
    }
}

/// Result of an `add` operation.
#[derive(Debug, Clone, Default)]
pub struct AddReport {
    /// Storage prefix of the repository written to.
    pub repo: String,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub duplicates: Vec<String>,
    pub legacy_backups: Vec<String>,
}

impl AddReport {
    /// Whether anything was written to the live prefix.
    pub fn mutated(&self) -> bool {
        !self.added.is_empty() || !self.updated.is_empty()
    }
}

/// Result of a `remove` operation.
#[derive(Debug, Clone, Default)]
pub struct RemoveReport {
    pub repo: String,
    pub removed: Vec<String>,
    /// Inputs that were not in the repository; reported, not fatal (unless
    /// all of them were).
    pub not_present: Vec<String>,
    pub legacy_backups: Vec<String>,
}

/// Anything the commit step can seal: reports that know whether live state
/// changed.
pub(crate) trait Mutation {
    fn mutated(&self) -> bool;
}

impl Mutation for AddReport {
    fn mutated(&self) -> bool {
        AddReport::mutated(self)
    }
}

impl Mutation for RemoveReport {
    fn mutated(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Best-effort restore on failure. A restore that itself fails keeps the
/// backup in place and is reported, not escalated, so the original error
/// stays visible.
pub(crate) async fn roll_back(txn: &mut Transaction<'_>) {
    if txn.backup_prefix().is_none() {
        tracing::warn!("backups are disabled; live prefix left as-is");
        return;
    }
    if let Err(e) = txn.restore().await {
        tracing::warn!(
            backup = ?txn.backup_prefix(),
            "restore failed ({e}); backup retained for manual recovery"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matrix() {
        let existing: HashMap<String, String> =
            [("a.rpm".to_string(), "aaaa".to_string())].into();
        assert_eq!(classify("a.rpm", "aaaa", &existing), Classification::Duplicate);
        assert_eq!(classify("a.rpm", "bbbb", &existing), Classification::Update);
        assert_eq!(classify("b.rpm", "aaaa", &existing), Classification::New);
    }
}
