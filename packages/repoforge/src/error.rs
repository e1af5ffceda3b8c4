use std::path::PathBuf;

use crate::engine::validate::ValidationIssue;

/// Engine errors. The CLI renders these; transient storage errors are retried
/// inside the backend driver, never here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The package inspector could not extract the required control fields.
    #[error("malformed package {path}: {reason}")]
    MalformedPackage { path: PathBuf, reason: String },

    /// The inputs of a single operation resolve to more than one repository
    /// coordinate.
    #[error("packages target multiple repositories: {details}")]
    MixedTargets { details: String },

    /// Transport failure after the driver's own retries.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The backend refused a call.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A read or delete named a key that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Post-upload validation detected a broken invariant; the transaction
    /// was rolled back.
    #[error("repository failed validation with {} issue(s)", .0.len())]
    IntegrityViolation(Vec<ValidationIssue>),

    /// None of the filenames passed to `remove` were present.
    #[error("none of the given packages exist in the repository")]
    NothingToRemove,

    /// A backup prefix from an earlier interrupted run exists. Never
    /// auto-recovered; surfaced so the operator can decide.
    #[error("stale backup prefix present: {prefix}")]
    LegacyBackupPresent { prefix: String },

    /// An external tool (metadata generator or package inspector) failed.
    #[error("{tool} failed: {detail}")]
    ToolFailure { tool: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed metadata document: {0}")]
    Metadata(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Error::Metadata(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
