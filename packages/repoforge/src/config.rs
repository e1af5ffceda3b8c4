//! Flat dot-key configuration, serialized as a JSON object, plus the backend
//! factory that resolves where reads and writes land.
//!
//! The config file is searched in order: an explicitly given path,
//! `./repoforge.conf`, `~/.repoforge.conf`, `/etc/repoforge.conf`. Keys from
//! the pre-dot-key era (`storage_type`, `s3_bucket`, ...) are migrated on
//! read and written back in the new form.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::Family;
use crate::error::{Error, Result};
use crate::storage::{Backend, LocalBackend, S3Backend};

pub const TOOL_NAME: &str = "repoforge";

/// Credential-profile fallback, consulted only when no profile is configured
/// explicitly.
pub const PROFILE_ENV: &str = "REPO_PROFILE";

const LEGACY_KEYS: &[(&str, &str)] = &[
    ("storage_type", "backend.type"),
    ("s3_bucket", "backend.s3.bucket"),
    ("aws_profile", "backend.s3.profile"),
    ("s3_endpoint_url", "backend.s3.endpoint"),
    ("local_storage_path", "backend.local.path"),
    ("local_repo_base", "repo.cache_dir"),
];

const BASE_KEYS: &[&str] = &[
    "backend.type",
    "backend.s3.bucket",
    "backend.s3.profile",
    "backend.s3.endpoint",
    "backend.local.path",
    "repo.cache_dir",
    "validation.enabled",
    "behavior.confirm",
    "behavior.backup",
];

/// Which config file a `config` subcommand invocation operates on.
#[derive(Debug, Clone)]
pub enum Scope {
    File(PathBuf),
    Local,
    Global,
    System,
}

impl Scope {
    pub fn path(&self) -> Result<PathBuf> {
        match self {
            Scope::File(path) => Ok(path.clone()),
            Scope::Local => Ok(PathBuf::from(format!("{TOOL_NAME}.conf"))),
            Scope::Global => {
                let home = std::env::var_os("HOME")
                    .ok_or_else(|| Error::Config("$HOME is not set".to_string()))?;
                Ok(PathBuf::from(home).join(format!(".{TOOL_NAME}.conf")))
            }
            Scope::System => Ok(PathBuf::from(format!("/etc/{TOOL_NAME}.conf"))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    values: BTreeMap<String, Value>,
    path: Option<PathBuf>,
}

impl Config {
    /// Load following the search order. A missing file at every location is
    /// not an error; it yields an empty configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(format!("{TOOL_NAME}.conf"))];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(format!(".{TOOL_NAME}.conf")));
        }
        paths.push(PathBuf::from(format!("/etc/{TOOL_NAME}.conf")));
        paths
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let raw: BTreeMap<String, Value> = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self {
            values: raw,
            path: Some(path.to_path_buf()),
        };
        if config.migrate_legacy() {
            info!(path = %path.display(), "migrated legacy configuration keys");
            // Best-effort write-back; a read-only /etc file stays legacy on
            // disk but is still usable in memory.
            if let Err(e) = config.save() {
                debug!("could not write back migrated config: {e}");
            }
        }
        Ok(config)
    }

    /// Open the file for a scope, tolerating absence (empty config bound to
    /// that path).
    pub fn open_scope(scope: &Scope) -> Result<Self> {
        let path = scope.path()?;
        if path.is_file() {
            Self::load_from(&path)
        } else {
            Ok(Self {
                values: BTreeMap::new(),
                path: Some(path),
            })
        }
    }

    fn migrate_legacy(&mut self) -> bool {
        let mut migrated = false;
        for (old, new) in LEGACY_KEYS {
            if let Some(value) = self.values.remove(*old) {
                // An explicit new-style key wins over its legacy twin.
                self.values.entry(new.to_string()).or_insert(value);
                migrated = true;
            }
        }
        migrated
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::Config("no config file path to save to".to_string()))?;
        let mut text = serde_json::to_string_pretty(&self.values)
            .map_err(|e| Error::Config(e.to_string()))?;
        text.push('\n');
        std::fs::write(path, text).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Family-aware lookup: `backend.type` checks `backend.rpm.type` (or
    /// `.deb.`) before the shared key.
    pub fn lookup(&self, family: Family, key: &str) -> Option<&Value> {
        self.get(&family_key(family, key)).or_else(|| self.get(key))
    }

    pub fn lookup_str(&self, family: Family, key: &str) -> Option<&str> {
        self.lookup(family, key).and_then(Value::as_str)
    }

    pub fn lookup_bool(&self, family: Family, key: &str, default: bool) -> bool {
        self.lookup(family, key)
            .and_then(Value::as_bool)
            .unwrap_or(default)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn unset(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Keys that neither the base table nor its family-spliced variants
    /// recognize, plus keys holding a non-primitive value.
    pub fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (key, value) in &self.values {
            if !known_key(key) {
                out.push(format!("unknown key: {key}"));
            } else if !matches!(
                value,
                Value::String(_) | Value::Bool(_) | Value::Number(_)
            ) {
                out.push(format!("{key}: value must be a string, bool, or integer"));
            }
        }
        out
    }
}

fn family_key(family: Family, key: &str) -> String {
    match key.split_once('.') {
        Some((head, tail)) => format!("{head}.{}.{tail}", family.config_segment()),
        None => key.to_string(),
    }
}

pub fn known_key(key: &str) -> bool {
    BASE_KEYS.iter().any(|base| {
        key == *base
            || key == family_key(Family::Rpm, base)
            || key == family_key(Family::Deb, base)
    })
}

/// Parse a CLI-supplied value into the narrowest primitive: bool, then
/// integer, then string.
pub fn parse_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<i64>() {
            Ok(n) => Value::Number(n.into()),
            Err(_) => Value::String(raw.to_string()),
        },
    }
}

/// Per-invocation overrides from the global CLI flags. Each one trumps its
/// configuration key for this run only.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bucket: Option<String>,
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    pub cache_dir: Option<PathBuf>,
}

/// Resolve the storage backend for one operation.
pub async fn resolve_backend(
    config: &Config,
    family: Family,
    overrides: &Overrides,
) -> Result<Backend> {
    let bucket = overrides
        .bucket
        .clone()
        .or_else(|| config.lookup_str(family, "backend.s3.bucket").map(String::from));
    let backend_type = match config.lookup_str(family, "backend.type") {
        Some(t) => t.to_string(),
        None if bucket.is_some() => "s3".to_string(),
        None if config.lookup_str(family, "backend.local.path").is_some() => "local".to_string(),
        None => {
            return Err(Error::Config(
                "no backend configured; set backend.type (and backend.s3.bucket or backend.local.path)"
                    .to_string(),
            ));
        }
    };
    match backend_type.as_str() {
        "s3" => {
            let bucket = bucket.ok_or_else(|| {
                Error::Config("backend.s3.bucket is required for the s3 backend".to_string())
            })?;
            let profile = overrides
                .profile
                .clone()
                .or_else(|| config.lookup_str(family, "backend.s3.profile").map(String::from))
                .or_else(|| std::env::var(PROFILE_ENV).ok());
            let endpoint = overrides
                .endpoint
                .clone()
                .or_else(|| config.lookup_str(family, "backend.s3.endpoint").map(String::from));
            Ok(Backend::S3(
                S3Backend::connect(bucket, profile, endpoint).await,
            ))
        }
        "local" => {
            let root = config
                .lookup_str(family, "backend.local.path")
                .ok_or_else(|| {
                    Error::Config("backend.local.path is required for the local backend".to_string())
                })?;
            Ok(Backend::Local(LocalBackend::new(root)))
        }
        other => Err(Error::Config(format!(
            "unknown backend.type {other:?} (expected \"s3\" or \"local\")"
        ))),
    }
}

/// Local staging root for transactions.
pub fn resolve_cache_dir(config: &Config, family: Family, overrides: &Overrides) -> PathBuf {
    if let Some(dir) = &overrides.cache_dir {
        return dir.clone();
    }
    if let Some(dir) = config.lookup_str(family, "repo.cache_dir") {
        return PathBuf::from(dir);
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".cache").join(TOOL_NAME),
        None => std::env::temp_dir().join(TOOL_NAME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(json: &str, dir: &Path) -> Config {
        let path = dir.join("repoforge.conf");
        std::fs::write(&path, json).unwrap();
        Config::load_from(&path).unwrap()
    }

    /// Legacy flat keys are rewritten to dot-key form and persisted.
    #[test]
    fn legacy_keys_migrate_and_write_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_from(
            r#"{"storage_type": "s3", "s3_bucket": "pkgs", "aws_profile": "ci"}"#,
            dir.path(),
        );
        assert_eq!(config.get("backend.type").and_then(Value::as_str), Some("s3"));
        assert_eq!(
            config.get("backend.s3.bucket").and_then(Value::as_str),
            Some("pkgs")
        );
        assert!(config.get("storage_type").is_none());

        let on_disk = std::fs::read_to_string(dir.path().join("repoforge.conf")).unwrap();
        assert!(on_disk.contains("backend.s3.bucket"));
        assert!(!on_disk.contains("s3_bucket"));
    }

    /// An explicit new-style key beats its legacy twin.
    #[test]
    fn migration_does_not_clobber_new_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_from(
            r#"{"s3_bucket": "old", "backend.s3.bucket": "new"}"#,
            dir.path(),
        );
        assert_eq!(
            config.get("backend.s3.bucket").and_then(Value::as_str),
            Some("new")
        );
    }

    /// Family-specific keys shadow shared ones, and only for their family.
    #[test]
    fn family_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_from(
            r#"{"backend.s3.bucket": "shared", "backend.rpm.s3.bucket": "rpm-only"}"#,
            dir.path(),
        );
        assert_eq!(
            config.lookup_str(Family::Rpm, "backend.s3.bucket"),
            Some("rpm-only")
        );
        assert_eq!(
            config.lookup_str(Family::Deb, "backend.s3.bucket"),
            Some("shared")
        );
    }

    #[test]
    fn value_parsing_narrows() {
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("42"), Value::Number(42.into()));
        assert_eq!(parse_value("el9"), Value::String("el9".to_string()));
    }

    #[test]
    fn unknown_keys_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_from(
            r#"{"backend.type": "local", "backend.local.path": "/srv/repo", "bucket": "typo"}"#,
            dir.path(),
        );
        let problems = config.problems();
        assert_eq!(problems, vec!["unknown key: bucket"]);
    }

    #[test]
    fn known_key_covers_family_variants() {
        assert!(known_key("backend.type"));
        assert!(known_key("backend.deb.type"));
        assert!(known_key("repo.rpm.cache_dir"));
        assert!(!known_key("repo.cache"));
    }
}
