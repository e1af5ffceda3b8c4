//! Repository validation.
//!
//! Two tiers: quick (checksum closure over the index, count equalities,
//! duplicate-type detection) runs before every commit; full adds
//! storage-object existence in both directions, sqlite schema checks, and
//! the default-namespace rendering check. Both return a list of issues; an
//! empty list is success.

use std::collections::HashSet;
use std::io::Write as _;

use quick_xml::Reader;
use quick_xml::events::Event;
use tracing::{debug, instrument};

use crate::checksum;
use crate::compress;
use crate::deb::{self, PackagesIndex, ReleaseFile};
use crate::error::Result;
use crate::rpm::{self, DocKind, PackageDocument, Repomd, sqlite};
use crate::storage::{Backend, join_key};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    /// A recorded digest does not match the stored bytes.
    Checksum,
    /// A package-count equality is broken.
    Count,
    /// The repomd carries more than one record of a type.
    DuplicateType,
    /// A referenced package object is missing from storage.
    MissingPackage,
    /// A stored object is referenced by nothing and is not a backup artifact.
    Unreferenced,
    /// A sqlite mirror lacks an expected table.
    Schema,
    /// A document in the default namespace was serialized with a prefix.
    Namespace,
    /// An expected metadata record or document is absent.
    MissingRecord,
    /// A metadata document failed to parse.
    Document,
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IssueKind::Checksum => "checksum",
            IssueKind::Count => "count",
            IssueKind::DuplicateType => "duplicate-type",
            IssueKind::MissingPackage => "missing-package",
            IssueKind::Unreferenced => "unreferenced",
            IssueKind::Schema => "schema",
            IssueKind::Namespace => "namespace",
            IssueKind::MissingRecord => "missing-record",
            IssueKind::Document => "document",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub detail: String,
}

impl ValidationIssue {
    fn new(kind: IssueKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.detail)
    }
}

/// True when the document's root element name carries a namespace prefix.
fn root_has_prefix(xml: &str) -> bool {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e.name().as_ref().contains(&b':');
            }
            Ok(Event::Eof) | Err(_) => return false,
            _ => {}
        }
    }
}

struct RpmState {
    repomd: Repomd,
    primary: Option<PackageDocument>,
    issues: Vec<ValidationIssue>,
}

/// Shared first pass: read the repomd, verify the checksum closure, parse
/// primary, count primary_db rows.
async fn rpm_scan(backend: &Backend, repo: &str) -> Result<RpmState> {
    let mut issues = Vec::new();
    let repomd_path = join_key(repo, "repodata/repomd.xml");
    let repomd_bytes = match backend.read(&repomd_path).await {
        Ok(bytes) => bytes,
        Err(_) => {
            issues.push(ValidationIssue::new(
                IssueKind::MissingRecord,
                format!("{repomd_path} does not exist"),
            ));
            return Ok(RpmState {
                repomd: Repomd::default(),
                primary: None,
                issues,
            });
        }
    };
    let repomd_text = String::from_utf8_lossy(&repomd_bytes).into_owned();
    let repomd = match Repomd::parse(&repomd_text) {
        Ok(repomd) => repomd,
        Err(e) => {
            issues.push(ValidationIssue::new(
                IssueKind::Document,
                format!("{repomd_path}: {e}"),
            ));
            return Ok(RpmState {
                repomd: Repomd::default(),
                primary: None,
                issues,
            });
        }
    };

    for mdtype in repomd.duplicate_types() {
        issues.push(ValidationIssue::new(
            IssueKind::DuplicateType,
            format!("repomd lists more than one {mdtype} record"),
        ));
    }
    for mdtype in rpm::MD_ALL {
        if repomd.get(mdtype).is_none() {
            issues.push(ValidationIssue::new(
                IssueKind::MissingRecord,
                format!("repomd lists no {mdtype} record"),
            ));
        }
    }

    let mut primary = None;
    let mut primary_db_rows = None;
    for record in &repomd.records {
        let path = join_key(repo, &record.location_href);
        let bytes = match backend.read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                issues.push(ValidationIssue::new(
                    IssueKind::Checksum,
                    format!("{path} is referenced by repomd but unreadable"),
                ));
                continue;
            }
        };
        let actual = checksum::sha256_bytes(&bytes);
        if actual != record.checksum {
            issues.push(ValidationIssue::new(
                IssueKind::Checksum,
                format!(
                    "{path}: repomd says {}, stored bytes digest to {actual}",
                    record.checksum
                ),
            ));
        }
        if record.mdtype == rpm::MD_PRIMARY {
            match compress::gunzip(&bytes).and_then(|xml| {
                let text = String::from_utf8_lossy(&xml).into_owned();
                PackageDocument::parse(DocKind::Primary, &text)
            }) {
                Ok(doc) => primary = Some(doc),
                Err(e) => issues.push(ValidationIssue::new(
                    IssueKind::Document,
                    format!("{path}: {e}"),
                )),
            }
        }
        if record.mdtype == rpm::MD_PRIMARY_DB {
            match compress::bunzip2(&bytes) {
                Ok(db) => {
                    let mut file = tempfile::NamedTempFile::new()?;
                    file.write_all(&db)?;
                    match sqlite::packages_row_count(file.path()) {
                        Ok(rows) => primary_db_rows = Some(rows),
                        Err(e) => issues.push(ValidationIssue::new(
                            IssueKind::Document,
                            format!("{path}: {e}"),
                        )),
                    }
                }
                Err(e) => issues.push(ValidationIssue::new(
                    IssueKind::Document,
                    format!("{path}: {e}"),
                )),
            }
        }
    }

    if let Some(doc) = &primary {
        let actual = doc.package_count() as u64;
        if let Some(declared) = doc.declared_packages {
            if declared != actual {
                issues.push(ValidationIssue::new(
                    IssueKind::Count,
                    format!("primary declares packages=\"{declared}\" but lists {actual}"),
                ));
            }
        }
        if let Some(rows) = primary_db_rows {
            if rows != actual {
                issues.push(ValidationIssue::new(
                    IssueKind::Count,
                    format!("primary_db has {rows} package rows, primary lists {actual}"),
                ));
            }
        }
    }

    Ok(RpmState {
        repomd,
        primary,
        issues,
    })
}

/// The pre-commit tier.
#[instrument(skip(backend))]
pub async fn quick_rpm(backend: &Backend, repo: &str) -> Result<Vec<ValidationIssue>> {
    let state = rpm_scan(backend, repo).await?;
    debug!(issues = state.issues.len(), "quick validation finished");
    Ok(state.issues)
}

/// The exhaustive tier.
#[instrument(skip(backend))]
pub async fn full_rpm(backend: &Backend, repo: &str) -> Result<Vec<ValidationIssue>> {
    let state = rpm_scan(backend, repo).await?;
    let mut issues = state.issues;

    // Package closure, both directions.
    let mut referenced = HashSet::new();
    if let Some(primary) = &state.primary {
        for entry in &primary.entries {
            if let Some(href) = &entry.location_href {
                referenced.insert(href.clone());
                let path = join_key(repo, href);
                if !backend.exists(&path).await? {
                    issues.push(ValidationIssue::new(
                        IssueKind::MissingPackage,
                        format!("{path} is listed in primary but absent from storage"),
                    ));
                }
            }
        }
    }
    for key in backend.list(repo, None).await? {
        let top = key.split('/').next().unwrap_or(&key);
        if top == "repodata" || top.contains(".backup-") {
            continue;
        }
        if !referenced.contains(&key) {
            issues.push(ValidationIssue::new(
                IssueKind::Unreferenced,
                format!("{} is stored but referenced by nothing", join_key(repo, &key)),
            ));
        }
    }

    // Sqlite schemas.
    for kind in DocKind::ALL {
        let Some(record) = state.repomd.get(kind.db_mdtype()) else {
            continue;
        };
        let path = join_key(repo, &record.location_href);
        if let Ok(bytes) = backend.read(&path).await {
            if let Ok(db) = compress::bunzip2(&bytes) {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(&db)?;
                for table in sqlite::missing_tables(file.path(), sqlite::expected_tables(kind))? {
                    issues.push(ValidationIssue::new(
                        IssueKind::Schema,
                        format!("{path} lacks the {table} table"),
                    ));
                }
            }
        }
    }

    // Default-namespace rendering.
    let repomd_path = join_key(repo, "repodata/repomd.xml");
    if let Ok(bytes) = backend.read(&repomd_path).await {
        if root_has_prefix(&String::from_utf8_lossy(&bytes)) {
            issues.push(ValidationIssue::new(
                IssueKind::Namespace,
                format!("{repomd_path} root element is namespace-prefixed"),
            ));
        }
    }
    if let Some(primary) = &state.primary {
        if primary.parsed_with_prefix {
            issues.push(ValidationIssue::new(
                IssueKind::Namespace,
                "primary is serialized with a prefixed default namespace".to_string(),
            ));
        }
    }

    debug!(issues = issues.len(), "full validation finished");
    Ok(issues)
}

/// Quick tier for a Debian distribution: the Release checksum closure.
#[instrument(skip(backend))]
pub async fn quick_deb(backend: &Backend, distribution: &str) -> Result<Vec<ValidationIssue>> {
    let mut issues = Vec::new();
    let prefix = deb::dists_prefix(distribution);
    let release_path = join_key(&prefix, "Release");
    let release_bytes = match backend.read(&release_path).await {
        Ok(bytes) => bytes,
        Err(_) => {
            issues.push(ValidationIssue::new(
                IssueKind::MissingRecord,
                format!("{release_path} does not exist"),
            ));
            return Ok(issues);
        }
    };
    let release = match ReleaseFile::parse(&String::from_utf8_lossy(&release_bytes)) {
        Ok(release) => release,
        Err(e) => {
            issues.push(ValidationIssue::new(
                IssueKind::Document,
                format!("{release_path}: {e}"),
            ));
            return Ok(issues);
        }
    };
    for entry in &release.entries {
        let path = join_key(&prefix, &entry.path);
        let bytes = match backend.read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => {
                issues.push(ValidationIssue::new(
                    IssueKind::Checksum,
                    format!("{path} is listed in Release but unreadable"),
                ));
                continue;
            }
        };
        if bytes.len() as u64 != entry.size {
            issues.push(ValidationIssue::new(
                IssueKind::Checksum,
                format!("{path}: Release says {} bytes, stored {}", entry.size, bytes.len()),
            ));
        }
        for (label, expected, actual) in [
            ("MD5Sum", &entry.md5, checksum::md5_bytes(&bytes)),
            ("SHA1", &entry.sha1, checksum::sha1_bytes(&bytes)),
            ("SHA256", &entry.sha256, checksum::sha256_bytes(&bytes)),
        ] {
            if !expected.is_empty() && *expected != actual {
                issues.push(ValidationIssue::new(
                    IssueKind::Checksum,
                    format!("{path}: {label} mismatch ({expected} recorded, {actual} stored)"),
                ));
            }
        }
    }
    debug!(issues = issues.len(), "quick validation finished");
    Ok(issues)
}

/// Full tier for a Debian coordinate: quick, plus package closure in both
/// directions across the distribution's Packages indexes.
#[instrument(skip(backend))]
pub async fn full_deb(
    backend: &Backend,
    distribution: &str,
    component: &str,
    architecture: &str,
) -> Result<Vec<ValidationIssue>> {
    let mut issues = quick_deb(backend, distribution).await?;
    let prefix = deb::dists_prefix(distribution);

    let target = join_key(&prefix, &deb::packages_rel_path(component, architecture));
    if !backend.exists(&target).await? {
        issues.push(ValidationIssue::new(
            IssueKind::MissingRecord,
            format!("{target} does not exist"),
        ));
    }

    // Union of every Filename across every distribution's Packages indexes;
    // the pool is shared, so the reverse closure must see them all.
    let mut referenced = HashSet::new();
    for key in backend.list("dists", Some("/Packages")).await? {
        let path = join_key("dists", &key);
        let bytes = backend.read(&path).await?;
        match PackagesIndex::parse(&String::from_utf8_lossy(&bytes)) {
            Ok(index) => {
                for stanza in &index.stanzas {
                    if let Some(filename) = stanza.get("Filename") {
                        referenced.insert(filename.to_string());
                        if !backend.exists(filename).await? {
                            issues.push(ValidationIssue::new(
                                IssueKind::MissingPackage,
                                format!("{filename} is listed in {path} but absent from storage"),
                            ));
                        }
                    }
                }
            }
            Err(e) => issues.push(ValidationIssue::new(
                IssueKind::Document,
                format!("{path}: {e}"),
            )),
        }
    }
    for key in backend.list("pool", None).await? {
        let pool_path = join_key("pool", &key);
        if !key.contains(".backup-") && !referenced.contains(&pool_path) {
            issues.push(ValidationIssue::new(
                IssueKind::Unreferenced,
                format!("{pool_path} is stored but referenced by nothing"),
            ));
        }
    }

    debug!(issues = issues.len(), "full validation finished");
    Ok(issues)
}
