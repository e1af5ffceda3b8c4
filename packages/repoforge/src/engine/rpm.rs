//! The RPM repository engine: add, remove, validate.
//!
//! Layout per repository prefix (`el<N>/<arch>`): package objects at the
//! top, metadata under `repodata/`, every metadata file content-addressed
//! and indexed by `repodata/repomd.xml`. Mutations run inside a
//! backup/restore transaction and splice package entries in or out of the
//! existing documents instead of regenerating them from the full package
//! set.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::checksum;
use crate::compress;
use crate::engine::transaction::Transaction;
use crate::engine::validate;
use crate::engine::{
    AddReport, Classification, EngineOptions, Mutation, RemoveReport, classify, roll_back,
};
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::inspect::{RpmPackage, rpm_repo_path_of_filename};
use crate::rpm::{DocKind, PackageDocument, Repomd, RepomdRecord, sqlite};
use crate::storage::{Backend, join_key};

/// The three package-entry documents of one repository generation.
struct DocSet {
    primary: PackageDocument,
    filelists: PackageDocument,
    other: PackageDocument,
}

impl DocSet {
    fn empty() -> Self {
        Self {
            primary: PackageDocument::empty(DocKind::Primary),
            filelists: PackageDocument::empty(DocKind::Filelists),
            other: PackageDocument::empty(DocKind::Other),
        }
    }

    fn get(&self, kind: DocKind) -> &PackageDocument {
        match kind {
            DocKind::Primary => &self.primary,
            DocKind::Filelists => &self.filelists,
            DocKind::Other => &self.other,
        }
    }
}

pub struct RpmRepo<'a, G> {
    backend: &'a Backend,
    generator: &'a G,
    cache_dir: PathBuf,
    options: EngineOptions,
}

impl<'a, G: Generator> RpmRepo<'a, G> {
    pub fn new(
        backend: &'a Backend,
        generator: &'a G,
        cache_dir: PathBuf,
        options: EngineOptions,
    ) -> Self {
        Self {
            backend,
            generator,
            cache_dir,
            options,
        }
    }

    /// Ingest packages. All inputs must resolve to the same repository
    /// prefix; duplicates are skipped, filename collisions with a different
    /// digest replace the stored package.
    #[instrument(skip(self, packages), fields(count = packages.len()))]
    pub async fn add(&self, packages: &[RpmPackage]) -> Result<AddReport> {
        let repo = coordinate(packages)?;
        let repodata_prefix = join_key(&repo, "repodata");
        let staging = self.staging_dir()?;
        let mut txn =
            Transaction::begin(self.backend, &repodata_prefix, self.options.backup).await?;
        let legacy = txn.legacy_backups.clone();

        let result = self.stage_add(&repo, packages, staging.path()).await;
        let mut report = self.seal(&mut txn, &repo, result).await?;
        report.legacy_backups = legacy;
        Ok(report)
    }

    /// Retire packages by filename (basename only). Filenames absent from
    /// the repository are reported; the operation fails only when none of
    /// the inputs were present.
    #[instrument(skip(self, filenames), fields(count = filenames.len()))]
    pub async fn remove(&self, filenames: &[String]) -> Result<RemoveReport> {
        let repos: BTreeSet<String> = filenames
            .iter()
            .map(|f| rpm_repo_path_of_filename(f))
            .collect::<Result<_>>()?;
        let repo = match repos.len() {
            1 => repos.into_iter().next().unwrap(),
            _ => {
                return Err(Error::MixedTargets {
                    details: repos.into_iter().collect::<Vec<_>>().join(", "),
                });
            }
        };
        let repodata_prefix = join_key(&repo, "repodata");
        let staging = self.staging_dir()?;
        let mut txn =
            Transaction::begin(self.backend, &repodata_prefix, self.options.backup).await?;
        let legacy = txn.legacy_backups.clone();

        let result = self.stage_remove(&repo, filenames, staging.path()).await;
        if matches!(result, Err(Error::NothingToRemove)) {
            // Nothing was written; drop the backup and report.
            txn.commit().await?;
            return Err(Error::NothingToRemove);
        }
        let mut report = self.seal(&mut txn, &repo, result).await?;
        report.legacy_backups = legacy;
        Ok(report)
    }

    /// Full validation of a repository prefix.
    pub async fn validate(&self, repo: &str) -> Result<Vec<validate::ValidationIssue>> {
        validate::full_rpm(self.backend, repo).await
    }

    /// Validate, then commit or restore. Any staging error restores too.
    async fn seal<R: Mutation>(
        &self,
        txn: &mut Transaction<'_>,
        repo: &str,
        result: Result<R>,
    ) -> Result<R> {
        match result {
            Ok(report) => {
                if report.mutated() && self.options.validate {
                    match validate::quick_rpm(self.backend, repo).await {
                        Ok(issues) if issues.is_empty() => {}
                        Ok(issues) => {
                            roll_back(txn).await;
                            return Err(Error::IntegrityViolation(issues));
                        }
                        Err(e) => {
                            roll_back(txn).await;
                            return Err(e);
                        }
                    }
                }
                txn.commit().await?;
                Ok(report)
            }
            Err(e) => {
                roll_back(txn).await;
                Err(e)
            }
        }
    }

    async fn stage_add(
        &self,
        repo: &str,
        packages: &[RpmPackage],
        staging: &Path,
    ) -> Result<AddReport> {
        let repodata_prefix = join_key(repo, "repodata");
        let live_repodata = staging.join("repodata");
        std::fs::create_dir_all(&live_repodata)?;

        let exists = self
            .backend
            .exists(&join_key(&repodata_prefix, "repomd.xml"))
            .await?;
        if exists {
            self.backend
                .pull_tree(&repodata_prefix, &live_repodata)
                .await?;
        }

        // Failure to read the existing checksums degrades to "everything is
        // new": worse deduplication, never lost packages.
        let existing = if exists {
            match load_filename_map(&live_repodata) {
                Ok(map) => map,
                Err(e) => {
                    warn!("could not extract existing checksums ({e}); treating all inputs as new");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        let mut report = AddReport {
            repo: repo.to_string(),
            ..Default::default()
        };
        let mut work: Vec<&RpmPackage> = Vec::new();
        let mut update_filenames = Vec::new();
        for pkg in packages {
            let filename = pkg.filename();
            match classify(&filename, &pkg.sha256, &existing) {
                Classification::Duplicate => report.duplicates.push(filename),
                Classification::Update => {
                    report.updated.push(filename.clone());
                    update_filenames.push(filename);
                    work.push(pkg);
                }
                Classification::New => {
                    report.added.push(filename);
                    work.push(pkg);
                }
            }
        }
        if work.is_empty() {
            info!(repo, "every input is already published; nothing to do");
            return Ok(report);
        }

        // Generate metadata for the incoming packages only, then splice.
        let package_dir = staging.join("packages");
        std::fs::create_dir_all(&package_dir)?;
        for pkg in &work {
            std::fs::copy(&pkg.local_path, package_dir.join(pkg.filename()))?;
        }
        let generated_dir = staging.join("generated");
        std::fs::create_dir_all(&generated_dir)?;
        self.generator.generate(&package_dir, &generated_dir)?;
        let generated = load_documents(&generated_dir.join("repodata"))?;

        let mut docs = if exists {
            load_documents(&live_repodata)?
        } else {
            DocSet::empty()
        };
        let replaced = docs.primary.remove_by_filenames(&update_filenames);
        let replaced_pkgids: Vec<String> = replaced.into_iter().map(|(_, id)| id).collect();
        docs.filelists.remove_by_pkgids(&replaced_pkgids);
        docs.other.remove_by_pkgids(&replaced_pkgids);
        docs.primary.append_entries(generated.primary.entries);
        docs.filelists.append_entries(generated.filelists.entries);
        docs.other.append_entries(generated.other.entries);

        // Packages first, metadata after, index last. If the metadata leg
        // fails, packages added (not updated) this run are unreferenced by
        // the restored index, so delete them before surfacing the error.
        let uploaded = async {
            for pkg in &work {
                self.backend
                    .write_file(&pkg.local_path, &join_key(repo, &pkg.filename()))
                    .await?;
            }
            self.publish(repo, &docs, staging).await
        }
        .await;
        if let Err(e) = uploaded {
            for name in &report.added {
                if let Err(cleanup) = self.backend.delete(&join_key(repo, name)).await {
                    warn!(package = %name, "could not delete orphaned upload: {cleanup}");
                }
            }
            return Err(e);
        }

        info!(
            repo,
            added = report.added.len(),
            updated = report.updated.len(),
            duplicates = report.duplicates.len(),
            "staged package additions"
        );
        Ok(report)
    }

    async fn stage_remove(
        &self,
        repo: &str,
        filenames: &[String],
        staging: &Path,
    ) -> Result<RemoveReport> {
        let repodata_prefix = join_key(repo, "repodata");
        let live_repodata = staging.join("repodata");
        std::fs::create_dir_all(&live_repodata)?;

        if !self
            .backend
            .exists(&join_key(&repodata_prefix, "repomd.xml"))
            .await?
        {
            return Err(Error::NothingToRemove);
        }
        self.backend
            .pull_tree(&repodata_prefix, &live_repodata)
            .await?;
        let mut docs = load_documents(&live_repodata)?;

        let removed = docs.primary.remove_by_filenames(filenames);
        if removed.is_empty() {
            return Err(Error::NothingToRemove);
        }
        let removed_names: Vec<String> = removed.iter().map(|(name, _)| name.clone()).collect();
        let not_present: Vec<String> = filenames
            .iter()
            .filter(|f| !removed_names.contains(f))
            .cloned()
            .collect();
        for name in &not_present {
            warn!(repo, package = %name, "not present in repository");
        }
        let pkgids: Vec<String> = removed.iter().map(|(_, id)| id.clone()).collect();
        docs.filelists.remove_by_pkgids(&pkgids);
        docs.other.remove_by_pkgids(&pkgids);

        for name in &removed_names {
            self.backend.delete(&join_key(repo, name)).await?;
        }
        self.publish(repo, &docs, staging).await?;

        info!(repo, removed = removed_names.len(), "staged package removals");
        Ok(RemoveReport {
            repo: repo.to_string(),
            removed: removed_names,
            not_present,
            legacy_backups: Vec::new(),
        })
    }

    /// Serialize the documents, rebuild the sqlite mirrors, upload with the
    /// index last, and sweep the previous generation.
    async fn publish(&self, repo: &str, docs: &DocSet, staging: &Path) -> Result<()> {
        let repodata_prefix = join_key(repo, "repodata");
        let out_dir = staging.join("out");
        std::fs::create_dir_all(&out_dir)?;
        sqlite::remove_stale_mirrors(&out_dir)?;

        let now = OffsetDateTime::now_utc().unix_timestamp() as u64;
        let mut repomd = Repomd {
            revision: now,
            records: Vec::new(),
        };
        let mut uploads: Vec<(String, Vec<u8>)> = Vec::new();

        for kind in DocKind::ALL {
            let doc = docs.get(kind);
            let xml = doc.to_xml();
            let open_checksum = checksum::sha256_bytes(xml.as_bytes());
            let open_size = xml.len() as u64;
            let gz = compress::gzip(xml.as_bytes())?;
            let stored_checksum = checksum::sha256_bytes(&gz);
            let name = checksum::content_addressed_name(&stored_checksum, kind.base_filename());
            repomd.upsert(RepomdRecord {
                mdtype: kind.mdtype().to_string(),
                checksum: stored_checksum,
                open_checksum: Some(open_checksum.clone()),
                location_href: format!("repodata/{name}"),
                timestamp: now,
                size: gz.len() as u64,
                open_size: Some(open_size),
                database_version: None,
            });
            uploads.push((name, gz));

            // Rebuilt from scratch every mutation, so the index never
            // accumulates a second record of any _db type.
            let db_path = sqlite::build_mirror(&out_dir, kind, doc, &open_checksum)?;
            let db_bytes = std::fs::read(&db_path)?;
            let db_open_checksum = checksum::sha256_bytes(&db_bytes);
            let bz2 = compress::bzip2(&db_bytes)?;
            let db_checksum = checksum::sha256_bytes(&bz2);
            let db_name =
                checksum::content_addressed_name(&db_checksum, kind.sqlite_bz2_filename());
            repomd.remove_type(kind.db_mdtype());
            repomd.upsert(RepomdRecord {
                mdtype: kind.db_mdtype().to_string(),
                checksum: db_checksum,
                open_checksum: Some(db_open_checksum),
                location_href: format!("repodata/{db_name}"),
                timestamp: now,
                size: bz2.len() as u64,
                open_size: Some(db_bytes.len() as u64),
                database_version: Some(10),
            });
            uploads.push((db_name, bz2));
        }

        for (name, bytes) in &uploads {
            self.backend
                .write_bytes(bytes, &join_key(&repodata_prefix, name))
                .await?;
        }
        self.backend
            .write_bytes(
                repomd.to_xml()?.as_bytes(),
                &join_key(&repodata_prefix, "repomd.xml"),
            )
            .await?;

        // Sweep the generation the new index no longer references.
        let mut referenced: HashSet<String> =
            repomd.referenced_basenames().into_iter().collect();
        referenced.insert("repomd.xml".to_string());
        for key in self.backend.list(&repodata_prefix, None).await? {
            if !referenced.contains(&key) {
                debug!(%key, "sweeping unreferenced metadata object");
                self.backend
                    .delete(&join_key(&repodata_prefix, &key))
                    .await?;
            }
        }
        Ok(())
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.cache_dir)?;
        Ok(tempfile::Builder::new()
            .prefix("txn-")
            .tempdir_in(&self.cache_dir)?)
    }
}

fn coordinate(packages: &[RpmPackage]) -> Result<String> {
    if packages.is_empty() {
        return Err(Error::Config("no packages given".to_string()));
    }
    let repos: BTreeSet<String> = packages.iter().map(|p| p.repo_path()).collect();
    match repos.len() {
        1 => Ok(repos.into_iter().next().unwrap()),
        _ => Err(Error::MixedTargets {
            details: repos.into_iter().collect::<Vec<_>>().join(", "),
        }),
    }
}

/// Load repomd + the three documents from a local repodata directory
/// (pulled live metadata or generator output).
fn load_documents(repodata_dir: &Path) -> Result<DocSet> {
    let repomd_text = std::fs::read_to_string(repodata_dir.join("repomd.xml"))?;
    let repomd = Repomd::parse(&repomd_text)?;
    let load = |kind: DocKind| -> Result<PackageDocument> {
        let record = repomd.get(kind.mdtype()).ok_or_else(|| {
            Error::Metadata(format!("repomd lists no {} record", kind.mdtype()))
        })?;
        let basename = record
            .location_href
            .rsplit('/')
            .next()
            .unwrap_or(&record.location_href);
        let bytes = std::fs::read(repodata_dir.join(basename))?;
        let xml = if basename.ends_with(".gz") {
            compress::gunzip(&bytes)?
        } else {
            bytes
        };
        PackageDocument::parse(kind, &String::from_utf8_lossy(&xml))
    };
    Ok(DocSet {
        primary: load(DocKind::Primary)?,
        filelists: load(DocKind::Filelists)?,
        other: load(DocKind::Other)?,
    })
}

/// `{filename -> sha256}` from a pulled primary, for deduplication.
fn load_filename_map(repodata_dir: &Path) -> Result<HashMap<String, String>> {
    let repomd_text = std::fs::read_to_string(repodata_dir.join("repomd.xml"))?;
    let repomd = Repomd::parse(&repomd_text)?;
    let record = repomd
        .get(crate::rpm::MD_PRIMARY)
        .ok_or_else(|| Error::Metadata("repomd lists no primary record".to_string()))?;
    let basename = record
        .location_href
        .rsplit('/')
        .next()
        .unwrap_or(&record.location_href);
    let bytes = std::fs::read(repodata_dir.join(basename))?;
    let xml = if basename.ends_with(".gz") {
        compress::gunzip(&bytes)?
    } else {
        bytes
    };
    let doc = PackageDocument::parse(DocKind::Primary, &String::from_utf8_lossy(&xml))?;
    Ok(doc.filename_map())
}
