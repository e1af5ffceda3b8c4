//! The Debian repository engine.
//!
//! Packages live in the shared `pool/` layout; each distribution's metadata
//! lives under `dists/<codename>/` with a Packages index (plus gzip and
//! bzip2 variants) per (component, architecture) and a Release file indexing
//! them all. The transaction snapshots `dists/<codename>/`; the pool is
//! mutated only by explicit package writes and deletes.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::compress;
use crate::deb::{self, PackagesIndex, ReleaseFile, Stanza};
use crate::engine::transaction::Transaction;
use crate::engine::validate;
use crate::engine::{
    AddReport, Classification, EngineOptions, Mutation, RemoveReport, classify, roll_back,
};
use crate::error::{Error, Result};
use crate::inspect::DebPackage;
use crate::storage::{Backend, join_key};

pub struct DebRepo<'a> {
    backend: &'a Backend,
    cache_dir: PathBuf,
    options: EngineOptions,
}

impl<'a> DebRepo<'a> {
    pub fn new(backend: &'a Backend, cache_dir: PathBuf, options: EngineOptions) -> Self {
        Self {
            backend,
            cache_dir,
            options,
        }
    }

    /// Ingest packages into `(distribution, component, architecture)`, the
    /// architecture coming from the packages themselves.
    #[instrument(skip(self, packages), fields(count = packages.len()))]
    pub async fn add(
        &self,
        packages: &[DebPackage],
        distribution: &str,
        component: &str,
    ) -> Result<AddReport> {
        let architecture = coordinate(packages)?;
        let dists_prefix = deb::dists_prefix(distribution);
        let staging = self.staging_dir()?;
        let mut txn = Transaction::begin(self.backend, &dists_prefix, self.options.backup).await?;
        let legacy = txn.legacy_backups.clone();

        let result = self
            .stage_add(packages, distribution, component, &architecture, staging.path())
            .await;
        let mut report = self.seal(&mut txn, distribution, result).await?;
        report.legacy_backups = legacy;
        Ok(report)
    }

    /// Retire packages by filename from one `(distribution, component,
    /// architecture)` index.
    #[instrument(skip(self, filenames), fields(count = filenames.len()))]
    pub async fn remove(
        &self,
        filenames: &[String],
        distribution: &str,
        component: &str,
        architecture: &str,
    ) -> Result<RemoveReport> {
        let dists_prefix = deb::dists_prefix(distribution);
        let staging = self.staging_dir()?;
        let mut txn = Transaction::begin(self.backend, &dists_prefix, self.options.backup).await?;
        let legacy = txn.legacy_backups.clone();

        let result = self
            .stage_remove(filenames, distribution, component, architecture, staging.path())
            .await;
        if matches!(result, Err(Error::NothingToRemove)) {
            txn.commit().await?;
            return Err(Error::NothingToRemove);
        }
        let mut report = self.seal(&mut txn, distribution, result).await?;
        report.legacy_backups = legacy;
        Ok(report)
    }

    /// Full validation of a coordinate.
    pub async fn validate(
        &self,
        distribution: &str,
        component: &str,
        architecture: &str,
    ) -> Result<Vec<validate::ValidationIssue>> {
        validate::full_deb(self.backend, distribution, component, architecture).await
    }

    async fn seal<R: Mutation>(
        &self,
        txn: &mut Transaction<'_>,
        distribution: &str,
        result: Result<R>,
    ) -> Result<R> {
        match result {
            Ok(report) => {
                if report.mutated() && self.options.validate {
                    match validate::quick_deb(self.backend, distribution).await {
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
        packages: &[DebPackage],
        distribution: &str,
        component: &str,
        architecture: &str,
        staging: &Path,
    ) -> Result<AddReport> {
        let dists_prefix = deb::dists_prefix(distribution);
        let local_dists = staging.join("dists");
        std::fs::create_dir_all(&local_dists)?;
        self.backend.pull_tree(&dists_prefix, &local_dists).await?;

        let rel_packages = deb::packages_rel_path(component, architecture);
        let packages_path = local_dists.join(&rel_packages);
        let mut index = if packages_path.is_file() {
            PackagesIndex::parse(&std::fs::read_to_string(&packages_path)?)?
        } else {
            PackagesIndex::default()
        };

        let existing: HashMap<String, String> = index.filename_map();
        let mut report = AddReport {
            repo: format!("{distribution}/{component}/{architecture}"),
            ..Default::default()
        };
        let mut work: Vec<&DebPackage> = Vec::new();
        for pkg in packages {
            let filename = pkg.filename();
            match classify(&filename, &pkg.sha256, &existing) {
                Classification::Duplicate => report.duplicates.push(filename),
                Classification::Update => {
                    report.updated.push(filename);
                    work.push(pkg);
                }
                Classification::New => {
                    report.added.push(filename);
                    work.push(pkg);
                }
            }
        }
        if work.is_empty() {
            info!(distribution, component, "every input is already published; nothing to do");
            return Ok(report);
        }

        for pkg in &work {
            index.upsert(Stanza::from_package(pkg, &pkg.pool_path(component)));
        }
        write_index_variants(&packages_path, &index)?;

        let release = regenerate_release(
            &local_dists,
            distribution,
            component,
            architecture,
        )?;

        // Pool objects first, index variants after, Release last. A failed
        // metadata leg leaves freshly added pool objects unreferenced, so
        // delete them before surfacing the error.
        let uploaded = async {
            for pkg in &work {
                self.backend
                    .write_file(&pkg.local_path, &pkg.pool_path(component))
                    .await?;
            }
            self.push_indexes(&dists_prefix, &local_dists, &rel_packages, &release)
                .await?;
            self.sweep(&dists_prefix, &release).await
        }
        .await;
        if let Err(e) = uploaded {
            for pkg in &work {
                if report.added.contains(&pkg.filename()) {
                    let pool_path = pkg.pool_path(component);
                    if let Err(cleanup) = self.backend.delete(&pool_path).await {
                        warn!(package = %pool_path, "could not delete orphaned upload: {cleanup}");
                    }
                }
            }
            return Err(e);
        }

        info!(
            distribution,
            component,
            added = report.added.len(),
            updated = report.updated.len(),
            duplicates = report.duplicates.len(),
            "staged package additions"
        );
        Ok(report)
    }

    async fn stage_remove(
        &self,
        filenames: &[String],
        distribution: &str,
        component: &str,
        architecture: &str,
        staging: &Path,
    ) -> Result<RemoveReport> {
        let dists_prefix = deb::dists_prefix(distribution);
        let local_dists = staging.join("dists");
        std::fs::create_dir_all(&local_dists)?;
        self.backend.pull_tree(&dists_prefix, &local_dists).await?;

        let rel_packages = deb::packages_rel_path(component, architecture);
        let packages_path = local_dists.join(&rel_packages);
        if !packages_path.is_file() {
            return Err(Error::NothingToRemove);
        }
        let mut index = PackagesIndex::parse(&std::fs::read_to_string(&packages_path)?)?;

        let removed = index.remove_by_filenames(filenames);
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
            warn!(distribution, component, package = %name, "not present in repository");
        }

        write_index_variants(&packages_path, &index)?;
        let release = regenerate_release(
            &local_dists,
            distribution,
            component,
            architecture,
        )?;

        for (_, pool_path) in &removed {
            self.backend.delete(pool_path).await?;
        }
        self.push_indexes(&dists_prefix, &local_dists, &rel_packages, &release)
            .await?;
        self.sweep(&dists_prefix, &release).await?;

        info!(
            distribution,
            component,
            removed = removed_names.len(),
            "staged package removals"
        );
        Ok(RemoveReport {
            repo: format!("{distribution}/{component}/{architecture}"),
            removed: removed_names,
            not_present,
            legacy_backups: Vec::new(),
        })
    }

    /// Upload the three index variants, then the Release file last.
    async fn push_indexes(
        &self,
        dists_prefix: &str,
        local_dists: &Path,
        rel_packages: &str,
        release: &ReleaseFile,
    ) -> Result<()> {
        for suffix in ["", ".gz", ".bz2"] {
            let rel = format!("{rel_packages}{suffix}");
            let bytes = std::fs::read(local_dists.join(&rel))?;
            self.backend
                .write_bytes(&bytes, &join_key(dists_prefix, &rel))
                .await?;
        }
        self.backend
            .write_bytes(
                release.render().as_bytes(),
                &join_key(dists_prefix, "Release"),
            )
            .await?;
        Ok(())
    }

    /// Delete objects under the dists prefix the new Release no longer
    /// references. Signature artifacts are left alone: signing happens out
    /// of band.
    async fn sweep(&self, dists_prefix: &str, release: &ReleaseFile) -> Result<()> {
        let keep: BTreeSet<&str> = release
            .entries
            .iter()
            .map(|e| e.path.as_str())
            .chain(["Release", "Release.gpg", "InRelease"])
            .collect();
        for key in self.backend.list(dists_prefix, None).await? {
            let top = key.split('/').next().unwrap_or(&key);
            if top.contains(".backup-") {
                continue;
            }
            if !keep.contains(key.as_str()) {
                debug!(%key, "sweeping unreferenced index object");
                self.backend.delete(&join_key(dists_prefix, &key)).await?;
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

fn coordinate(packages: &[DebPackage]) -> Result<String> {
    if packages.is_empty() {
        return Err(Error::Config("no packages given".to_string()));
    }
    let archs: BTreeSet<String> = packages.iter().map(|p| p.architecture.clone()).collect();
    match archs.len() {
        1 => Ok(archs.into_iter().next().unwrap()),
        _ => Err(Error::MixedTargets {
            details: archs.into_iter().collect::<Vec<_>>().join(", "),
        }),
    }
}

/// Write Packages plus its gzip and bzip2 variants into the staging tree.
fn write_index_variants(packages_path: &Path, index: &PackagesIndex) -> Result<()> {
    if let Some(parent) = packages_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = index.render();
    std::fs::write(packages_path, &rendered)?;
    std::fs::write(
        packages_path.with_extension("gz"),
        compress::gzip(rendered.as_bytes())?,
    )?;
    std::fs::write(
        packages_path.with_extension("bz2"),
        compress::bzip2(rendered.as_bytes())?,
    )?;
    Ok(())
}

/// Rebuild the Release from every index file in the staged dists tree,
/// preserving an existing Release's header fields.
fn regenerate_release(
    local_dists: &Path,
    distribution: &str,
    component: &str,
    architecture: &str,
) -> Result<ReleaseFile> {
    let release_path = local_dists.join("Release");
    let mut release = if release_path.is_file() {
        ReleaseFile::parse(&std::fs::read_to_string(&release_path)?)?
    } else {
        ReleaseFile::new(distribution)
    };
    release.architectures.insert(architecture.to_string());
    release.components.insert(component.to_string());
    release.touch();

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(local_dists) {
        let entry = entry.map_err(|e| Error::Metadata(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(local_dists)
            .map_err(|e| Error::Metadata(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        let basename = rel.rsplit('/').next().unwrap_or(&rel).to_string();
        if basename == "Packages"
            || basename == "Packages.gz"
            || basename == "Packages.bz2"
        {
            files.push((rel, std::fs::read(entry.path())?));
        }
    }
    release.set_entries(&files);
    // Rewrite the staged copy so later scans in the same transaction see it.
    std::fs::write(&release_path, release.render())?;
    Ok(release)
}
