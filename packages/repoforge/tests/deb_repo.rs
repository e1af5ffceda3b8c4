//! End-to-end Debian engine scenarios against the filesystem backend.

use std::collections::BTreeMap;
use std::path::Path;

use repoforge::checksum;
use repoforge::deb::{PackagesIndex, ReleaseFile};
use repoforge::engine::deb::DebRepo;
use repoforge::engine::{EngineOptions, validate};
use repoforge::error::Error;
use repoforge::storage::{Backend, LocalBackend};
use repoforge::testing::deb_fixture;

struct Harness {
    store: tempfile::TempDir,
    work: tempfile::TempDir,
    cache: tempfile::TempDir,
    backend: Backend,
}

impl Harness {
    fn new() -> Self {
        let store = tempfile::tempdir().unwrap();
        let backend = Backend::Local(LocalBackend::new(store.path()));
        Self {
            store,
            work: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
            backend,
        }
    }

    fn engine(&self) -> DebRepo<'_> {
        DebRepo::new(
            &self.backend,
            self.cache.path().to_path_buf(),
            EngineOptions::default(),
        )
    }

    async fn read(&self, key: &str) -> Vec<u8> {
        self.backend.read(key).await.unwrap()
    }

    async fn packages_index(&self) -> PackagesIndex {
        let bytes = self.read("dists/stable/main/binary-amd64/Packages").await;
        PackagesIndex::parse(&String::from_utf8(bytes).unwrap()).unwrap()
    }

    async fn release(&self) -> ReleaseFile {
        let bytes = self.read("dists/stable/Release").await;
        ReleaseFile::parse(&String::from_utf8(bytes).unwrap()).unwrap()
    }
}

fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut map = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap()
            .to_string_lossy()
            .into_owned();
        if rel.contains(".backup-") {
            continue;
        }
        map.insert(rel, std::fs::read(entry.path()).unwrap());
    }
    map
}

/// A fresh distribution gets pool objects, three index variants, and a
/// Release whose checksum rows match the stored files.
#[tokio::test]
async fn fresh_init_publishes_consistent_distribution() {
    let h = Harness::new();
    let packages = vec![
        deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"hello deb").unwrap(),
        deb_fixture(h.work.path(), "libgreet4", "2.0.0", "amd64", b"lib deb").unwrap(),
    ];
    let report = h.engine().add(&packages, "stable", "main").await.unwrap();
    assert_eq!(report.added.len(), 2);

    assert!(
        h.backend
            .exists("pool/main/h/hello/hello_1.0.0_amd64.deb")
            .await
            .unwrap()
    );
    // The lib prefix rule shelves libgreet4 under libg.
    assert!(
        h.backend
            .exists("pool/main/libg/libgreet4/libgreet4_2.0.0_amd64.deb")
            .await
            .unwrap()
    );

    let index = h.packages_index().await;
    assert_eq!(index.package_count(), 2);

    let release = h.release().await;
    assert!(release.architectures.contains("amd64"));
    assert!(release.components.contains("main"));
    for suffix in ["", ".gz", ".bz2"] {
        let path = format!("main/binary-amd64/Packages{suffix}");
        let entry = release
            .entries
            .iter()
            .find(|e| e.path == path)
            .unwrap_or_else(|| panic!("Release does not list {path}"));
        let bytes = h.read(&format!("dists/stable/{path}")).await;
        assert_eq!(entry.sha256, checksum::sha256_bytes(&bytes));
        assert_eq!(entry.size, bytes.len() as u64);
    }

    let issues = validate::full_deb(&h.backend, "stable", "main", "amd64")
        .await
        .unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Re-adding published packages writes nothing.
#[tokio::test]
async fn duplicate_add_short_circuits() {
    let h = Harness::new();
    let packages = vec![deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"hello deb").unwrap()];
    h.engine().add(&packages, "stable", "main").await.unwrap();
    let before = snapshot(h.store.path());

    let report = h.engine().add(&packages, "stable", "main").await.unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.duplicates.len(), 1);
    assert_eq!(before, snapshot(h.store.path()));
}

/// A filename collision with different content replaces the pool object and
/// the stanza digests.
#[tokio::test]
async fn update_by_checksum_change() {
    let h = Harness::new();
    let original = deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"first").unwrap();
    h.engine().add(&[original], "stable", "main").await.unwrap();

    let rebuilt_dir = tempfile::tempdir().unwrap();
    let rebuilt = deb_fixture(rebuilt_dir.path(), "hello", "1.0.0", "amd64", b"second").unwrap();
    let new_sha = rebuilt.sha256.clone();
    let report = h.engine().add(&[rebuilt], "stable", "main").await.unwrap();
    assert_eq!(report.updated, vec!["hello_1.0.0_amd64.deb".to_string()]);

    assert_eq!(
        h.read("pool/main/h/hello/hello_1.0.0_amd64.deb").await,
        b"second"
    );
    let index = h.packages_index().await;
    assert_eq!(index.package_count(), 1);
    assert_eq!(index.stanzas[0].get("SHA256"), Some(new_sha.as_str()));

    let issues = validate::full_deb(&h.backend, "stable", "main", "amd64")
        .await
        .unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Remove deletes the pool object and the stanza; the Release is
/// regenerated; validation stays clean.
#[tokio::test]
async fn remove_then_validate() {
    let h = Harness::new();
    let packages = vec![
        deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"hello deb").unwrap(),
        deb_fixture(h.work.path(), "goodbye", "2.0.0", "amd64", b"goodbye deb").unwrap(),
    ];
    h.engine().add(&packages, "stable", "main").await.unwrap();

    let report = h
        .engine()
        .remove(
            &["goodbye_2.0.0_amd64.deb".to_string()],
            "stable",
            "main",
            "amd64",
        )
        .await
        .unwrap();
    assert_eq!(report.removed, vec!["goodbye_2.0.0_amd64.deb".to_string()]);

    assert!(
        !h.backend
            .exists("pool/main/g/goodbye/goodbye_2.0.0_amd64.deb")
            .await
            .unwrap()
    );
    let index = h.packages_index().await;
    assert_eq!(index.package_count(), 1);

    let issues = validate::full_deb(&h.backend, "stable", "main", "amd64")
        .await
        .unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Removing only absent filenames is a non-destructive failure.
#[tokio::test]
async fn remove_of_absent_packages_fails_cleanly() {
    let h = Harness::new();
    let packages = vec![deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"hello deb").unwrap()];
    h.engine().add(&packages, "stable", "main").await.unwrap();
    let before = snapshot(h.store.path());

    let err = h
        .engine()
        .remove(
            &["never_1.0.0_amd64.deb".to_string()],
            "stable",
            "main",
            "amd64",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NothingToRemove), "got {err:?}");
    assert_eq!(before, snapshot(h.store.path()));
}

/// Mixed architectures in one call fail before the transaction begins.
#[tokio::test]
async fn mixed_architectures_fail_fast() {
    let h = Harness::new();
    let amd = deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"a").unwrap();
    let arm = deb_fixture(h.work.path(), "hello", "1.0.0", "arm64", b"b").unwrap();
    let err = h
        .engine()
        .add(&[amd, arm], "stable", "main")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MixedTargets { .. }), "got {err:?}");
    assert!(snapshot(h.store.path()).is_empty());
}

/// A transport failure on the Release upload restores the distribution and
/// removes the freshly added pool object.
#[tokio::test]
async fn forced_failure_restores_previous_state() {
    let h = Harness::new();
    let hello = deb_fixture(h.work.path(), "hello", "1.0.0", "amd64", b"hello deb").unwrap();
    h.engine().add(&[hello], "stable", "main").await.unwrap();
    let before = snapshot(h.store.path());

    let failing = Backend::Local(LocalBackend::with_write_failure(
        h.store.path(),
        "stable/Release",
    ));
    let engine = DebRepo::new(
        &failing,
        h.cache.path().to_path_buf(),
        EngineOptions::default(),
    );
    let goodbye = deb_fixture(h.work.path(), "goodbye", "2.0.0", "amd64", b"goodbye deb").unwrap();
    let err = engine.add(&[goodbye], "stable", "main").await.unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)), "got {err:?}");

    assert_eq!(before, snapshot(h.store.path()));
    let issues = validate::full_deb(&h.backend, "stable", "main", "amd64")
        .await
        .unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}
