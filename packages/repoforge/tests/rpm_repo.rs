//! End-to-end RPM engine scenarios against the filesystem backend, with the
//! stub metadata generator standing in for createrepo_c.

use std::collections::BTreeMap;
use std::path::Path;

use repoforge::checksum;
use repoforge::compress;
use repoforge::engine::rpm::RpmRepo;
use repoforge::engine::{EngineOptions, validate};
use repoforge::error::Error;
use repoforge::rpm::{DocKind, MD_ALL, PackageDocument, Repomd};
use repoforge::storage::{Backend, LocalBackend};
use repoforge::testing::{StubGenerator, rpm_fixture};

const HELLO: &str = "hello-world-1.0.0-1.el9.x86_64.rpm";
const GOODBYE: &str = "goodbye-forever-2.0.0-1.el9.x86_64.rpm";
const REPO: &str = "el9/x86_64";

struct Harness {
    store: tempfile::TempDir,
    work: tempfile::TempDir,
    cache: tempfile::TempDir,
    backend: Backend,
    generator: StubGenerator,
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
            generator: StubGenerator,
        }
    }

    fn engine(&self) -> RpmRepo<'_, StubGenerator> {
        RpmRepo::new(
            &self.backend,
            &self.generator,
            self.cache.path().to_path_buf(),
            EngineOptions::default(),
        )
    }

    async fn read(&self, key: &str) -> Vec<u8> {
        self.backend.read(key).await.unwrap()
    }

    async fn repomd(&self) -> Repomd {
        let bytes = self.read(&format!("{REPO}/repodata/repomd.xml")).await;
        Repomd::parse(&String::from_utf8(bytes).unwrap()).unwrap()
    }

    async fn primary(&self) -> PackageDocument {
        let repomd = self.repomd().await;
        let record = repomd.get("primary").unwrap();
        let bytes = self.read(&format!("{REPO}/{}", record.location_href)).await;
        let xml = compress::gunzip(&bytes).unwrap();
        PackageDocument::parse(DocKind::Primary, &String::from_utf8(xml).unwrap()).unwrap()
    }
}

/// Every file in the store, excluding backup prefixes.
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

/// Scenario: two packages into an empty backend initialize a repository
/// whose repomd lists all six record types with matching checksums, and
/// full validation is clean.
#[tokio::test]
async fn fresh_init_passes_full_validation() {
    let h = Harness::new();
    let packages = vec![
        rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap(),
        rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap(),
    ];
    let report = h.engine().add(&packages).await.unwrap();
    assert_eq!(report.added.len(), 2);
    assert_eq!(report.repo, REPO);

    let repomd = h.repomd().await;
    let mut types: Vec<&str> = repomd.records.iter().map(|r| r.mdtype.as_str()).collect();
    types.sort_unstable();
    let mut expected: Vec<&str> = MD_ALL.to_vec();
    expected.sort_unstable();
    assert_eq!(types, expected);

    for record in &repomd.records {
        let bytes = h.read(&format!("{REPO}/{}", record.location_href)).await;
        assert_eq!(checksum::sha256_bytes(&bytes), record.checksum);
        assert_eq!(bytes.len() as u64, record.size);
    }

    assert!(h.backend.exists(&format!("{REPO}/{HELLO}")).await.unwrap());
    assert!(h.backend.exists(&format!("{REPO}/{GOODBYE}")).await.unwrap());

    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Scenario: re-adding published packages classifies everything as
/// duplicate and leaves the store byte-identical.
#[tokio::test]
async fn duplicate_add_short_circuits() {
    let h = Harness::new();
    let packages = vec![
        rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap(),
        rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap(),
    ];
    h.engine().add(&packages).await.unwrap();
    let before = snapshot(h.store.path());

    let report = h.engine().add(&packages).await.unwrap();
    assert!(report.added.is_empty());
    assert!(report.updated.is_empty());
    assert_eq!(report.duplicates.len(), 2);

    let after = snapshot(h.store.path());
    assert_eq!(before, after);
    // The begin-time backup is deleted again at commit.
    let leftovers = h.backend.list(REPO, None).await.unwrap();
    assert!(leftovers.iter().all(|k| !k.contains(".backup-")));
}

/// Scenario: merging a second package into an existing repository keeps one
/// record per type and bumps every count to two.
#[tokio::test]
async fn merge_add_updates_counts() {
    let h = Harness::new();
    let hello = rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap();
    h.engine().add(&[hello]).await.unwrap();
    let goodbye = rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap();
    h.engine().add(&[goodbye]).await.unwrap();

    let repomd = h.repomd().await;
    assert!(repomd.duplicate_types().is_empty());
    assert_eq!(repomd.records.len(), MD_ALL.len());

    let primary = h.primary().await;
    assert_eq!(primary.package_count(), 2);
    assert_eq!(primary.declared_packages, Some(2));

    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Scenario: a filename collision with different content replaces the
/// stored object and the primary entry's digest.
#[tokio::test]
async fn update_by_checksum_change() {
    let h = Harness::new();
    let original = rpm_fixture(h.work.path(), HELLO, b"first build").unwrap();
    h.engine().add(&[original]).await.unwrap();

    let rebuilt_dir = tempfile::tempdir().unwrap();
    let rebuilt = rpm_fixture(rebuilt_dir.path(), HELLO, b"second build").unwrap();
    let new_sha = rebuilt.sha256.clone();
    let report = h.engine().add(&[rebuilt]).await.unwrap();
    assert_eq!(report.updated, vec![HELLO.to_string()]);
    assert!(report.added.is_empty());

    assert_eq!(h.read(&format!("{REPO}/{HELLO}")).await, b"second build");
    let primary = h.primary().await;
    assert_eq!(primary.package_count(), 1);
    assert_eq!(primary.entries[0].pkgid, new_sha);

    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Scenario: a transport failure on the final repomd upload restores the
/// previous state, keeps the backup for inspection, and the repository
/// still validates.
#[tokio::test]
async fn forced_failure_restores_previous_state() {
    let h = Harness::new();
    let hello = rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap();
    h.engine().add(&[hello]).await.unwrap();
    let before = snapshot(h.store.path());

    let failing = Backend::Local(LocalBackend::with_write_failure(
        h.store.path(),
        "repomd.xml",
    ));
    let generator = StubGenerator;
    let engine = RpmRepo::new(
        &failing,
        &generator,
        h.cache.path().to_path_buf(),
        EngineOptions::default(),
    );
    let goodbye = rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap();
    let err = engine.add(&[goodbye]).await.unwrap_err();
    assert!(matches!(err, Error::StorageUnavailable(_)), "got {err:?}");

    // Live state is rewound; the backup prefix is retained.
    let after = snapshot(h.store.path());
    assert_eq!(before, after);
    let siblings = h.backend.list("el9/x86_64", None).await.unwrap();
    assert!(siblings.iter().any(|k| k.contains("repodata.backup-")));

    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Scenario: remove deletes the storage object and every metadata entry;
/// re-adding restores the two-package state.
#[tokio::test]
async fn remove_then_re_add() {
    let h = Harness::new();
    let packages = vec![
        rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap(),
        rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap(),
    ];
    h.engine().add(&packages).await.unwrap();

    let report = h.engine().remove(&[GOODBYE.to_string()]).await.unwrap();
    assert_eq!(report.removed, vec![GOODBYE.to_string()]);
    assert!(report.not_present.is_empty());

    assert!(!h.backend.exists(&format!("{REPO}/{GOODBYE}")).await.unwrap());
    let primary = h.primary().await;
    assert_eq!(primary.package_count(), 1);
    assert_eq!(primary.entries[0].name, "hello-world");
    let leftovers = h.backend.list(REPO, None).await.unwrap();
    assert!(leftovers.iter().all(|k| !k.contains(".backup-")));
    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");

    let goodbye = rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap();
    h.engine().add(&[goodbye]).await.unwrap();
    let primary = h.primary().await;
    assert_eq!(primary.package_count(), 2);
    let issues = validate::full_rpm(&h.backend, REPO).await.unwrap();
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

/// Packages resolving to different repositories fail before the transaction
/// begins.
#[tokio::test]
async fn mixed_targets_fail_fast() {
    let h = Harness::new();
    let nine = rpm_fixture(h.work.path(), HELLO, b"nine").unwrap();
    let eight = rpm_fixture(
        h.work.path(),
        "other-tool-1.0.0-1.el8.x86_64.rpm",
        b"eight",
    )
    .unwrap();
    let err = h.engine().add(&[nine, eight]).await.unwrap_err();
    assert!(matches!(err, Error::MixedTargets { .. }), "got {err:?}");
    assert!(snapshot(h.store.path()).is_empty());
}

/// Removing only absent filenames fails; removing a mix reports the absent
/// ones and succeeds.
#[tokio::test]
async fn remove_tolerates_partially_absent_inputs() {
    let h = Harness::new();
    let hello = rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap();
    h.engine().add(&[hello]).await.unwrap();

    let err = h
        .engine()
        .remove(&["never-there-1.0.0-1.el9.x86_64.rpm".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NothingToRemove), "got {err:?}");

    let report = h
        .engine()
        .remove(&[
            HELLO.to_string(),
            "never-there-1.0.0-1.el9.x86_64.rpm".to_string(),
        ])
        .await
        .unwrap();
    assert_eq!(report.removed, vec![HELLO.to_string()]);
    assert_eq!(
        report.not_present,
        vec!["never-there-1.0.0-1.el9.x86_64.rpm".to_string()]
    );
    let primary = h.primary().await;
    assert_eq!(primary.package_count(), 0);
}

/// The sqlite mirror row count follows the XML count through a merge.
#[tokio::test]
async fn sqlite_rows_track_package_count() {
    let h = Harness::new();
    let packages = vec![
        rpm_fixture(h.work.path(), HELLO, b"hello payload").unwrap(),
        rpm_fixture(h.work.path(), GOODBYE, b"goodbye payload").unwrap(),
    ];
    h.engine().add(&packages).await.unwrap();

    let repomd = h.repomd().await;
    let record = repomd.get("primary_db").unwrap();
    let bytes = h.read(&format!("{REPO}/{}", record.location_href)).await;
    let db = compress::bunzip2(&bytes).unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), &db).unwrap();
    assert_eq!(
        repoforge::rpm::sqlite::packages_row_count(file.path()).unwrap(),
        2
    );
}
