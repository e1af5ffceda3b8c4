//! SQLite mirrors of the XML metadata (`primary_db`, `filelists_db`,
//! `other_db`), rebuilt from the post-mutation XML model after every change.
//!
//! The schemas are the createrepo-compatible subset yum/dnf consumers read:
//! `db_info` (dbversion 10), `packages`, `files` and dependency tables for
//! primary, `filelist` for filelists, `changelog` for other, with the
//! canonical indices. The mirrors are bzip2-compressed for upload; the
//! uncompressed files never leave the staging directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use quick_xml::Reader;
use quick_xml::events::Event;
use rusqlite::Connection;
use tracing::debug;

use super::DocKind;
use super::xml::PackageDocument;
use crate::error::{Error, Result};

const DB_VERSION: u32 = 10;

#[derive(Debug, Default, Clone)]
struct Dependency {
    name: String,
    flags: Option<String>,
    epoch: Option<String>,
    version: Option<String>,
    release: Option<String>,
    pre: bool,
}

#[derive(Debug, Default, Clone)]
struct EntryDetail {
    summary: String,
    description: String,
    packager: String,
    url: String,
    time_file: u64,
    time_build: u64,
    license: String,
    vendor: String,
    group: String,
    buildhost: String,
    sourcerpm: String,
    header_start: u64,
    header_end: u64,
    size_package: u64,
    size_installed: u64,
    size_archive: u64,
    provides: Vec<Dependency>,
    requires: Vec<Dependency>,
    conflicts: Vec<Dependency>,
    obsoletes: Vec<Dependency>,
    /// `(type, path)` where type is "file", "dir", or "ghost".
    files: Vec<(String, String)>,
    /// `(author, date, text)`.
    changelogs: Vec<(String, u64, String)>,
}

fn local_of(name: &[u8]) -> String {
    let text = String::from_utf8_lossy(name);
    match text.split_once(':') {
        Some((_, local)) => local.to_string(),
        None => text.into_owned(),
    }
}

/// Walk one raw `<package>` element and pull out everything the sqlite rows
/// need. Absent fields default; the mirrors are only as rich as the XML.
fn parse_detail(raw: &str) -> Result<EntryDetail> {
    let mut reader = Reader::from_str(raw);
    let mut detail = EntryDetail::default();
    let mut dep_section: Option<&'static str> = None;
    let mut capture: Option<String> = None;
    let mut file_type = String::from("file");
    let mut changelog_attrs: Option<(String, u64)> = None;
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                let local = local_of(e.name().as_ref());
                let attr_map = || -> Result<BTreeMap<String, String>> {
                    let mut map = BTreeMap::new();
                    for attr in e.attributes() {
                        let attr = attr?;
                        map.insert(
                            local_of(attr.key.as_ref()),
                            attr.unescape_value()
                                .map_err(|e| Error::Metadata(e.to_string()))?
                                .into_owned(),
                        );
                    }
                    Ok(map)
                };
                match local.as_str() {
                    "summary" | "description" | "packager" | "url" => {
                        if is_start {
                            capture = Some(local);
                        }
                    }
                    "time" => {
                        let attrs = attr_map()?;
                        detail.time_file = num(&attrs, "file");
                        detail.time_build = num(&attrs, "build");
                    }
                    "size" => {
                        let attrs = attr_map()?;
                        detail.size_package = num(&attrs, "package");
                        detail.size_installed = num(&attrs, "installed");
                        detail.size_archive = num(&attrs, "archive");
                    }
                    "license" | "vendor" | "group" | "buildhost" | "sourcerpm" => {
                        if is_start {
                            capture = Some(local);
                        }
                    }
                    "header-range" => {
                        let attrs = attr_map()?;
                        detail.header_start = num(&attrs, "start");
                        detail.header_end = num(&attrs, "end");
                    }
                    "provides" => dep_section = Some("provides"),
                    "requires" => dep_section = Some("requires"),
                    "conflicts" => dep_section = Some("conflicts"),
                    "obsoletes" => dep_section = Some("obsoletes"),
                    "entry" => {
                        let attrs = attr_map()?;
                        let dep = Dependency {
                            name: attrs.get("name").cloned().unwrap_or_default(),
                            flags: attrs.get("flags").cloned(),
                            epoch: attrs.get("epoch").cloned(),
                            version: attrs.get("ver").cloned(),
                            release: attrs.get("rel").cloned(),
                            pre: attrs.get("pre").is_some_and(|p| p == "1"),
                        };
                        match dep_section {
                            Some("provides") => detail.provides.push(dep),
                            Some("requires") => detail.requires.push(dep),
                            Some("conflicts") => detail.conflicts.push(dep),
                            Some("obsoletes") => detail.obsoletes.push(dep),
                            _ => {}
                        }
                    }
                    "file" if is_start => {
                        let attrs = attr_map()?;
                        file_type = attrs
                            .get("type")
                            .cloned()
                            .unwrap_or_else(|| "file".to_string());
                        capture = Some("file".to_string());
                    }
                    "changelog" if is_start => {
                        let attrs = attr_map()?;
                        changelog_attrs = Some((
                            attrs.get("author").cloned().unwrap_or_default(),
                            attrs
                                .get("date")
                                .and_then(|d| d.parse().ok())
                                .unwrap_or_default(),
                        ));
                        capture = Some("changelog".to_string());
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                capture = None;
                match local_of(e.name().as_ref()).as_str() {
                    "provides" | "requires" | "conflicts" | "obsoletes" => dep_section = None,
                    _ => {}
                }
            }
            Event::Text(t) => {
                let Some(field) = capture.as_deref() else {
                    continue;
                };
                let text = t
                    .unescape()
                    .map_err(|e| Error::Metadata(e.to_string()))?
                    .into_owned();
                match field {
                    "summary" => detail.summary = text,
                    "description" => detail.description = text,
                    "packager" => detail.packager = text,
                    "url" => detail.url = text,
                    "license" => detail.license = text,
                    "vendor" => detail.vendor = text,
                    "group" => detail.group = text,
                    "buildhost" => detail.buildhost = text,
                    "sourcerpm" => detail.sourcerpm = text,
                    "file" => detail.files.push((file_type.clone(), text)),
                    "changelog" => {
                        if let Some((author, date)) = changelog_attrs.take() {
                            detail.changelogs.push((author, date, text));
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(detail)
}

fn num(attrs: &BTreeMap<String, String>, key: &str) -> u64 {
    attrs.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Delete stale mirror files from a staging directory so an aborted earlier
/// run can't leak into the upload set.
pub fn remove_stale_mirrors(repodata_dir: &Path) -> Result<()> {
    if !repodata_dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(repodata_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".sqlite") || name.ends_with(".sqlite.bz2") {
            debug!(file = %name, "removing stale sqlite mirror");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Build the uncompressed sqlite mirror for one document kind.
/// `xml_checksum` is the open-checksum of the XML the mirror reflects, stored
/// in `db_info` the way createrepo records provenance.
pub fn build_mirror(
    repodata_dir: &Path,
    kind: DocKind,
    doc: &PackageDocument,
    xml_checksum: &str,
) -> Result<PathBuf> {
    let path = repodata_dir.join(kind.sqlite_filename());
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    let conn = Connection::open(&path)?;
    match kind {
        DocKind::Primary => build_primary(&conn, doc)?,
        DocKind::Filelists => build_filelists(&conn, doc)?,
        DocKind::Other => build_other(&conn, doc)?,
    }
    conn.execute_batch("CREATE TABLE db_info (dbversion INTEGER, checksum TEXT)")?;
    conn.execute(
        "INSERT INTO db_info (dbversion, checksum) VALUES (?1, ?2)",
        rusqlite::params![DB_VERSION, xml_checksum],
    )?;
    conn.close().map_err(|(_, e)| Error::Sqlite(e))?;
    debug!(path = %path.display(), kind = kind.mdtype(), "built sqlite mirror");
    Ok(path)
}

fn build_primary(conn: &Connection, doc: &PackageDocument) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE packages (
            pkgKey INTEGER PRIMARY KEY,
            pkgId TEXT,
            name TEXT,
            arch TEXT,
            version TEXT,
            epoch TEXT,
            release TEXT,
            summary TEXT,
            description TEXT,
            url TEXT,
            time_file INTEGER,
            time_build INTEGER,
            rpm_license TEXT,
            rpm_vendor TEXT,
            rpm_group TEXT,
            rpm_buildhost TEXT,
            rpm_sourcerpm TEXT,
            rpm_header_start INTEGER,
            rpm_header_end INTEGER,
            rpm_packager TEXT,
            size_package INTEGER,
            size_installed INTEGER,
            size_archive INTEGER,
            location_href TEXT,
            location_base TEXT,
            checksum_type TEXT);
        CREATE TABLE files (name TEXT, type TEXT, pkgKey INTEGER);
        CREATE TABLE provides (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
        CREATE TABLE requires (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER, pre BOOLEAN DEFAULT FALSE);
        CREATE TABLE conflicts (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
        CREATE TABLE obsoletes (name TEXT, flags TEXT, epoch TEXT, version TEXT, release TEXT, pkgKey INTEGER);
        CREATE INDEX packagename ON packages (name);
        CREATE INDEX packageId ON packages (pkgId);
        CREATE INDEX filenames ON files (name);
        CREATE INDEX pkgfiles ON files (pkgKey);
        CREATE INDEX pkgprovides ON provides (pkgKey);
        CREATE INDEX providesname ON provides (name);
        CREATE INDEX pkgrequires ON requires (pkgKey);
        CREATE INDEX requiresname ON requires (name);
        CREATE INDEX pkgconflicts ON conflicts (pkgKey);
        CREATE INDEX pkgobsoletes ON obsoletes (pkgKey);",
    )?;
    let mut insert_pkg = conn.prepare(
        "INSERT INTO packages (
            pkgKey, pkgId, name, arch, version, epoch, release, summary,
            description, url, time_file, time_build, rpm_license, rpm_vendor,
            rpm_group, rpm_buildhost, rpm_sourcerpm, rpm_header_start,
            rpm_header_end, rpm_packager, size_package, size_installed,
            size_archive, location_href, location_base, checksum_type)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                 ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, NULL, 'sha256')",
    )?;
    let mut insert_file = conn.prepare("INSERT INTO files (name, type, pkgKey) VALUES (?1, ?2, ?3)")?;
    let mut insert_provides = dep_statement(conn, "provides")?;
    let mut insert_conflicts = dep_statement(conn, "conflicts")?;
    let mut insert_obsoletes = dep_statement(conn, "obsoletes")?;
    let mut insert_requires = conn.prepare(
        "INSERT INTO requires (name, flags, epoch, version, release, pkgKey, pre) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;

    for (index, entry) in doc.entries.iter().enumerate() {
        let pkg_key = (index + 1) as i64;
        let detail = parse_detail(&entry.raw)?;
        insert_pkg.execute(rusqlite::params![
            pkg_key,
            entry.pkgid,
            entry.name,
            entry.arch,
            entry.version,
            entry.epoch,
            entry.release,
            detail.summary,
            detail.description,
            detail.url,
            detail.time_file,
            detail.time_build,
            detail.license,
            detail.vendor,
            detail.group,
            detail.buildhost,
            detail.sourcerpm,
            detail.header_start,
            detail.header_end,
            detail.packager,
            detail.size_package,
            detail.size_installed,
            detail.size_archive,
            entry.location_href.as_deref().unwrap_or_default(),
        ])?;
        for (file_type, path) in &detail.files {
            insert_file.execute(rusqlite::params![path, file_type, pkg_key])?;
        }
        for dep in &detail.provides {
            insert_provides.execute(rusqlite::params![
                dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key
            ])?;
        }
        for dep in &detail.requires {
            insert_requires.execute(rusqlite::params![
                dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key, dep.pre
            ])?;
        }
        for dep in &detail.conflicts {
            insert_conflicts.execute(rusqlite::params![
                dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key
            ])?;
        }
        for dep in &detail.obsoletes {
            insert_obsoletes.execute(rusqlite::params![
                dep.name, dep.flags, dep.epoch, dep.version, dep.release, pkg_key
            ])?;
        }
    }
    Ok(())
}

fn dep_statement<'c>(
    conn: &'c Connection,
    table: &str,
) -> rusqlite::Result<rusqlite::Statement<'c>> {
    conn.prepare(&format!(
        "INSERT INTO {table} (name, flags, epoch, version, release, pkgKey) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    ))
}

fn build_filelists(conn: &Connection, doc: &PackageDocument) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
        CREATE TABLE filelist (pkgKey INTEGER, dirname TEXT, filenames TEXT, filetypes TEXT);
        CREATE INDEX keyfile ON filelist (pkgKey);
        CREATE INDEX pkgId ON packages (pkgId);
        CREATE INDEX dirnames ON filelist (dirname);",
    )?;
    let mut insert_pkg = conn.prepare("INSERT INTO packages (pkgKey, pkgId) VALUES (?1, ?2)")?;
    let mut insert_dir = conn.prepare(
        "INSERT INTO filelist (pkgKey, dirname, filenames, filetypes) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (index, entry) in doc.entries.iter().enumerate() {
        let pkg_key = (index + 1) as i64;
        insert_pkg.execute(rusqlite::params![pkg_key, entry.pkgid])?;
        let detail = parse_detail(&entry.raw)?;
        for (dirname, (filenames, filetypes)) in group_files(&detail.files) {
            insert_dir.execute(rusqlite::params![pkg_key, dirname, filenames, filetypes])?;
        }
    }
    Ok(())
}

/// Aggregate file paths per directory the way the filelists schema stores
/// them: filenames joined by `/`, filetypes one character per file.
fn group_files(files: &[(String, String)]) -> BTreeMap<String, (String, String)> {
    let mut dirs: BTreeMap<String, (String, String)> = BTreeMap::new();
    for (file_type, path) in files {
        let (dirname, basename) = match path.rsplit_once('/') {
            Some((dir, base)) if !dir.is_empty() => (dir.to_string(), base),
            Some((_, base)) => ("/".to_string(), base),
            None => ("/".to_string(), path.as_str()),
        };
        let type_char = match file_type.as_str() {
            "dir" => 'd',
            "ghost" => 'g',
            _ => 'f',
        };
        let slot = dirs.entry(dirname).or_default();
        if !slot.0.is_empty() {
            slot.0.push('/');
        }
        slot.0.push_str(basename);
        slot.1.push(type_char);
    }
    dirs
}

fn build_other(conn: &Connection, doc: &PackageDocument) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE packages (pkgKey INTEGER PRIMARY KEY, pkgId TEXT);
        CREATE TABLE changelog (pkgKey INTEGER, author TEXT, date INTEGER, changelog TEXT);
        CREATE INDEX keychange ON changelog (pkgKey);
        CREATE INDEX pkgId ON packages (pkgId);",
    )?;
    let mut insert_pkg = conn.prepare("INSERT INTO packages (pkgKey, pkgId) VALUES (?1, ?2)")?;
    let mut insert_log = conn.prepare(
        "INSERT INTO changelog (pkgKey, author, date, changelog) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (index, entry) in doc.entries.iter().enumerate() {
        let pkg_key = (index + 1) as i64;
        insert_pkg.execute(rusqlite::params![pkg_key, entry.pkgid])?;
        let detail = parse_detail(&entry.raw)?;
        for (author, date, text) in &detail.changelogs {
            insert_log.execute(rusqlite::params![pkg_key, author, date, text])?;
        }
    }
    Ok(())
}

/// Rows in the `packages` table. Must equal the XML package count before a
/// transaction may commit.
pub fn packages_row_count(path: &Path) -> Result<u64> {
    let conn = Connection::open(path)?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM packages", [], |row| row.get(0))?;
    Ok(count as u64)
}

/// Names from `expected` that the database lacks.
pub fn missing_tables(path: &Path, expected: &[&str]) -> Result<Vec<String>> {
    let conn = Connection::open(path)?;
    let mut missing = Vec::new();
    for table in expected {
        let found: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            rusqlite::params![table],
            |row| row.get(0),
        )?;
        if found == 0 {
            missing.push(table.to_string());
        }
    }
    Ok(missing)
}

/// Expected tables per mirror, for full validation.
pub fn expected_tables(kind: DocKind) -> &'static [&'static str] {
    match kind {
        DocKind::Primary => &["db_info", "packages", "files", "provides", "requires"],
        DocKind::Filelists => &["db_info", "packages", "filelist"],
        DocKind::Other => &["db_info", "packages", "changelog"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="1">
<package type="rpm"><name>hello-world</name><arch>x86_64</arch><version epoch="0" ver="1.0.0" rel="1.el9"/><checksum type="sha256" pkgid="YES">aaaa</checksum><summary>says hello</summary><description>Greets.</description><packager>builder</packager><url>https://example.com</url><time file="1700000000" build="1699999999"/><size package="100" installed="200" archive="220"/><location href="hello-world-1.0.0-1.el9.x86_64.rpm"/><format><rpm:license>MIT</rpm:license><rpm:vendor>Example</rpm:vendor><rpm:group>Unspecified</rpm:group><rpm:buildhost>forge</rpm:buildhost><rpm:sourcerpm>hello-world-1.0.0-1.el9.src.rpm</rpm:sourcerpm><rpm:header-range start="280" end="2000"/><rpm:provides><rpm:entry name="hello-world" flags="EQ" epoch="0" ver="1.0.0" rel="1.el9"/></rpm:provides><rpm:requires><rpm:entry name="libc.so.6()(64bit)"/></rpm:requires><file>/usr/bin/hello</file><file type="dir">/usr/share/hello</file></format></package>
</metadata>
"#;

    const FILELISTS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<filelists xmlns="http://linux.duke.edu/metadata/filelists" packages="1">
<package pkgid="aaaa" name="hello-world" arch="x86_64"><version epoch="0" ver="1.0.0" rel="1.el9"/><file>/usr/bin/hello</file><file>/usr/bin/hello2</file><file type="dir">/usr/share/hello</file></package>
</filelists>
"#;

    const OTHER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<otherdata xmlns="http://linux.duke.edu/metadata/other" packages="1">
<package pkgid="aaaa" name="hello-world" arch="x86_64"><version epoch="0" ver="1.0.0" rel="1.el9"/><changelog author="builder &lt;b@example.com&gt; - 1.0.0-1" date="1699999000">- initial build</changelog></package>
</otherdata>
"#;

    #[test]
    fn primary_mirror_rows_match_xml() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PackageDocument::parse(DocKind::Primary, PRIMARY).unwrap();
        let path = build_mirror(dir.path(), DocKind::Primary, &doc, "openchk").unwrap();
        assert_eq!(packages_row_count(&path).unwrap(), 1);
        assert!(missing_tables(&path, expected_tables(DocKind::Primary))
            .unwrap()
            .is_empty());

        let conn = Connection::open(&path).unwrap();
        let (name, href, license): (String, String, String) = conn
            .query_row(
                "SELECT name, location_href, rpm_license FROM packages",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(name, "hello-world");
        assert_eq!(href, "hello-world-1.0.0-1.el9.x86_64.rpm");
        assert_eq!(license, "MIT");
        let requires: i64 = conn
            .query_row("SELECT COUNT(*) FROM requires", [], |row| row.get(0))
            .unwrap();
        assert_eq!(requires, 1);
        let (dbversion, checksum): (i64, String) = conn
            .query_row("SELECT dbversion, checksum FROM db_info", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(dbversion, 10);
        assert_eq!(checksum, "openchk");
    }

    /// Files aggregate per directory with one type char per file.
    #[test]
    fn filelists_mirror_groups_by_dirname() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PackageDocument::parse(DocKind::Filelists, FILELISTS).unwrap();
        let path = build_mirror(dir.path(), DocKind::Filelists, &doc, "chk").unwrap();
        let conn = Connection::open(&path).unwrap();
        let (dirname, filenames, filetypes): (String, String, String) = conn
            .query_row(
                "SELECT dirname, filenames, filetypes FROM filelist WHERE dirname = '/usr/bin'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(dirname, "/usr/bin");
        assert_eq!(filenames, "hello/hello2");
        assert_eq!(filetypes, "ff");
    }

    #[test]
    fn other_mirror_carries_changelogs() {
        let dir = tempfile::tempdir().unwrap();
        let doc = PackageDocument::parse(DocKind::Other, OTHER).unwrap();
        let path = build_mirror(dir.path(), DocKind::Other, &doc, "chk").unwrap();
        let conn = Connection::open(&path).unwrap();
        let (author, date): (String, i64) = conn
            .query_row("SELECT author, date FROM changelog", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert!(author.starts_with("builder"));
        assert_eq!(date, 1699999000);
    }

    #[test]
    fn stale_mirrors_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("primary.sqlite"), b"stale").unwrap();
        std::fs::write(dir.path().join("old-primary.sqlite.bz2"), b"stale").unwrap();
        std::fs::write(dir.path().join("repomd.xml"), b"keep").unwrap();
        remove_stale_mirrors(dir.path()).unwrap();
        assert!(!dir.path().join("primary.sqlite").exists());
        assert!(!dir.path().join("old-primary.sqlite.bz2").exists());
        assert!(dir.path().join("repomd.xml").exists());
    }
}
