//! Test support: a metadata generator that needs no external tooling, and
//! package fixtures whose control fields derive from their filenames, so the
//! engine can be exercised end to end against the filesystem backend.

use std::path::{Path, PathBuf};

use crate::checksum;
use crate::compress;
use crate::error::{Error, Result};
use crate::generate::Generator;
use crate::inspect::{DebPackage, RpmPackage, el_version_of_release};
use crate::rpm::{DocKind, PackageDocument, PackageEntry, Repomd, RepomdRecord};

/// Stand-in for `createrepo_c`: produces primary/filelists/other (and a
/// repomd indexing them) for every `.rpm` file in the package directory,
/// deriving fields from filenames.
#[derive(Debug, Default)]
pub struct StubGenerator;

impl Generator for StubGenerator {
    fn generate(&self, package_dir: &Path, output_dir: &Path) -> Result<()> {
        let mut filenames: Vec<String> = std::fs::read_dir(package_dir)?
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().into_owned();
                name.ends_with(".rpm").then_some(name)
            })
            .collect();
        filenames.sort();

        let mut primary = PackageDocument::empty(DocKind::Primary);
        let mut filelists = PackageDocument::empty(DocKind::Filelists);
        let mut other = PackageDocument::empty(DocKind::Other);
        for filename in &filenames {
            let path = package_dir.join(filename);
            let (sha256, size) = checksum::sha256_file(&path)?;
            let (name, version, release, arch) = parse_rpm_filename(filename)?;
            primary.entries.push(primary_entry(
                &name, &version, &release, &arch, &sha256, size, filename,
            ));
            filelists.entries.push(filelists_entry(
                &name, &version, &release, &arch, &sha256,
            ));
            other.entries.push(other_entry(&name, &version, &release, &arch, &sha256));
        }

        let repodata = output_dir.join("repodata");
        std::fs::create_dir_all(&repodata)?;
        let mut repomd = Repomd {
            revision: 0,
            records: Vec::new(),
        };
        for (kind, doc) in [
            (DocKind::Primary, &primary),
            (DocKind::Filelists, &filelists),
            (DocKind::Other, &other),
        ] {
            let xml = doc.to_xml();
            let gz = compress::gzip(xml.as_bytes())?;
            let stored_checksum = checksum::sha256_bytes(&gz);
            let name = checksum::content_addressed_name(&stored_checksum, kind.base_filename());
            std::fs::write(repodata.join(&name), &gz)?;
            repomd.upsert(RepomdRecord {
                mdtype: kind.mdtype().to_string(),
                checksum: stored_checksum,
                open_checksum: Some(checksum::sha256_bytes(xml.as_bytes())),
                location_href: format!("repodata/{name}"),
                timestamp: 0,
                size: gz.len() as u64,
                open_size: Some(xml.len() as u64),
                database_version: None,
            });
        }
        std::fs::write(repodata.join("repomd.xml"), repomd.to_xml()?)?;
        Ok(())
    }
}

/// `hello-world-1.0.0-1.el9.x86_64.rpm` -> (hello-world, 1.0.0, 1.el9, x86_64).
pub fn parse_rpm_filename(filename: &str) -> Result<(String, String, String, String)> {
    let err = || Error::MalformedPackage {
        path: PathBuf::from(filename),
        reason: "filename is not name-version-release.arch.rpm".to_string(),
    };
    let stem = filename.strip_suffix(".rpm").ok_or_else(err)?;
    let (nvr, arch) = stem.rsplit_once('.').ok_or_else(err)?;
    let (nv, release) = nvr.rsplit_once('-').ok_or_else(err)?;
    let (name, version) = nv.rsplit_once('-').ok_or_else(err)?;
    Ok((
        name.to_string(),
        version.to_string(),
        release.to_string(),
        arch.to_string(),
    ))
}

fn primary_entry(
    name: &str,
    version: &str,
    release: &str,
    arch: &str,
    sha256: &str,
    size: u64,
    filename: &str,
) -> PackageEntry {
    let raw = format!(
        "<package type=\"rpm\"><name>{name}</name><arch>{arch}</arch>\
<version epoch=\"0\" ver=\"{version}\" rel=\"{release}\"/>\
<checksum type=\"sha256\" pkgid=\"YES\">{sha256}</checksum>\
<summary>{name}</summary><description>{name} package</description>\
<packager>repoforge test suite</packager><url>https://example.invalid/{name}</url>\
<time file=\"0\" build=\"0\"/><size package=\"{size}\" installed=\"{size}\" archive=\"{size}\"/>\
<location href=\"{filename}\"/>\
<format><rpm:license>MIT</rpm:license><rpm:group>Unspecified</rpm:group>\
<rpm:buildhost>localhost</rpm:buildhost>\
<rpm:sourcerpm>{name}-{version}-{release}.src.rpm</rpm:sourcerpm>\
<rpm:header-range start=\"0\" end=\"0\"/>\
<rpm:provides><rpm:entry name=\"{name}\" flags=\"EQ\" epoch=\"0\" ver=\"{version}\" rel=\"{release}\"/></rpm:provides>\
<file>/usr/bin/{name}</file></format></package>"
    );
    PackageEntry {
        name: name.to_string(),
        arch: arch.to_string(),
        pkgid: sha256.to_string(),
        location_href: Some(filename.to_string()),
        epoch: "0".to_string(),
        version: version.to_string(),
        release: release.to_string(),
        raw,
    }
}

fn filelists_entry(
    name: &str,
    version: &str,
    release: &str,
    arch: &str,
    sha256: &str,
) -> PackageEntry {
    let raw = format!(
        "<package pkgid=\"{sha256}\" name=\"{name}\" arch=\"{arch}\">\
<version epoch=\"0\" ver=\"{version}\" rel=\"{release}\"/>\
<file>/usr/bin/{name}</file></package>"
    );
    PackageEntry {
        name: name.to_string(),
        arch: arch.to_string(),
        pkgid: sha256.to_string(),
        location_href: None,
        epoch: "0".to_string(),
        version: version.to_string(),
        release: release.to_string(),
        raw,
    }
}

fn other_entry(
    name: &str,
    version: &str,
    release: &str,
    arch: &str,
    sha256: &str,
) -> PackageEntry {
    let raw = format!(
        "<package pkgid=\"{sha256}\" name=\"{name}\" arch=\"{arch}\">\
<version epoch=\"0\" ver=\"{version}\" rel=\"{release}\"/>\
<changelog author=\"repoforge test suite\" date=\"0\">- {version}-{release}</changelog></package>"
    );
    PackageEntry {
        name: name.to_string(),
        arch: arch.to_string(),
        pkgid: sha256.to_string(),
        location_href: None,
        epoch: "0".to_string(),
        version: version.to_string(),
        release: release.to_string(),
        raw,
    }
}

/// Write a fake package file and build its `RpmPackage` without the `rpm`
/// tool, deriving control fields from the filename.
pub fn rpm_fixture(dir: &Path, filename: &str, content: &[u8]) -> Result<RpmPackage> {
    let path = dir.join(filename);
    std::fs::write(&path, content)?;
    let (name, version, release, arch) = parse_rpm_filename(filename)?;
    let el_version = el_version_of_release(&release).ok_or_else(|| Error::MalformedPackage {
        path: path.clone(),
        reason: "no .el<N> tag".to_string(),
    })?;
    let (sha256, size) = checksum::sha256_file(&path)?;
    Ok(RpmPackage {
        name,
        version,
        release,
        epoch: None,
        architecture: arch,
        el_version,
        sha256,
        size,
        local_path: path,
    })
}

/// Write a fake Debian package file and build its `DebPackage` without
/// `dpkg-deb`.
pub fn deb_fixture(
    dir: &Path,
    name: &str,
    version: &str,
    architecture: &str,
    content: &[u8],
) -> Result<DebPackage> {
    let filename = format!("{name}_{version}_{architecture}.deb");
    let path = dir.join(&filename);
    std::fs::write(&path, content)?;
    let (md5, sha1, sha256, size) = checksum::digest_file_all(&path)?;
    Ok(DebPackage {
        name: name.to_string(),
        version: version.to_string(),
        architecture: architecture.to_string(),
        maintainer: "Test Suite <tests@example.invalid>".to_string(),
        description: format!("{name} test package"),
        depends: None,
        installed_size: Some("12".to_string()),
        extra: Vec::new(),
        size,
        md5,
        sha1,
        sha256,
        local_path: path,
    })
}
