//! Package inspection.
//!
//! Control fields come from the system tools (`rpm -qp`, `dpkg-deb -f`); the
//! engine only ever sees the parsed result. Digests and sizes are computed
//! here, streaming, so a package is read exactly once before upload.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::checksum;
use crate::error::{Error, Result};

/// An RPM ready for ingestion. The architecture comes from the package
/// header, not the filename; `el_version` is derived from the trailing
/// `.el<N>` tag of the release.
#[derive(Debug, Clone)]
pub struct RpmPackage {
    pub name: String,
    pub version: String,
    pub release: String,
    pub epoch: Option<String>,
    pub architecture: String,
    pub el_version: String,
    pub sha256: String,
    pub size: u64,
    pub local_path: PathBuf,
}

impl RpmPackage {
    pub fn filename(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Storage prefix of the repository this package belongs to.
    pub fn repo_path(&self) -> String {
        format!("el{}/{}", self.el_version, self.architecture)
    }
}

/// A Debian package ready for ingestion.
#[derive(Debug, Clone)]
pub struct DebPackage {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub maintainer: String,
    pub description: String,
    pub depends: Option<String>,
    pub installed_size: Option<String>,
    /// Control fields beyond the canonical set, in control-file order.
    pub extra: Vec<(String, String)>,
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub local_path: PathBuf,
}

impl DebPackage {
    pub fn filename(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Canonical pool location: `pool/<component>/<prefix>/<name>/<filename>`.
    pub fn pool_path(&self, component: &str) -> String {
        format!(
            "pool/{component}/{}/{}/{}",
            pool_prefix(&self.name),
            self.name,
            self.filename()
        )
    }
}

/// Pool prefix letter. Packages named `lib<x>...` shelve under `lib<x>`.
pub fn pool_prefix(name: &str) -> String {
    if let Some(rest) = name.strip_prefix("lib") {
        if let Some(c) = rest.chars().next() {
            return format!("lib{c}");
        }
    }
    name.chars().next().map(String::from).unwrap_or_default()
}

fn malformed(path: &Path, reason: impl Into<String>) -> Error {
    Error::MalformedPackage {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn run_tool(path: &Path, program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| malformed(path, format!("could not run {program}: {e}")))?;
    if !output.status.success() {
        return Err(malformed(
            path,
            format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    String::from_utf8(output.stdout)
        .map_err(|_| malformed(path, format!("{program} produced non-UTF-8 output")))
}

const RPM_QUERYFORMAT: &str = "%{NAME}\n%{VERSION}\n%{RELEASE}\n%{EPOCH}\n%{ARCH}\n";

pub fn inspect_rpm(path: &Path) -> Result<RpmPackage> {
    let out = run_tool(
        path,
        "rpm",
        &[
            "-qp",
            "--queryformat",
            RPM_QUERYFORMAT,
            &path.to_string_lossy(),
        ],
    )?;
    let mut lines = out.lines();
    let mut field = |name: &str| {
        lines
            .next()
            .map(str::to_string)
            .ok_or_else(|| malformed(path, format!("missing {name} in rpm output")))
    };
    let name = field("name")?;
    let version = field("version")?;
    let release = field("release")?;
    let epoch = field("epoch")?;
    let architecture = field("architecture")?;
    if name.is_empty() || version.is_empty() || release.is_empty() || architecture.is_empty() {
        return Err(malformed(path, "empty control field in rpm output"));
    }
    // rpm prints "(none)" for an unset epoch.
    let epoch = match epoch.as_str() {
        "" | "(none)" => None,
        e => Some(e.to_string()),
    };
    let el_version = el_version_of_release(&release)
        .ok_or_else(|| malformed(path, format!("release {release:?} carries no .el<N> tag")))?;
    let (sha256, size) = checksum::sha256_file(path)?;
    debug!(%name, %version, %release, %architecture, %el_version, "inspected rpm");
    Ok(RpmPackage {
        name,
        version,
        release,
        epoch,
        architecture,
        el_version,
        sha256,
        size,
        local_path: path.to_path_buf(),
    })
}

/// The trailing `.el<N>` tag of an RPM release string, e.g. `1.el9` -> `9`.
pub fn el_version_of_release(release: &str) -> Option<String> {
    for segment in release.rsplit('.') {
        if let Some(rest) = segment.strip_prefix("el") {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                return Some(digits);
            }
        }
    }
    None
}

/// Repository prefix for an RPM filename, used by `remove` where only
/// basenames are given: `hello-1.0-1.el9.x86_64.rpm` -> `el9/x86_64`.
pub fn rpm_repo_path_of_filename(filename: &str) -> Result<String> {
    let err = || Error::MalformedPackage {
        path: PathBuf::from(filename),
        reason: "filename does not end in .el<N>.<arch>.rpm".to_string(),
    };
    let stem = filename.strip_suffix(".rpm").ok_or_else(err)?;
    let (rest, arch) = stem.rsplit_once('.').ok_or_else(err)?;
    let (_, el) = rest.rsplit_once('.').ok_or_else(err)?;
    let digits = el.strip_prefix("el").ok_or_else(err)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) || arch.is_empty() {
        return Err(err());
    }
    Ok(format!("{el}/{arch}"))
}

const DEB_CANONICAL_FIELDS: &[&str] = &[
    "Package",
    "Version",
    "Architecture",
    "Maintainer",
    "Installed-Size",
    "Depends",
    "Description",
];

pub fn inspect_deb(path: &Path) -> Result<DebPackage> {
    let out = run_tool(path, "dpkg-deb", &["-f", &path.to_string_lossy()])?;
    let fields = parse_control(&out);
    let get = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .ok_or_else(|| malformed(path, format!("control file is missing {name}")))
    };
    let name = get("Package")?;
    let version = get("Version")?;
    let architecture = get("Architecture")?;
    let maintainer = get("Maintainer")?;
    let description = get("Description")?;
    let depends = fields
        .iter()
        .find(|(k, _)| k == "Depends")
        .map(|(_, v)| v.clone());
    let installed_size = fields
        .iter()
        .find(|(k, _)| k == "Installed-Size")
        .map(|(_, v)| v.clone());
    let extra = fields
        .into_iter()
        .filter(|(k, _)| !DEB_CANONICAL_FIELDS.contains(&k.as_str()))
        .collect();
    let (md5, sha1, sha256, size) = checksum::digest_file_all(path)?;
    debug!(%name, %version, %architecture, "inspected deb");
    Ok(DebPackage {
        name,
        version,
        architecture,
        maintainer,
        description,
        depends,
        installed_size,
        extra,
        size,
        md5,
        sha1,
        sha256,
        local_path: path.to_path_buf(),
    })
}

/// Parse RFC-822-style control output. Continuation lines begin with a space
/// or tab and stay attached to their field.
pub fn parse_control(text: &str) -> Vec<(String, String)> {
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some((_, value)) = fields.last_mut() {
                value.push('\n');
                value.push_str(line);
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.push((key.to_string(), value.trim_start().to_string()));
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn el_version_comes_from_release_tag() {
        assert_eq!(el_version_of_release("1.el9"), Some("9".to_string()));
        assert_eq!(el_version_of_release("2.el8_6"), Some("8".to_string()));
        assert_eq!(el_version_of_release("3"), None);
        assert_eq!(el_version_of_release("1.elx"), None);
    }

    #[test]
    fn repo_path_from_filename() {
        assert_eq!(
            rpm_repo_path_of_filename("hello-world-1.0.0-1.el9.x86_64.rpm").unwrap(),
            "el9/x86_64"
        );
        assert!(rpm_repo_path_of_filename("hello.deb").is_err());
        assert!(rpm_repo_path_of_filename("hello-1.0-1.fc40.x86_64.rpm").is_err());
    }

    /// `lib` packages shelve under `lib<fourth letter>`.
    #[test]
    fn pool_prefix_lib_rule() {
        assert_eq!(pool_prefix("curl"), "c");
        assert_eq!(pool_prefix("libcurl4"), "libc");
        assert_eq!(pool_prefix("libssl3"), "libs");
    }

    #[test]
    fn control_parse_keeps_continuations() {
        let control = "Package: hello\nDescription: greets\n the whole world\nSection: misc\n";
        let fields = parse_control(control);
        assert_eq!(fields[0], ("Package".to_string(), "hello".to_string()));
        assert_eq!(
            fields[1],
            (
                "Description".to_string(),
                "greets\n the whole world".to_string()
            )
        );
        assert_eq!(fields[2], ("Section".to_string(), "misc".to_string()));
    }
}
