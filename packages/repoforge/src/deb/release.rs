//! The per-distribution Release file: header fields, then `MD5Sum`, `SHA1`,
//! and `SHA256` blocks listing every index variant under
//! `dists/<codename>/` with size and digest.

use std::collections::{BTreeMap, BTreeSet};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;

use crate::checksum;
use crate::error::{Error, Result};
use crate::inspect::parse_control;

/// One indexed file, keyed by its path relative to `dists/<codename>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub path: String,
    pub size: u64,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default)]
pub struct ReleaseFile {
    pub origin: Option<String>,
    pub label: Option<String>,
    pub suite: Option<String>,
    pub codename: Option<String>,
    pub date: Option<String>,
    pub architectures: BTreeSet<String>,
    pub components: BTreeSet<String>,
    pub description: Option<String>,
    pub entries: Vec<ReleaseEntry>,
}

impl ReleaseFile {
    /// A fresh Release for a distribution this tool initializes.
    pub fn new(distribution: &str) -> Self {
        Self {
            origin: Some("repoforge".to_string()),
            label: Some("repoforge".to_string()),
            suite: Some(distribution.to_string()),
            codename: Some(distribution.to_string()),
            description: Some(format!("{distribution} package repository")),
            ..Self::default()
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut release = Self::default();
        let mut digests: BTreeMap<String, (Option<String>, Option<String>, Option<String>, u64)> =
            BTreeMap::new();
        let mut block: Option<&str> = None;
        for line in text.lines() {
            match line {
                "MD5Sum:" => {
                    block = Some("md5");
                    continue;
                }
                "SHA1:" => {
                    block = Some("sha1");
                    continue;
                }
                "SHA256:" => {
                    block = Some("sha256");
                    continue;
                }
                _ => {}
            }
            if let Some(which) = block {
                let mut parts = line.split_whitespace();
                let (Some(digest), Some(size), Some(path)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(Error::Metadata(format!(
                        "malformed Release checksum row: {line:?}"
                    )));
                };
                let size: u64 = size
                    .parse()
                    .map_err(|_| Error::Metadata(format!("bad size in Release row: {line:?}")))?;
                let slot = digests.entry(path.to_string()).or_insert((None, None, None, size));
                slot.3 = size;
                match which {
                    "md5" => slot.0 = Some(digest.to_string()),
                    "sha1" => slot.1 = Some(digest.to_string()),
                    _ => slot.2 = Some(digest.to_string()),
                }
            }
        }
        let header_end = text.find("MD5Sum:").unwrap_or(text.len());
        for (key, value) in parse_control(&text[..header_end]) {
            match key.as_str() {
                "Origin" => release.origin = Some(value),
                "Label" => release.label = Some(value),
                "Suite" => release.suite = Some(value),
                "Codename" => release.codename = Some(value),
                "Date" => release.date = Some(value),
                "Architectures" => {
                    release.architectures =
                        value.split_whitespace().map(str::to_string).collect();
                }
                "Components" => {
                    release.components = value.split_whitespace().map(str::to_string).collect();
                }
                "Description" => release.description = Some(value),
                _ => {}
            }
        }
        for (path, (md5, sha1, sha256, size)) in digests {
            release.entries.push(ReleaseEntry {
                path,
                size,
                md5: md5.unwrap_or_default(),
                sha1: sha1.unwrap_or_default(),
                sha256: sha256.unwrap_or_default(),
            });
        }
        Ok(release)
    }

    /// Replace the indexed-file set from `(relative path, contents)` pairs,
    /// digesting each one.
    pub fn set_entries(&mut self, files: &[(String, Vec<u8>)]) {
        self.entries = files
            .iter()
            .map(|(path, bytes)| ReleaseEntry {
                path: path.clone(),
                size: bytes.len() as u64,
                md5: checksum::md5_bytes(bytes),
                sha1: checksum::sha1_bytes(bytes),
                sha256: checksum::sha256_bytes(bytes),
            })
            .collect();
        self.entries.sort_by(|a, b| a.path.cmp(&b.path));
    }

    /// Stamp the Date field. RFC 2822, per `date -R -u`.
    pub fn touch(&mut self) {
        self.date = Some(OffsetDateTime::now_utc().format(&Rfc2822).unwrap());
    }

    /// Header fields in pinned order, then the three checksum blocks. Each
    /// row: one leading space, digest, two spaces, size right-justified to
    /// at least eight columns, two spaces, path.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let archs = self
            .architectures
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let comps = self
            .components
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let headers: [(&str, Option<&str>); 8] = [
            ("Origin", self.origin.as_deref()),
            ("Label", self.label.as_deref()),
            ("Suite", self.suite.as_deref()),
            ("Codename", self.codename.as_deref()),
            ("Date", self.date.as_deref()),
            ("Architectures", (!archs.is_empty()).then_some(archs.as_str())),
            ("Components", (!comps.is_empty()).then_some(comps.as_str())),
            ("Description", self.description.as_deref()),
        ];
        for (key, value) in headers {
            if let Some(value) = value {
                out.push_str(key);
                out.push_str(": ");
                out.push_str(value);
                out.push('\n');
            }
        }
        out.push_str("MD5Sum:\n");
        for entry in &self.entries {
            out.push_str(&format!(" {}  {:>8}  {}\n", entry.md5, entry.size, entry.path));
        }
        out.push_str("SHA1:\n");
        for entry in &self.entries {
            out.push_str(&format!(" {}  {:>8}  {}\n", entry.sha1, entry.size, entry.path));
        }
        out.push_str("SHA256:\n");
        for entry in &self.entries {
            out.push_str(&format!(
                " {}  {:>8}  {}\n",
                entry.sha256, entry.size, entry.path
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ReleaseFile {
        let mut release = ReleaseFile::new("stable");
        release.date = Some("Thu, 01 Aug 2024 00:00:00 +0000".to_string());
        release.architectures.insert("amd64".to_string());
        release.architectures.insert("arm64".to_string());
        release.components.insert("main".to_string());
        release.set_entries(&[
            (
                "main/binary-amd64/Packages".to_string(),
                b"Package: hello\n".to_vec(),
            ),
            (
                "main/binary-amd64/Packages.gz".to_string(),
                vec![0x1f, 0x8b, 0x08],
            ),
        ]);
        release
    }

    /// Header order and the checksum row format are pinned.
    #[test]
    fn render_format_is_pinned() {
        let text = sample().render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Origin: repoforge");
        assert_eq!(lines[1], "Label: repoforge");
        assert_eq!(lines[2], "Suite: stable");
        assert_eq!(lines[3], "Codename: stable");
        assert!(lines[4].starts_with("Date: "));
        assert_eq!(lines[5], "Architectures: amd64 arm64");
        assert_eq!(lines[6], "Components: main");
        assert_eq!(lines[7], "Description: stable package repository");
        assert_eq!(lines[8], "MD5Sum:");
        // One space, digest, two spaces, size right-justified to 8, two
        // spaces, path.
        let row = lines[9];
        assert!(row.starts_with(' '));
        let digest_end = 1 + 32;
        assert_eq!(&row[digest_end..digest_end + 2], "  ");
        assert_eq!(&row[digest_end + 2..digest_end + 10], "      15");
        assert!(row.ends_with("  main/binary-amd64/Packages"));
    }

    #[test]
    fn parse_render_round_trip() {
        let once = sample().render();
        let twice = ReleaseFile::parse(&once).unwrap().render();
        assert_eq!(once, twice);
    }

    /// Checksum rows agree with the actual file bytes.
    #[test]
    fn entries_digest_contents() {
        let release = sample();
        let entry = &release.entries[0];
        assert_eq!(entry.size, 15);
        assert_eq!(entry.sha256, checksum::sha256_bytes(b"Package: hello\n"));
    }
}
