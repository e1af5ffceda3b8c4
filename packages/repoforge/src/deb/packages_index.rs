//! The Packages index: RFC-822 stanzas, one per package.
//!
//! Field order within a stanza is pinned (clients and tests both rely on
//! it); fields outside the canonical set are preserved in trailing
//! positions. Rendering the parse of our own output is byte-identical.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::inspect::{DebPackage, parse_control};

/// Canonical stanza field order.
pub const CANONICAL_FIELDS: &[&str] = &[
    "Package",
    "Version",
    "Architecture",
    "Maintainer",
    "Installed-Size",
    "Depends",
    "Filename",
    "Size",
    "MD5sum",
    "SHA1",
    "SHA256",
    "Description",
];

#[derive(Debug, Clone, Default)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Basename of the `Filename` field.
    pub fn filename_basename(&self) -> Option<&str> {
        self.get("Filename")
            .map(|f| f.rsplit('/').next().unwrap_or(f))
    }

    /// Build the stanza for an ingested package at its pool location.
    pub fn from_package(pkg: &DebPackage, pool_path: &str) -> Self {
        let mut fields = vec![
            ("Package".to_string(), pkg.name.clone()),
            ("Version".to_string(), pkg.version.clone()),
            ("Architecture".to_string(), pkg.architecture.clone()),
            ("Maintainer".to_string(), pkg.maintainer.clone()),
        ];
        if let Some(installed_size) = &pkg.installed_size {
            fields.push(("Installed-Size".to_string(), installed_size.clone()));
        }
        if let Some(depends) = &pkg.depends {
            fields.push(("Depends".to_string(), depends.clone()));
        }
        fields.push(("Filename".to_string(), pool_path.to_string()));
        fields.push(("Size".to_string(), pkg.size.to_string()));
        fields.push(("MD5sum".to_string(), pkg.md5.clone()));
        fields.push(("SHA1".to_string(), pkg.sha1.clone()));
        fields.push(("SHA256".to_string(), pkg.sha256.clone()));
        fields.push(("Description".to_string(), pkg.description.clone()));
        for (key, value) in &pkg.extra {
            fields.push((key.clone(), value.clone()));
        }
        Self { fields }
    }

    fn render_into(&self, out: &mut String) {
        for canonical in CANONICAL_FIELDS {
            if let Some(value) = self.get(canonical) {
                out.push_str(canonical);
                out.push_str(": ");
                out.push_str(value);
                out.push('\n');
            }
        }
        for (key, value) in &self.fields {
            if CANONICAL_FIELDS.contains(&key.as_str()) {
                continue;
            }
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PackagesIndex {
    pub stanzas: Vec<Stanza>,
}

impl PackagesIndex {
    pub fn parse(text: &str) -> Result<Self> {
        let mut stanzas = Vec::new();
        for block in text.split("\n\n") {
            let block = block.trim_end_matches('\n');
            if block.trim().is_empty() {
                continue;
            }
            let fields = parse_control(block);
            if fields.is_empty() {
                return Err(Error::Metadata("empty stanza in Packages".to_string()));
            }
            if !fields.iter().any(|(k, _)| k == "Package") {
                return Err(Error::Metadata(
                    "Packages stanza without a Package field".to_string(),
                ));
            }
            stanzas.push(Stanza { fields });
        }
        Ok(Self { stanzas })
    }

    /// Stanzas separated by exactly one blank line, trailing newline after
    /// the last. Zero packages render as the empty string.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, stanza) in self.stanzas.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            stanza.render_into(&mut out);
        }
        out
    }

    pub fn package_count(&self) -> usize {
        self.stanzas.len()
    }

    /// `{filename basename -> sha256}` for deduplication.
    pub fn filename_map(&self) -> HashMap<String, String> {
        self.stanzas
            .iter()
            .filter_map(|s| {
                Some((
                    s.filename_basename()?.to_string(),
                    s.get("SHA256")?.to_string(),
                ))
            })
            .collect()
    }

    /// Insert a stanza, replacing any existing one with the same filename
    /// basename.
    pub fn upsert(&mut self, stanza: Stanza) {
        let key = stanza.filename_basename().map(str::to_string);
        if let Some(key) = key {
            self.stanzas
                .retain(|s| s.filename_basename() != Some(key.as_str()));
        }
        self.stanzas.push(stanza);
    }

    /// Remove stanzas by filename basename. Returns `(basename, pool path)`
    /// for each stanza actually removed.
    pub fn remove_by_filenames(&mut self, filenames: &[String]) -> Vec<(String, String)> {
        let mut removed = Vec::new();
        self.stanzas.retain(|stanza| {
            match stanza.filename_basename() {
                Some(base) if filenames.iter().any(|f| f == base) => {
                    removed.push((
                        base.to_string(),
                        stanza.get("Filename").unwrap_or_default().to_string(),
                    ));
                    false
                }
                _ => true,
            }
        });
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn package(name: &str, sha256: &str) -> DebPackage {
        DebPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            architecture: "amd64".to_string(),
            maintainer: "Team <team@example.com>".to_string(),
            description: "greets\n Greets the whole world.".to_string(),
            depends: Some("libc6 (>= 2.34)".to_string()),
            installed_size: Some("52".to_string()),
            extra: vec![("Section".to_string(), "misc".to_string())],
            size: 1234,
            md5: "m".repeat(32),
            sha1: "s".repeat(40),
            sha256: sha256.to_string(),
            local_path: PathBuf::from(format!("{name}_1.0.0_amd64.deb")),
        }
    }

    /// Parse then render is the identity on our own output.
    #[test]
    fn render_parse_round_trip_is_identity() {
        let mut index = PackagesIndex::default();
        index.upsert(Stanza::from_package(
            &package("hello", &"a".repeat(64)),
            "pool/main/h/hello/hello_1.0.0_amd64.deb",
        ));
        index.upsert(Stanza::from_package(
            &package("goodbye", &"b".repeat(64)),
            "pool/main/g/goodbye/goodbye_1.0.0_amd64.deb",
        ));
        let once = index.render();
        let twice = PackagesIndex::parse(&once).unwrap().render();
        assert_eq!(once, twice);
    }

    /// Canonical fields come first in pinned order; unknown fields trail.
    #[test]
    fn field_order_is_pinned() {
        let stanza = Stanza::from_package(
            &package("hello", &"a".repeat(64)),
            "pool/main/h/hello/hello_1.0.0_amd64.deb",
        );
        let mut out = String::new();
        stanza.render_into(&mut out);
        let keys: Vec<&str> = out
            .lines()
            .filter(|l| !l.starts_with(' '))
            .map(|l| l.split(':').next().unwrap())
            .collect();
        assert_eq!(
            keys,
            vec![
                "Package",
                "Version",
                "Architecture",
                "Maintainer",
                "Installed-Size",
                "Depends",
                "Filename",
                "Size",
                "MD5sum",
                "SHA1",
                "SHA256",
                "Description",
                "Section"
            ]
        );
    }

    #[test]
    fn empty_index_renders_empty() {
        assert_eq!(PackagesIndex::default().render(), "");
    }

    /// Upserting the same filename replaces the stanza.
    #[test]
    fn upsert_replaces_by_filename() {
        let mut index = PackagesIndex::default();
        index.upsert(Stanza::from_package(
            &package("hello", &"a".repeat(64)),
            "pool/main/h/hello/hello_1.0.0_amd64.deb",
        ));
        index.upsert(Stanza::from_package(
            &package("hello", &"c".repeat(64)),
            "pool/main/h/hello/hello_1.0.0_amd64.deb",
        ));
        assert_eq!(index.package_count(), 1);
        assert_eq!(
            index.stanzas[0].get("SHA256"),
            Some("c".repeat(64).as_str())
        );
    }

    #[test]
    fn remove_reports_pool_path() {
        let mut index = PackagesIndex::default();
        index.upsert(Stanza::from_package(
            &package("hello", &"a".repeat(64)),
            "pool/main/h/hello/hello_1.0.0_amd64.deb",
        ));
        let removed = index.remove_by_filenames(&["hello_1.0.0_amd64.deb".to_string()]);
        assert_eq!(
            removed,
            vec![(
                "hello_1.0.0_amd64.deb".to_string(),
                "pool/main/h/hello/hello_1.0.0_amd64.deb".to_string()
            )]
        );
        assert_eq!(index.package_count(), 0);
    }

    /// Multi-line Description fields survive the round trip.
    #[test]
    fn continuation_lines_survive() {
        let text = "Package: hello\nVersion: 1.0.0\nArchitecture: amd64\nFilename: pool/main/h/hello/hello_1.0.0_amd64.deb\nSHA256: aaaa\nDescription: greets\n Greets the whole world.\n";
        let index = PackagesIndex::parse(text).unwrap();
        assert_eq!(index.render(), text);
    }
}
