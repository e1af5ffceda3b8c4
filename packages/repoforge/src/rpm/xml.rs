//! Primary/filelists/other document surgery.
//!
//! Package entries are kept as verbatim XML slices with a handful of
//! extracted key fields, so merges and removals splice elements without
//! disturbing the ones that don't change. Serialization always emits the
//! document's default namespace with an *empty* prefix (`<package>`, never
//! `<common:package>`); `rpm:`-prefixed children keep their prefix. Parsing
//! tolerates historical documents that were serialized with a prefix on the
//! default namespace, and normalizes them back on the next write.

use std::collections::HashMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::DocKind;
use crate::error::{Error, Result};

/// One `<package>` element, raw, plus the fields the engine keys on.
#[derive(Debug, Clone)]
pub struct PackageEntry {
    pub name: String,
    pub arch: String,
    /// The package's sha256: the `<checksum pkgid="YES">` text in primary,
    /// the `pkgid` attribute in filelists/other.
    pub pkgid: String,
    /// `<location href>`; primary only.
    pub location_href: Option<String>,
    pub epoch: String,
    pub version: String,
    pub release: String,
    /// The whole element, serialized in canonical (default-namespace) form.
    pub raw: String,
}

impl PackageEntry {
    /// Basename of the stored package object, for primary entries.
    pub fn location_basename(&self) -> Option<&str> {
        self.location_href
            .as_deref()
            .map(|href| href.rsplit('/').next().unwrap_or(href))
    }
}

#[derive(Debug, Clone)]
pub struct PackageDocument {
    pub kind: DocKind,
    pub entries: Vec<PackageEntry>,
    /// Set when the parsed document carried a prefix on the default
    /// namespace; the validator reports this as a namespace issue.
    pub parsed_with_prefix: bool,
    /// The root's `packages` attribute as parsed (serialization always
    /// recomputes it from the entry count).
    pub declared_packages: Option<u64>,
}

fn split_name(name: &[u8]) -> Result<(Option<String>, String)> {
    let text = std::str::from_utf8(name)
        .map_err(|_| Error::Metadata("non-UTF-8 element name".to_string()))?;
    Ok(match text.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, text.to_string()),
    })
}

/// Rebuild a start tag in canonical form, stripping `strip_prefix` from the
/// element name and dropping the namespace declaration that introduced it.
fn start_tag_to_string(
    e: &BytesStart<'_>,
    local: &str,
    strip_prefix: Option<&str>,
) -> Result<String> {
    let mut out = String::from("<");
    out.push_str(local);
    for attr in e.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| Error::Metadata("non-UTF-8 attribute".to_string()))?;
        if let Some(prefix) = strip_prefix {
            if key == format!("xmlns:{prefix}") {
                continue;
            }
        }
        let value = std::str::from_utf8(&attr.value)
            .map_err(|_| Error::Metadata("non-UTF-8 attribute value".to_string()))?;
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        out.push_str(value);
        out.push('"');
    }
    out.push('>');
    Ok(out)
}

/// Strip an unwanted default-namespace prefix from the markup of a captured
/// entry (historical repositories only).
fn strip_markup_prefix(raw: &str, prefix: &str) -> String {
    raw.replace(&format!("<{prefix}:"), "<")
        .replace(&format!("</{prefix}:"), "</")
}

impl PackageDocument {
    pub fn empty(kind: DocKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            parsed_with_prefix: false,
            declared_packages: None,
        }
    }

    pub fn parse(kind: DocKind, xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut entries = Vec::new();
        let mut root_prefix: Option<String> = None;
        let mut declared_packages = None;
        let mut seen_root = false;
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let (prefix, local) = split_name(e.name().as_ref())?;
                    if !seen_root {
                        if local != kind.root_tag() {
                            return Err(Error::Metadata(format!(
                                "expected <{}> root, found <{local}>",
                                kind.root_tag()
                            )));
                        }
                        seen_root = true;
                        root_prefix = prefix;
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"packages" {
                                declared_packages = attr
                                    .unescape_value()
                                    .map_err(|e| Error::Metadata(e.to_string()))?
                                    .parse::<u64>()
                                    .ok();
                            }
                        }
                    } else if local == "package" {
                        let strip = prefix.clone();
                        let start = start_tag_to_string(&e, "package", strip.as_deref())?;
                        let span = reader.read_to_end(e.name())?;
                        let inner = &xml[span.start as usize..span.end as usize];
                        let inner = match &strip {
                            Some(p) => strip_markup_prefix(inner, p),
                            None => inner.to_string(),
                        };
                        let raw = format!("{start}{inner}</package>");
                        entries.push(extract_entry(kind, &raw)?);
                    } else {
                        reader.read_to_end(e.name())?;
                    }
                }
                Event::Empty(e) => {
                    let (_, local) = split_name(e.name().as_ref())?;
                    if seen_root && local == "package" {
                        let start = start_tag_to_string(&e, "package", None)?;
                        let raw = format!("{}</package>", start);
                        entries.push(extract_entry(kind, &raw)?);
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        if !seen_root {
            return Err(Error::Metadata(format!(
                "document has no <{}> root",
                kind.root_tag()
            )));
        }
        Ok(Self {
            kind,
            entries,
            parsed_with_prefix: root_prefix.is_some(),
            declared_packages,
        })
    }

    pub fn package_count(&self) -> usize {
        self.entries.len()
    }

    /// Canonical serialization. The default namespace is declared without a
    /// prefix; primary additionally declares `rpm:`.
    pub fn to_xml(&self) -> String {
        let root = self.kind.root_tag();
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!("<{root} xmlns=\"{}\"", self.kind.namespace()));
        if self.kind == DocKind::Primary {
            out.push_str(&format!(" xmlns:rpm=\"{}\"", super::XML_NS_RPM));
        }
        out.push_str(&format!(" packages=\"{}\">\n", self.entries.len()));
        for entry in &self.entries {
            out.push_str(&entry.raw);
            out.push('\n');
        }
        out.push_str(&format!("</{root}>\n"));
        out
    }

    /// `{location basename -> pkgid}` for deduplication; primary only.
    pub fn filename_map(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.location_basename()
                    .map(|base| (base.to_string(), e.pkgid.clone()))
            })
            .collect()
    }

    /// Drop entries whose location basename is listed. Returns
    /// `(filename, pkgid)` for each entry actually removed.
    pub fn remove_by_filenames(&mut self, filenames: &[String]) -> Vec<(String, String)> {
        let mut removed = Vec::new();
        self.entries.retain(|entry| {
            match entry.location_basename() {
                Some(base) if filenames.iter().any(|f| f == base) => {
                    removed.push((base.to_string(), entry.pkgid.clone()));
                    false
                }
                _ => true,
            }
        });
        removed
    }

    /// Drop entries by pkgid (filelists/other counterpart of a primary
    /// removal).
    pub fn remove_by_pkgids(&mut self, pkgids: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !pkgids.contains(&e.pkgid));
        before - self.entries.len()
    }

    /// Splice in freshly generated entries. An incoming entry replaces any
    /// existing one with the same pkgid.
    pub fn append_entries(&mut self, incoming: Vec<PackageEntry>) {
        for entry in incoming {
            self.entries.retain(|e| e.pkgid != entry.pkgid);
            self.entries.push(entry);
        }
    }
}

/// Pull the key fields out of a canonicalized entry.
fn extract_entry(kind: DocKind, raw: &str) -> Result<PackageEntry> {
    let mut reader = Reader::from_str(raw);
    let mut entry = PackageEntry {
        name: String::new(),
        arch: String::new(),
        pkgid: String::new(),
        location_href: None,
        epoch: String::new(),
        version: String::new(),
        release: String::new(),
        raw: raw.to_string(),
    };
    let mut depth = 0usize;
    let mut in_checksum_pkgid = false;
    let mut capture_text: Option<&'static str> = None;
    loop {
        let event = reader.read_event()?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_start = matches!(event, Event::Start(_));
                let (_, local) = split_name(e.name().as_ref())?;
                match (depth, local.as_str()) {
                    (0, "package") => {
                        // filelists/other carry pkgid/name/arch as attributes.
                        for attr in e.attributes() {
                            let attr = attr?;
                            let value = attr
                                .unescape_value()
                                .map_err(|e| Error::Metadata(e.to_string()))?
                                .into_owned();
                            match attr.key.as_ref() {
                                b"pkgid" => entry.pkgid = value,
                                b"name" => entry.name = value,
                                b"arch" => entry.arch = value,
                                _ => {}
                            }
                        }
                    }
                    (1, "name") if kind == DocKind::Primary && is_start => {
                        capture_text = Some("name")
                    }
                    (1, "arch") if kind == DocKind::Primary && is_start => {
                        capture_text = Some("arch")
                    }
                    (1, "checksum") if is_start => {
                        in_checksum_pkgid = e.attributes().flatten().any(|a| {
                            a.key.as_ref() == b"pkgid"
                                && a.value.as_ref().eq_ignore_ascii_case(b"yes")
                        });
                        if in_checksum_pkgid {
                            capture_text = Some("pkgid");
                        }
                    }
                    (1, "version") => {
                        for attr in e.attributes() {
                            let attr = attr?;
                            let value = attr
                                .unescape_value()
                                .map_err(|e| Error::Metadata(e.to_string()))?
                                .into_owned();
                            match attr.key.as_ref() {
                                b"epoch" => entry.epoch = value,
                                b"ver" => entry.version = value,
                                b"rel" => entry.release = value,
                                _ => {}
                            }
                        }
                    }
                    (1, "location") => {
                        for attr in e.attributes() {
                            let attr = attr?;
                            if attr.key.as_ref() == b"href" {
                                entry.location_href = Some(
                                    attr.unescape_value()
                                        .map_err(|e| Error::Metadata(e.to_string()))?
                                        .into_owned(),
                                );
                            }
                        }
                    }
                    _ => {}
                }
                if is_start {
                    depth += 1;
                }
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                capture_text = None;
                in_checksum_pkgid = false;
            }
            Event::Text(t) => {
                if let Some(field) = capture_text {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Metadata(e.to_string()))?
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    match field {
                        "name" => entry.name = text,
                        "arch" => entry.arch = text,
                        "pkgid" => entry.pkgid = text,
                        _ => {}
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if entry.pkgid.is_empty() {
        return Err(Error::Metadata(format!(
            "{} entry for {:?} has no package checksum",
            kind.root_tag(),
            entry.name
        )));
    }
    Ok(entry)
}
