//! The repomd.xml index: one `<data>` record per metadata type.

use quick_xml::Reader;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{XML_NS_REPO, XML_NS_RPM};
use crate::error::{Error, Result};

/// One `<data>` record. `checksum` digests the stored bytes,
/// `open_checksum` the uncompressed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepomdRecord {
    pub mdtype: String,
    pub checksum: String,
    pub open_checksum: Option<String>,
    pub location_href: String,
    pub timestamp: u64,
    pub size: u64,
    pub open_size: Option<u64>,
    /// Present on the sqlite mirror records.
    pub database_version: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Repomd {
    pub revision: u64,
    pub records: Vec<RepomdRecord>,
}

fn local_name(name: &[u8]) -> String {
    let text = String::from_utf8_lossy(name);
    match text.split_once(':') {
        Some((_, local)) => local.to_string(),
        None => text.into_owned(),
    }
}

impl Repomd {
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        let mut repomd = Repomd::default();
        let mut current: Option<RepomdRecord> = None;
        // Which text node we're inside, within a <data> record.
        let mut capture: Option<String> = None;
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    let local = local_name(e.name().as_ref());
                    match local.as_str() {
                        "data" => {
                            let mut record = RepomdRecord {
                                mdtype: String::new(),
                                checksum: String::new(),
                                open_checksum: None,
                                location_href: String::new(),
                                timestamp: 0,
                                size: 0,
                                open_size: None,
                                database_version: None,
                            };
                            for attr in e.attributes() {
                                let attr = attr?;
                                if attr.key.as_ref() == b"type" {
                                    record.mdtype = attr
                                        .unescape_value()
                                        .map_err(|e| Error::Metadata(e.to_string()))?
                                        .into_owned();
                                }
                            }
                            current = Some(record);
                        }
                        "location" => {
                            if let Some(record) = current.as_mut() {
                                for attr in e.attributes() {
                                    let attr = attr?;
                                    if attr.key.as_ref() == b"href" {
                                        record.location_href = attr
                                            .unescape_value()
                                            .map_err(|e| Error::Metadata(e.to_string()))?
                                            .into_owned();
                                    }
                                }
                            }
                        }
                        "revision" | "checksum" | "open-checksum" | "timestamp" | "size"
                        | "open-size" | "database_version" => capture = Some(local),
                        _ => {}
                    }
                }
                Event::End(e) => {
                    let local = local_name(e.name().as_ref());
                    if local == "data" {
                        if let Some(record) = current.take() {
                            if record.mdtype.is_empty() {
                                return Err(Error::Metadata(
                                    "repomd <data> record without a type".to_string(),
                                ));
                            }
                            repomd.records.push(record);
                        }
                    }
                    capture = None;
                }
                Event::Text(t) => {
                    let Some(field) = capture.as_deref() else {
                        continue;
                    };
                    let text = t
                        .unescape()
                        .map_err(|e| Error::Metadata(e.to_string()))?
                        .trim()
                        .to_string();
                    if text.is_empty() {
                        continue;
                    }
                    let parse_num = |t: &str| {
                        t.parse::<u64>()
                            .map_err(|_| Error::Metadata(format!("bad number {t:?} in repomd")))
                    };
                    match (field, current.as_mut()) {
                        ("revision", None) => repomd.revision = parse_num(&text)?,
                        ("checksum", Some(r)) => r.checksum = text,
                        ("open-checksum", Some(r)) => r.open_checksum = Some(text),
                        ("timestamp", Some(r)) => r.timestamp = parse_num(&text)?,
                        ("size", Some(r)) => r.size = parse_num(&text)?,
                        ("open-size", Some(r)) => r.open_size = Some(parse_num(&text)?),
                        ("database_version", Some(r)) => {
                            r.database_version = Some(parse_num(&text)? as u32)
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(repomd)
    }

    pub fn to_xml(&self) -> Result<String> {
        let mut writer = quick_xml::Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = BytesStart::new("repomd");
        root.push_attribute(("xmlns", XML_NS_REPO));
        root.push_attribute(("xmlns:rpm", XML_NS_RPM));
        writer.write_event(Event::Start(root))?;

        writer.write_event(Event::Start(BytesStart::new("revision")))?;
        writer.write_event(Event::Text(BytesText::new(&self.revision.to_string())))?;
        writer.write_event(Event::End(BytesEnd::new("revision")))?;

        for record in &self.records {
            let mut data = BytesStart::new("data");
            data.push_attribute(("type", record.mdtype.as_str()));
            writer.write_event(Event::Start(data))?;

            let mut checksum = BytesStart::new("checksum");
            checksum.push_attribute(("type", "sha256"));
            writer.write_event(Event::Start(checksum))?;
            writer.write_event(Event::Text(BytesText::new(&record.checksum)))?;
            writer.write_event(Event::End(BytesEnd::new("checksum")))?;

            if let Some(open) = &record.open_checksum {
                let mut open_checksum = BytesStart::new("open-checksum");
                open_checksum.push_attribute(("type", "sha256"));
                writer.write_event(Event::Start(open_checksum))?;
                writer.write_event(Event::Text(BytesText::new(open)))?;
                writer.write_event(Event::End(BytesEnd::new("open-checksum")))?;
            }

            let mut location = BytesStart::new("location");
            location.push_attribute(("href", record.location_href.as_str()));
            writer.write_event(Event::Empty(location))?;

            for (tag, value) in [
                ("timestamp", Some(record.timestamp)),
                ("size", Some(record.size)),
                ("open-size", record.open_size),
            ] {
                if let Some(value) = value {
                    writer.write_event(Event::Start(BytesStart::new(tag)))?;
                    writer.write_event(Event::Text(BytesText::new(&value.to_string())))?;
                    writer.write_event(Event::End(BytesEnd::new(tag)))?;
                }
            }

            if let Some(version) = record.database_version {
                writer.write_event(Event::Start(BytesStart::new("database_version")))?;
                writer.write_event(Event::Text(BytesText::new(&version.to_string())))?;
                writer.write_event(Event::End(BytesEnd::new("database_version")))?;
            }

            writer.write_event(Event::End(BytesEnd::new("data")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("repomd")))?;

        let mut out = writer.into_inner();
        out.push(b'\n');
        String::from_utf8(out).map_err(|_| Error::Metadata("repomd is not UTF-8".to_string()))
    }

    /// Insert a record, displacing any existing record of the same type.
    pub fn upsert(&mut self, record: RepomdRecord) {
        match self.records.iter_mut().find(|r| r.mdtype == record.mdtype) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Remove every record of the given type. Used before inserting rebuilt
    /// sqlite records so a repomd never accumulates duplicates.
    pub fn remove_type(&mut self, mdtype: &str) {
        self.records.retain(|r| r.mdtype != mdtype);
    }

    pub fn get(&self, mdtype: &str) -> Option<&RepomdRecord> {
        self.records.iter().find(|r| r.mdtype == mdtype)
    }

    /// Types that appear more than once (invariant: none do).
    pub fn duplicate_types(&self) -> Vec<String> {
        let mut seen = std::collections::BTreeMap::new();
        for record in &self.records {
            *seen.entry(record.mdtype.clone()).or_insert(0usize) += 1;
        }
        seen.into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(t, _)| t)
            .collect()
    }

    /// Basenames of every file the index references.
    pub fn referenced_basenames(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| {
                r.location_href
                    .rsplit('/')
                    .next()
                    .unwrap_or(&r.location_href)
                    .to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(mdtype: &str, href: &str) -> RepomdRecord {
        RepomdRecord {
            mdtype: mdtype.to_string(),
            checksum: "c".repeat(64),
            open_checksum: Some("o".repeat(64)),
            location_href: format!("repodata/{href}"),
            timestamp: 1700000000,
            size: 123,
            open_size: Some(456),
            database_version: None,
        }
    }

    #[test]
    fn round_trips_through_parse() {
        let mut repomd = Repomd {
            revision: 1700000000,
            records: Vec::new(),
        };
        repomd.upsert(record("primary", "abc-primary.xml.gz"));
        repomd.upsert(record("filelists", "def-filelists.xml.gz"));
        let once = repomd.to_xml().unwrap();
        let reparsed = Repomd::parse(&once).unwrap();
        assert_eq!(reparsed.revision, repomd.revision);
        assert_eq!(reparsed.records, repomd.records);
        assert_eq!(reparsed.to_xml().unwrap(), once);
    }

    /// Upserting a type replaces the previous record instead of duplicating.
    #[test]
    fn upsert_keeps_one_record_per_type() {
        let mut repomd = Repomd::default();
        repomd.upsert(record("primary_db", "a-primary.sqlite.bz2"));
        repomd.upsert(record("primary_db", "b-primary.sqlite.bz2"));
        assert_eq!(repomd.records.len(), 1);
        assert_eq!(
            repomd.get("primary_db").unwrap().location_href,
            "repodata/b-primary.sqlite.bz2"
        );
        assert!(repomd.duplicate_types().is_empty());
    }

    #[test]
    fn duplicate_types_are_detected() {
        let mut repomd = Repomd::default();
        repomd.records.push(record("other_db", "a"));
        repomd.records.push(record("other_db", "b"));
        assert_eq!(repomd.duplicate_types(), vec!["other_db".to_string()]);
    }

    /// Parses the namespace-qualified form createrepo_c emits.
    #[test]
    fn parses_external_repomd() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
  <revision>1700000001</revision>
  <data type="primary">
    <checksum type="sha256">aaaa</checksum>
    <open-checksum type="sha256">bbbb</open-checksum>
    <location href="repodata/aaaa-primary.xml.gz"/>
    <timestamp>1700000001</timestamp>
    <size>10</size>
    <open-size>20</open-size>
  </data>
  <data type="primary_db">
    <checksum type="sha256">cccc</checksum>
    <location href="repodata/cccc-primary.sqlite.bz2"/>
    <timestamp>1700000001</timestamp>
    <size>30</size>
    <database_version>10</database_version>
  </data>
</repomd>
"#;
        let repomd = Repomd::parse(xml).unwrap();
        assert_eq!(repomd.revision, 1700000001);
        assert_eq!(repomd.records.len(), 2);
        assert_eq!(repomd.get("primary").unwrap().open_size, Some(20));
        assert_eq!(repomd.get("primary_db").unwrap().database_version, Some(10));
        assert_eq!(
            repomd.referenced_basenames(),
            vec!["aaaa-primary.xml.gz", "cccc-primary.sqlite.bz2"]
        );
    }
}
