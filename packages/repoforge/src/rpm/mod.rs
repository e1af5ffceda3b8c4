//! RPM repository metadata documents: the repomd index, the three
//! package-entry XML documents, and their sqlite mirrors.

pub mod repomd;
pub mod sqlite;
pub mod xml;

pub use repomd::{Repomd, RepomdRecord};
pub use xml::{PackageDocument, PackageEntry};

/// Default namespace of primary.xml.
pub const XML_NS_COMMON: &str = "http://linux.duke.edu/metadata/common";
/// Default namespace of filelists.xml.
pub const XML_NS_FILELISTS: &str = "http://linux.duke.edu/metadata/filelists";
/// Default namespace of other.xml.
pub const XML_NS_OTHER: &str = "http://linux.duke.edu/metadata/other";
/// Default namespace of repomd.xml.
pub const XML_NS_REPO: &str = "http://linux.duke.edu/metadata/repo";
/// The `rpm:` namespace used in primary.xml and repomd.xml.
pub const XML_NS_RPM: &str = "http://linux.duke.edu/metadata/rpm";

pub const MD_PRIMARY: &str = "primary";
pub const MD_FILELISTS: &str = "filelists";
pub const MD_OTHER: &str = "other";
pub const MD_PRIMARY_DB: &str = "primary_db";
pub const MD_FILELISTS_DB: &str = "filelists_db";
pub const MD_OTHER_DB: &str = "other_db";

/// Every record type a committed repomd carries, in canonical order.
pub const MD_ALL: &[&str] = &[
    MD_PRIMARY,
    MD_FILELISTS,
    MD_OTHER,
    MD_PRIMARY_DB,
    MD_FILELISTS_DB,
    MD_OTHER_DB,
];

/// The three package-entry documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocKind {
    Primary,
    Filelists,
    Other,
}

impl DocKind {
    pub const ALL: [DocKind; 3] = [DocKind::Primary, DocKind::Filelists, DocKind::Other];

    pub fn root_tag(&self) -> &'static str {
        match self {
            DocKind::Primary => "metadata",
            DocKind::Filelists => "filelists",
            DocKind::Other => "otherdata",
        }
    }

    pub fn namespace(&self) -> &'static str {
        match self {
            DocKind::Primary => XML_NS_COMMON,
            DocKind::Filelists => XML_NS_FILELISTS,
            DocKind::Other => XML_NS_OTHER,
        }
    }

    pub fn mdtype(&self) -> &'static str {
        match self {
            DocKind::Primary => MD_PRIMARY,
            DocKind::Filelists => MD_FILELISTS,
            DocKind::Other => MD_OTHER,
        }
    }

    pub fn db_mdtype(&self) -> &'static str {
        match self {
            DocKind::Primary => MD_PRIMARY_DB,
            DocKind::Filelists => MD_FILELISTS_DB,
            DocKind::Other => MD_OTHER_DB,
        }
    }

    /// Base filename of the stored gzip document, before content addressing.
    pub fn base_filename(&self) -> &'static str {
        match self {
            DocKind::Primary => "primary.xml.gz",
            DocKind::Filelists => "filelists.xml.gz",
            DocKind::Other => "other.xml.gz",
        }
    }

    /// Base filename of the uncompressed sqlite mirror.
    pub fn sqlite_filename(&self) -> &'static str {
        match self {
            DocKind::Primary => "primary.sqlite",
            DocKind::Filelists => "filelists.sqlite",
            DocKind::Other => "other.sqlite",
        }
    }

    /// Base filename of the stored (bzip2) sqlite mirror.
    pub fn sqlite_bz2_filename(&self) -> &'static str {
        match self {
            DocKind::Primary => "primary.sqlite.bz2",
            DocKind::Filelists => "filelists.sqlite.bz2",
            DocKind::Other => "other.sqlite.bz2",
        }
    }
}
