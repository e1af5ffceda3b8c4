//! Debian repository metadata: per-(distribution, component, architecture)
//! Packages indexes and the per-distribution Release file.

pub mod packages_index;
pub mod release;

pub use packages_index::{PackagesIndex, Stanza};
pub use release::ReleaseFile;

/// Metadata prefix of one distribution.
pub fn dists_prefix(distribution: &str) -> String {
    format!("dists/{distribution}")
}

/// Path of a Packages file relative to `dists/<distribution>/`.
pub fn packages_rel_path(component: &str, architecture: &str) -> String {
    format!("{component}/binary-{architecture}/Packages")
}
