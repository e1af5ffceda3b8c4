//! External metadata generator.
//!
//! Primary/filelists/other XML for new packages is produced by `createrepo_c`
//! over a local staging directory; the engine consumes its output. The trait
//! exists so tests can substitute a stub that writes documents directly.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

pub trait Generator {
    /// Generate `repodata/` for the packages in `package_dir`, writing under
    /// `output_dir`.
    fn generate(&self, package_dir: &Path, output_dir: &Path) -> Result<()>;
}

/// Production generator shelling out to `createrepo_c`.
#[derive(Debug, Clone)]
pub struct Createrepo {
    program: String,
}

impl Default for Createrepo {
    fn default() -> Self {
        Self {
            program: "createrepo_c".to_string(),
        }
    }
}

impl Createrepo {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Generator for Createrepo {
    fn generate(&self, package_dir: &Path, output_dir: &Path) -> Result<()> {
        // The sqlite mirrors are built by the engine from the merged XML, so
        // the generator itself runs without them.
        let output = Command::new(&self.program)
            .arg("--no-database")
            .arg("--outputdir")
            .arg(output_dir)
            .arg(package_dir)
            .output()
            .map_err(|e| Error::ToolFailure {
                tool: self.program.clone(),
                detail: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::ToolFailure {
                tool: self.program.clone(),
                detail: format!(
                    "exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        debug!(
            package_dir = %package_dir.display(),
            output_dir = %output_dir.display(),
            "generated metadata"
        );
        Ok(())
    }
}
