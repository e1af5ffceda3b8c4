//! `add`: run the ingestion protocol.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::{Context as _, Result};
use colored::Colorize as _;
use tracing::instrument;

use super::{Cli, MutationFlags};
use crate::Family;
use crate::config::{self, Config};
use crate::engine::{AddReport, EngineOptions, deb::DebRepo, rpm::RpmRepo};
use crate::generate::Createrepo;
use crate::inspect;

#[derive(Args, Debug)]
pub struct AddArgs {
    #[command(flatten)]
    pub flags: MutationFlags,

    /// Distribution to publish into (Debian family).
    #[arg(long, short, default_value = "stable")]
    pub distribution: String,

    /// Component to publish into (Debian family).
    #[arg(long, short, default_value = "main")]
    pub component: String,

    /// Package files to publish.
    #[arg(required = true, value_name = "PACKAGE")]
    pub packages: Vec<PathBuf>,
}

#[instrument(skip_all)]
pub async fn run(family: Family, cli: &Cli, args: &AddArgs) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let overrides = cli.overrides();
    let backend = config::resolve_backend(&config, family, &overrides).await?;
    let cache_dir = config::resolve_cache_dir(&config, family, &overrides);
    let options = EngineOptions {
        validate: !args.flags.no_validate && config.lookup_bool(family, "validation.enabled", true),
        backup: config.lookup_bool(family, "behavior.backup", true),
    };
    super::print_backend(&backend);

    let confirm_default = config.lookup_bool(family, "behavior.confirm", true);
    let prompt = format!("Publish {} package(s)?", args.packages.len());
    if !super::confirm(&prompt, args.flags.yes, confirm_default)? {
        eprintln!("aborted");
        return Ok(ExitCode::SUCCESS);
    }

    let report = match family {
        Family::Rpm => {
            let packages = args
                .packages
                .iter()
                .map(|path| inspect::inspect_rpm(path))
                .collect::<crate::error::Result<Vec<_>>>()
                .context("inspect packages")?;
            let generator = Createrepo::default();
            let engine = RpmRepo::new(&backend, &generator, cache_dir, options);
            engine.add(&packages).await?
        }
        Family::Deb => {
            let packages = args
                .packages
                .iter()
                .map(|path| inspect::inspect_deb(path))
                .collect::<crate::error::Result<Vec<_>>>()
                .context("inspect packages")?;
            let engine = DebRepo::new(&backend, cache_dir, options);
            engine
                .add(&packages, &args.distribution, &args.component)
                .await?
        }
    };
    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &AddReport) {
    for name in &report.added {
        println!("{} {name}", "added".green().bold());
    }
    for name in &report.updated {
        println!("{} {name}", "updated".yellow().bold());
    }
    for name in &report.duplicates {
        println!("{} {name}", "unchanged".dimmed());
    }
    for prefix in &report.legacy_backups {
        eprintln!(
            "{} stale backup at {prefix}; inspect and remove it manually",
            "warning:".yellow().bold()
        );
    }
    println!(
        "{} {} ({} added, {} updated, {} unchanged)",
        "published".green().bold(),
        report.repo,
        report.added.len(),
        report.updated.len(),
        report.duplicates.len()
    );
}
