//! `remove`: run the retirement protocol.

use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::Result;
use colored::Colorize as _;
use tracing::instrument;

use super::{Cli, MutationFlags};
use crate::Family;
use crate::config::{self, Config};
use crate::engine::{EngineOptions, RemoveReport, deb::DebRepo, rpm::RpmRepo};
use crate::generate::Createrepo;

#[derive(Args, Debug)]
pub struct RemoveArgs {
    #[command(flatten)]
    pub flags: MutationFlags,

    /// Distribution to remove from (Debian family).
    #[arg(long, short, default_value = "stable")]
    pub distribution: String,

    /// Component to remove from (Debian family).
    #[arg(long, short, default_value = "main")]
    pub component: String,

    /// Architecture of the index to remove from (Debian family).
    #[arg(long, short, default_value = "amd64")]
    pub architecture: String,

    /// Package filenames (basenames, not paths) to retire.
    #[arg(required = true, value_name = "FILENAME")]
    pub packages: Vec<String>,
}

#[instrument(skip_all)]
pub async fn run(family: Family, cli: &Cli, args: &RemoveArgs) -> Result<ExitCode> {
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
    let prompt = format!(
        "Remove {} package(s) and their storage objects?",
        args.packages.len()
    );
    if !super::confirm(&prompt, args.flags.yes, confirm_default)? {
        eprintln!("aborted");
        return Ok(ExitCode::SUCCESS);
    }

    let report = match family {
        Family::Rpm => {
            let generator = Createrepo::default();
            let engine = RpmRepo::new(&backend, &generator, cache_dir, options);
            engine.remove(&args.packages).await?
        }
        Family::Deb => {
            let engine = DebRepo::new(&backend, cache_dir, options);
            engine
                .remove(
                    &args.packages,
                    &args.distribution,
                    &args.component,
                    &args.architecture,
                )
                .await?
        }
    };
    print_report(&report);
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &RemoveReport) {
    for name in &report.removed {
        println!("{} {name}", "removed".green().bold());
    }
    for name in &report.not_present {
        eprintln!("{} {name} was not in the repository", "warning:".yellow().bold());
    }
    for prefix in &report.legacy_backups {
        eprintln!(
            "{} stale backup at {prefix}; inspect and remove it manually",
            "warning:".yellow().bold()
        );
    }
    println!(
        "{} {} ({} removed)",
        "published".green().bold(),
        report.repo,
        report.removed.len()
    );
}
