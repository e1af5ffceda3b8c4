//! `validate`: run full validation and report every issue.

use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::{Result, bail};
use colored::Colorize as _;
use tracing::instrument;

use super::Cli;
use crate::Family;
use crate::config::{self, Config};
use crate::engine::validate;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// RPM family: the repository path (e.g. `el9/x86_64`).
    /// Debian family: `DISTRIBUTION COMPONENT ARCHITECTURE`.
    #[arg(required = true, value_name = "REPO_PATH")]
    pub repo_path: Vec<String>,
}

#[instrument(skip_all)]
pub async fn run(family: Family, cli: &Cli, args: &ValidateArgs) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let overrides = cli.overrides();
    let backend = config::resolve_backend(&config, family, &overrides).await?;
    super::print_backend(&backend);

    let issues = match family {
        Family::Rpm => {
            let [repo] = args.repo_path.as_slice() else {
                bail!("expected one repository path, e.g. `validate el9/x86_64`");
            };
            validate::full_rpm(&backend, repo).await?
        }
        Family::Deb => {
            let [distribution, component, architecture] = args.repo_path.as_slice() else {
                bail!("expected `validate DISTRIBUTION COMPONENT ARCHITECTURE`");
            };
            validate::full_deb(&backend, distribution, component, architecture).await?
        }
    };

    if issues.is_empty() {
        println!("{} repository is consistent", "ok".green().bold());
        return Ok(ExitCode::SUCCESS);
    }
    for issue in &issues {
        println!("{} {issue}", "issue".red().bold());
    }
    println!("{} issue(s) found", issues.len());
    Ok(ExitCode::FAILURE)
}
