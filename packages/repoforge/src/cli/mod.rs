//! Shared command-line surface for the two per-family binaries. The flag
//! shape is identical; only the family descriptor differs.

pub mod add;
pub mod config_cmd;
pub mod remove;
pub mod validate;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use colored::Colorize as _;

use crate::Family;

/// Manage package repositories on S3 or a local mirror.
#[derive(Parser, Debug)]
#[command(max_term_width = 100)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// S3 bucket to publish to.
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Credential profile to use.
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// S3 endpoint URL override (S3-compatible stores).
    #[arg(long, global = true, value_name = "URL")]
    pub endpoint_url: Option<String>,

    /// Local staging directory root.
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Publish packages to the repository.
    Add(add::AddArgs),
    /// Retire packages from the repository.
    #[command(visible_alias = "rm")]
    Remove(remove::RemoveArgs),
    /// Run full validation against a repository.
    Validate(validate::ValidateArgs),
    /// Read or edit configuration.
    Config(config_cmd::ConfigArgs),
}

/// Flags shared by the mutating subcommands.
#[derive(Args, Debug, Clone)]
pub struct MutationFlags {
    /// Skip the interactive confirmation.
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Skip quick validation before commit.
    #[arg(long)]
    pub no_validate: bool,
}

pub async fn run(family: Family) -> ExitCode {
    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Add(args) => add::run(family, &cli, args).await,
        Command::Remove(args) => remove::run(family, &cli, args).await,
        Command::Validate(args) => validate::run(family, &cli, args).await,
        Command::Config(args) => config_cmd::run(args),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            if let Some(crate::Error::IntegrityViolation(issues)) =
                e.downcast_ref::<crate::Error>()
            {
                for issue in issues {
                    eprintln!("{} {issue}", "issue".red().bold());
                }
            }
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

impl Cli {
    pub(crate) fn overrides(&self) -> crate::config::Overrides {
        crate::config::Overrides {
            bucket: self.bucket.clone(),
            profile: self.profile.clone(),
            endpoint: self.endpoint_url.clone(),
            cache_dir: self.cache_dir.clone(),
        }
    }
}

/// Print the resolved backend so the operator sees where writes land.
pub(crate) fn print_backend(backend: &crate::storage::Backend) {
    for (label, value) in backend.describe() {
        eprintln!("{} {}", format!("{label}:").dimmed(), value);
    }
}

/// Ask for confirmation unless suppressed by flag or configuration.
pub(crate) fn confirm(prompt: &str, yes: bool, config_confirm: bool) -> color_eyre::Result<bool> {
    if yes || !config_confirm {
        return Ok(true);
    }
    Ok(inquire::Confirm::new(prompt).with_default(false).prompt()?)
}
