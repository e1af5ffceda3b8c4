//! `config`: read and edit the dot-key configuration file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use color_eyre::eyre::{Result, bail};
use colored::Colorize as _;

use crate::config::{Config, Scope, known_key, parse_value};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// List every key in the selected file.
    #[arg(long)]
    pub list: bool,

    /// Remove a key.
    #[arg(long, value_name = "KEY")]
    pub unset: Option<String>,

    /// Check the file for unknown keys and bad value types.
    #[arg(long)]
    pub validate: bool,

    /// Operate on an explicit file.
    #[arg(long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Operate on ~/.repoforge.conf.
    #[arg(long)]
    pub global: bool,

    /// Operate on ./repoforge.conf (the default).
    #[arg(long)]
    pub local: bool,

    /// Operate on /etc/repoforge.conf.
    #[arg(long)]
    pub system: bool,

    /// Key to read or set.
    pub key: Option<String>,

    /// Value to set the key to.
    pub value: Option<String>,
}

impl ConfigArgs {
    fn scope(&self) -> Result<Scope> {
        let scopes = [self.file.is_some(), self.global, self.local, self.system];
        if scopes.iter().filter(|s| **s).count() > 1 {
            bail!("choose at most one of --file, --global, --local, --system");
        }
        Ok(match &self.file {
            Some(path) => Scope::File(path.clone()),
            None if self.global => Scope::Global,
            None if self.system => Scope::System,
            None => Scope::Local,
        })
    }
}

pub fn run(args: &ConfigArgs) -> Result<ExitCode> {
    let scope = args.scope()?;
    let mut config = Config::open_scope(&scope)?;

    if args.list {
        for (key, value) in config.entries() {
            println!("{key}={value}");
        }
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(key) = &args.unset {
        if !config.unset(key) {
            bail!("{key} is not set");
        }
        config.save()?;
        return Ok(ExitCode::SUCCESS);
    }
    if args.validate {
        let problems = config.problems();
        if problems.is_empty() {
            println!("{} configuration is valid", "ok".green().bold());
            return Ok(ExitCode::SUCCESS);
        }
        for problem in &problems {
            println!("{} {problem}", "issue".red().bold());
        }
        return Ok(ExitCode::FAILURE);
    }
    match (&args.key, &args.value) {
        (Some(key), Some(value)) => {
            if !known_key(key) {
                eprintln!("{} {key} is not a recognized key", "warning:".yellow().bold());
            }
            config.set(key, parse_value(value));
            config.save()?;
            Ok(ExitCode::SUCCESS)
        }
        (Some(key), None) => match config.get(key) {
            Some(value) => {
                println!("{value}");
                Ok(ExitCode::SUCCESS)
            }
            None => bail!("{key} is not set"),
        },
        (None, _) => bail!("nothing to do; try --list, --validate, or KEY [VALUE]"),
    }
}
