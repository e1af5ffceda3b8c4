use std::process::ExitCode;

use colored::Colorize as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

use repoforge::Family;

#[tokio::main]
async fn main() -> ExitCode {
    color_eyre::install().expect("could not install error reporting");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tokio::select! {
        code = repoforge::cli::run(Family::Deb) => code,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "interrupted".red().bold());
            ExitCode::from(130)
        }
    }
}
