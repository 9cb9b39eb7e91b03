mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "sigpatch=debug"
    } else {
        "sigpatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    match cli.command {
        Command::Check { profiles } => commands::check::run(&profiles),
        Command::Simulate {
            profiles,
            version,
            image,
            report,
            output,
        } => commands::simulate::run(commands::simulate::SimulateArgs {
            profiles: &profiles,
            version: version.as_deref(),
            image: &image,
            report: report.as_deref(),
            output: output.as_deref(),
        }),
        Command::Scan {
            image,
            pattern,
            limit,
        } => commands::scan::run(&image, &pattern, limit),
    }
}
