#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::struct_excessive_bools)]

mod commands;
mod logging;

use clap::Parser;
use miette::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "lambay")]
#[command(author, version, about = "A fast node package manager", long_about = None)]
struct Cli {
    /// Increase logging verbosity (-v for DEBUG, -vv for TRACE)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON formatted logs (stable, machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Override the working directory
    #[arg(long, global = true, value_name = "PATH")]
    cwd: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install a package, or every dependency from package.json
    #[command(alias = "i")]
    Install {
        /// Package to install (name or name@spec); omit to install from
        /// package.json
        package: Option<String>,

        /// Include devDependencies
        #[arg(short = 'D', long)]
        dev: bool,

        /// Worker concurrency (0 = auto-tune from CPU count)
        #[arg(short, long, default_value_t = 0)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json);

    let cwd = match cli.cwd {
        Some(path) => path,
        None => std::env::current_dir()
            .map_err(|e| miette::miette!("cannot determine working directory: {e}"))?,
    };

    match cli.command {
        Commands::Install {
            package,
            dev,
            concurrency,
        } => commands::install::run(&cwd, package.as_deref(), dev, concurrency).await,
    }
}
