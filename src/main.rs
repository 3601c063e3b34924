use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use shelfsync::cli::args::{Cli, Commands};
use shelfsync::cli::commands;
use shelfsync::config::Config;
use shelfsync::storage::Database;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_env("SHELFSYNC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_database(cli: &Cli) -> Result<Database> {
    let db = match &cli.db {
        Some(path) => Database::open_at(path),
        None => Database::open(),
    };
    db.context("could not open the shelfsync database")
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let format = cli.output;

    if let Commands::Completions { shell } = cli.command {
        print!("{}", commands::completions(shell)?);
        return Ok(());
    }

    let (config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    init_logging(&config);
    if let Some(e) = config_error {
        warn!(error = %e, "Ignoring unreadable config; using defaults");
    }

    let db = open_database(&cli)?;

    let output = match cli.command {
        Commands::Status => commands::status(&db, format)?,
        Commands::List { status, limit } => commands::list(&db, status, limit, format)?,
        Commands::Retry { id, all_failed } => {
            commands::retry(&db, id.as_deref(), all_failed, format)?
        }
        Commands::Dismiss { id } => commands::dismiss(&db, &id, format)?,
        Commands::Recover => commands::recover(&db, format)?,
        Commands::Cursors { reset } => commands::cursors(&db, reset, format)?,
        Commands::Replay { file } => commands::replay(&db, &file, format)
            .with_context(|| format!("replay of {} failed", file.display()))?,
        Commands::Completions { .. } => String::new(),
    };

    if !output.is_empty() {
        println!("{output}");
    }
    Ok(())
}
