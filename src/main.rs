//! Voyager migration CLI
//!
//! Thin command-line binding over the migrator core. Exit code is 0 on
//! success and 1 on any error, with the error message written to stderr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use voyager::config::DatabaseConfig;
use voyager::migration::{
    AdvisoryLockFactory, DirSource, MigrationError, Migrator, NoEncryption, RegistryRunner,
};

#[derive(Parser)]
#[command(name = "voyager")]
#[command(about = "Schema-migration tool for PostgreSQL-backed services")]
#[command(version)]
struct Cli {
    /// Database connection URL
    #[arg(long)]
    database_url: Option<String>,

    /// Migrations directory path
    #[arg(long, default_value = "migrations")]
    migrations_dir: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending up migrations
    Up,

    /// Migrate to an exact version, upward or downward
    Migrate {
        /// Target version
        target: i64,
    },

    /// Print the current database version
    CurrentVersion,

    /// Print the highest version the migration assets support
    SupportedVersion,

    /// List all parseable migrations
    Migrations,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = DatabaseConfig::load().ok();

    let database_url = match resolve_database_url(cli.database_url, config.as_ref()) {
        Some(url) => url,
        None => {
            eprintln!(
                "Error: database URL not provided. Use --database-url or set \
                 VOYAGER_DATABASE_URL or DATABASE_URL."
            );
            process::exit(1);
        }
    };

    let client = match voyager::connect(&database_url) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error connecting to database: {e}");
            process::exit(1);
        }
    };

    // The advisory lock lives on its own connection so transaction state
    // on the main connection cannot release it
    let lock_client = match voyager::connect(&database_url) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error connecting to database: {e}");
            process::exit(1);
        }
    };

    // lock_timeout_seconds = 0 keeps the spec's blocking acquisition
    let lock_timeout_seconds = config.as_ref().map_or(0, |c| c.lock_timeout_seconds);
    let lock_factory = if lock_timeout_seconds > 0 {
        AdvisoryLockFactory::with_timeout(lock_client, Duration::from_secs(lock_timeout_seconds))
    } else {
        AdvisoryLockFactory::new(lock_client)
    };

    let runner = RegistryRunner::new(client.clone(), Box::new(NoEncryption));
    let migrator = Migrator::new(
        client,
        Box::new(lock_factory),
        Box::new(DirSource::new(&cli.migrations_dir)),
        Box::new(runner),
    );

    let result = match cli.command {
        Commands::Up => migrator.up(),
        Commands::Migrate { target } => migrator.migrate(target),
        Commands::CurrentVersion => handle_current_version(&migrator),
        Commands::SupportedVersion => handle_supported_version(&migrator),
        Commands::Migrations => handle_migrations(&migrator),
    };

    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    }
}

fn resolve_database_url(flag: Option<String>, config: Option<&DatabaseConfig>) -> Option<String> {
    flag.or_else(|| std::env::var("VOYAGER_DATABASE_URL").ok())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .or_else(|| config.map(|c| c.url.clone()))
}

fn handle_current_version(migrator: &Migrator) -> Result<(), MigrationError> {
    let version = migrator.current_version()?;
    println!("{version}");
    Ok(())
}

fn handle_supported_version(migrator: &Migrator) -> Result<(), MigrationError> {
    let version = migrator.supported_version()?;
    println!("{version}");
    Ok(())
}

fn handle_migrations(migrator: &Migrator) -> Result<(), MigrationError> {
    for migration in migrator.migrations()? {
        println!(
            "{:>12}  {:<5}  {:<20}  {}",
            migration.version,
            migration.direction.as_str(),
            migration.strategy.as_str(),
            migration.file_name
        );
    }
    Ok(())
}
