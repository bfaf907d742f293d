#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use patlab_storage::submissions::default_db_path;
use patlab_tools::migrate_cli::{
    execute_export_command, execute_migrate_command, execute_setup_command, open_connection,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Experiment database maintenance")]
struct Cli {
    /// SQLite file holding the experiment table. Defaults to ~/.patlab/experiment.db.
    #[arg(long, env = "PATLAB_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the experiment table if it is missing.
    Setup {
        /// Create the first-deployment layout (no prolific_id/debrief_data).
        #[arg(long)]
        legacy: bool,
    },
    /// Rebuild the experiment table into the current schema, keeping a timestamped backup.
    Migrate,
    /// Print every stored submission as one JSON object per line.
    Export,
}

fn main() {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(2);
        }
    }
}

fn run() -> Result<i32, String> {
    let cli = Cli::parse();
    let db_path = cli
        .db
        .unwrap_or_else(|| default_db_path(std::env::var("HOME").ok()));
    info!(db = %db_path.display(), "opening experiment database");
    let mut conn = open_connection(&db_path)?;

    let output = match cli.command {
        Command::Setup { legacy } => execute_setup_command(&conn, legacy)?,
        Command::Migrate => execute_migrate_command(&mut conn)?,
        Command::Export => execute_export_command(conn)?,
    };
    if !output.text.is_empty() {
        println!("{}", output.text);
    }
    Ok(output.exit_code)
}
