use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use pubdatahub_core::Config;
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod output;

#[derive(Debug, Parser)]
#[command(name = "pubdatahub", version, about = "Ingest public data feeds and query them locally")]
struct Cli {
    /// Path to config.toml (default: <data home>/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect or edit the configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List registered data sources and their ingestion status.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },
    /// Run a download for one source, with live progress. Interrupt to
    /// pause; the ledger resumes the run next time.
    Download {
        source: String,
        #[arg(long, value_name = "N")]
        batch_size: Option<i64>,
        /// Resume a previously paused run (same sweep, ledger intact).
        #[arg(long)]
        resume: bool,
    },
    /// Run SQL against a source's local store.
    Query {
        source: String,
        sql: String,
        /// table, json or csv.
        #[arg(long, default_value = "table")]
        output: String,
        /// Write the result to a file instead of stdout.
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Inspect or control background jobs (talks to a running `serve`).
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Run the HTTP API and job manager until interrupted.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Point storage_root somewhere else and save.
    SetStorage { path: PathBuf },
    /// Check the configuration for contradictions.
    Validate,
}

#[derive(Debug, Subcommand)]
enum SourcesAction {
    List,
    Status { name: String },
}

#[derive(Debug, Subcommand)]
enum JobsAction {
    List,
    Status { id: String },
    Pause { id: String },
    Resume { id: String },
    Stop { id: String },
    Stats,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&config),
            ConfigAction::SetStorage { path } => {
                commands::config::set_storage(config, cli.config.as_deref(), path)
            }
            ConfigAction::Validate => commands::config::validate(&config),
        },
        Command::Sources { action } => match action {
            SourcesAction::List => commands::sources::list(&config).await,
            SourcesAction::Status { name } => commands::sources::status(&config, &name).await,
        },
        Command::Download {
            source,
            batch_size,
            resume,
        } => commands::download::run(config, &source, batch_size, resume).await,
        Command::Query {
            source,
            sql,
            output,
            file,
        } => commands::query::run(&config, &source, &sql, &output, file).await,
        Command::Jobs { action } => match action {
            JobsAction::List => commands::jobs::list(&config).await,
            JobsAction::Status { id } => commands::jobs::status(&config, &id).await,
            JobsAction::Pause { id } => commands::jobs::pause(&config, &id).await,
            JobsAction::Resume { id } => commands::jobs::resume(&config, &id).await,
            JobsAction::Stop { id } => commands::jobs::stop(&config, &id).await,
            JobsAction::Stats => commands::jobs::stats(&config).await,
        },
        Command::Serve { port } => commands::serve::run(config, port).await,
    }
}
