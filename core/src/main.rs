//! `todo-batch`: run a command batch or a bulk task mutation from the shell.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use todo_batch::config::{AppConfig, CliArgs};
use todo_batch::{
    BatchResult, BulkAction, BulkRequest, BulkResult, Engine, TodoClient, UreqTransport,
};

#[derive(Parser, Debug)]
#[command(version, about = "Batch and bulk mutations against the todo service")]
struct Cli {
    #[command(flatten)]
    args: CliArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a JSON array of commands as one batch.
    Batch {
        /// File holding the commands (`-` for stdin).
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Apply one mutation to many tasks.
    Bulk {
        #[arg(short, long)]
        action: BulkAction,

        /// Comma-separated task ids.
        #[arg(short, long, value_delimiter = ',', required = true)]
        ids: Vec<String>,

        /// JSON object with the fields to set.
        #[arg(long)]
        fields: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(base_url = %config.base_url, "starting todo-batch");

    let mut client = TodoClient::new(&config.base_url);
    if let Some(token) = &config.token {
        client = client.with_token(token);
    }
    let engine = Engine::new(client, UreqTransport::new(config.request_timeout), config.engine);

    match cli.command {
        Command::Batch { file } => run_batch(&engine, &file).await,
        Command::Bulk {
            action,
            ids,
            fields,
        } => run_bulk(&engine, action, ids, fields.as_deref()).await,
    }
}

async fn run_batch(engine: &Engine<UreqTransport>, file: &Path) -> ExitCode {
    let started = tokio::time::Instant::now();
    let commands = match read_json(file) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("Error reading {}: {e}", file.display());
            return ExitCode::FAILURE;
        }
    };
    match engine.execute_batch_json(&commands).await {
        Ok(result) => print(&result),
        Err(e) => {
            tracing::error!(error = %e, "batch rejected");
            print(&BatchResult::rejected(&e, started.elapsed()));
            ExitCode::FAILURE
        }
    }
}

async fn run_bulk(
    engine: &Engine<UreqTransport>,
    action: BulkAction,
    ids: Vec<String>,
    fields: Option<&str>,
) -> ExitCode {
    let started = tokio::time::Instant::now();
    let fields = match fields.map(serde_json::from_str::<Map<String, Value>>).transpose() {
        Ok(f) => f.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error parsing --fields: {e}");
            return ExitCode::FAILURE;
        }
    };
    let request = BulkRequest {
        action,
        task_ids: ids,
        fields,
    };
    match engine.execute_bulk(&request).await {
        Ok(result) => print(&result),
        Err(e) => {
            tracing::error!(error = %e, "bulk request failed");
            print(&BulkResult::rejected(&e, started.elapsed()));
            ExitCode::FAILURE
        }
    }
}

fn read_json(file: &Path) -> Result<Value, Box<dyn std::error::Error>> {
    let contents = if file.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(file)?
    };
    Ok(serde_json::from_str(&contents)?)
}

fn print<T: Serialize>(result: &T) -> ExitCode {
    match serde_json::to_string_pretty(result) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error serializing result: {e}");
            ExitCode::FAILURE
        }
    }
}
