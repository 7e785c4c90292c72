/*!
 * stage CLI - list, inspect, fetch and store stage objects
 *
 * Credentials are read from the environment (AWS_KEY_ID, AWS_SECRET_KEY,
 * AWS_TOKEN, AZURE_SAS_TOKEN, GCS_ACCESS_TOKEN, MEMORY_TOKEN).
 */

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloud_stage::{
    config::LogLevel, logging, ClientConfig, DownloadRequest, ErrorKind, ObjectMetadata,
    StaticSession, StorageClient, StorageError, UploadRequest,
};
use std::path::PathBuf;
use std::sync::Arc;

const EXIT_SUCCESS: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOT_FOUND: i32 = 3;

#[derive(Parser)]
#[command(name = "stage")]
#[command(version, about = "Move files to and from cloud stage storage", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write JSON logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    /// Override the configured retry budget
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List objects under a prefix
    Ls {
        location: String,

        #[arg(default_value = "")]
        prefix: String,
    },

    /// Show object metadata
    Stat { location: String, key: String },

    /// Download an object into a local directory
    Get {
        location: String,
        key: String,

        /// Target directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Local file name (default: last key segment)
        #[arg(short, long)]
        name: Option<String>,

        /// Ranges fetched concurrently
        #[arg(short, long, default_value = "4")]
        parallel: usize,
    },

    /// Upload a local file, or stdin with `-`
    Put {
        source: String,
        location: String,
        key: String,

        #[arg(short, long, default_value = "4")]
        parallel: usize,

        #[arg(long)]
        content_type: Option<String>,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<StorageError>().map(StorageError::kind) {
        Some(ErrorKind::Malformed) => EXIT_USAGE,
        Some(ErrorKind::NotFound) => EXIT_NOT_FOUND,
        _ => EXIT_FATAL,
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if cli.verbose {
        config.logging.verbose = true;
        config.logging.level = LogLevel::Debug;
    }
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    if let Some(max_retries) = cli.max_retries {
        config.retry.max_retries = max_retries;
    }
    logging::init_logging(&config.logging)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(execute(cli.command, config))
}

async fn execute(command: Commands, config: ClientConfig) -> Result<()> {
    let session = Arc::new(StaticSession::from_env(format!("cli-{}", std::process::id())));
    let client = StorageClient::connect(&config, session.credentials(), session.clone()).await?;

    let result = dispatch(&client, command).await;
    client.shutdown().await;
    result
}

async fn dispatch(client: &StorageClient, command: Commands) -> Result<()> {
    match command {
        Commands::Ls { location, prefix } => {
            let listing = client.list_objects(&location, &prefix).await?;
            for summary in &listing {
                let modified = summary
                    .last_modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>12}  {}  {}", summary.size, modified, summary.key);
            }
            println!("{} object(s), {} byte(s)", listing.len(), listing.total_size());
        }

        Commands::Stat { location, key } => {
            let metadata = client.get_object_metadata(&location, &key).await?;
            println!("{}", serde_json::to_string_pretty(&metadata)?);
        }

        Commands::Get {
            location,
            key,
            dir,
            name,
            parallel,
        } => {
            let command = format!("GET {}/{} file://{}", location, key, dir.display());
            let mut request =
                DownloadRequest::new(command, location, key, dir).with_parallelism(parallel);
            if let Some(name) = name {
                request = request.with_dest_file_name(name);
            }
            let path = request.local_path();
            let summary = client.download(request).await?;
            println!(
                "downloaded {} bytes to {} in {} part(s), {} retries",
                summary.bytes,
                path.display(),
                summary.parts,
                summary.retries
            );
        }

        Commands::Put {
            source,
            location,
            key,
            parallel,
            content_type,
        } => {
            let command = format!("PUT file://{} {}/{}", source, location, key);
            let request = if source == "-" {
                UploadRequest::from_stream(command, location, key, Box::new(tokio::io::stdin()))
            } else {
                UploadRequest::from_file(command, location, key, source)
            };
            let mut metadata = ObjectMetadata::new();
            if let Some(content_type) = content_type {
                metadata = metadata.with_content_type(content_type);
            }
            let summary = client
                .upload(request.with_parallelism(parallel).with_metadata(metadata))
                .await?;
            println!(
                "uploaded {} bytes in {} part(s), {} attempt(s)",
                summary.bytes, summary.parts, summary.attempts
            );
        }
    }
    Ok(())
}
