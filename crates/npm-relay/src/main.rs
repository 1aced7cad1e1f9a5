//! npm-relay - talk to upstream npm registries through the relay's uplink client

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use relay_uplink::{FetchOptions, Settled, TarballDownload, Uplink};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use config::Config;

/// npm-relay - uplink client for private npm registries
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/npm-relay.toml")]
    config: String,

    /// Uplink to use (defaults to the first configured one)
    #[arg(short, long, env = "NPM_RELAY_UPLINK")]
    uplink: Option<String>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "NPM_RELAY_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a package document
    View {
        name: String,
        /// ETag of a cached copy
        #[arg(long)]
        etag: Option<String>,
    },
    /// Publish a package document read from a JSON file
    Publish { name: String, document: PathBuf },
    /// Publish one version and point a dist-tag at it
    Tag {
        name: String,
        version: String,
        tag: String,
        document: PathBuf,
    },
    /// Download a tarball by package and file name
    Pull {
        name: String,
        filename: String,
        /// Output file, stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download a tarball by absolute URL
    PullUrl {
        url: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload a tarball file
    Push {
        name: String,
        filename: String,
        file: PathBuf,
    },
    /// Check whether a URL belongs to the uplink
    CanFetch { url: String },
    /// Ping uplinks and show their health, for every uplink unless --uplink is given
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config)?;

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    info!("Starting npm-relay v{}", env!("CARGO_PKG_VERSION"));

    let global = config.global();

    // Status covers every uplink unless one was picked
    if matches!(args.command, Command::Status) && args.uplink.is_none() {
        for (name, uplink_config) in &config.uplinks {
            let uplink = Uplink::new(uplink_config.clone(), &global)
                .with_context(|| format!("Failed to create uplink '{}'", name))?;
            check_status(name, &uplink).await;
        }
        return Ok(());
    }

    // Initialize the selected uplink
    let (name, uplink_config) = config.get_uplink(args.uplink.as_deref())?;
    let uplink = Uplink::new(uplink_config.clone(), &global)
        .with_context(|| format!("Failed to create uplink '{}'", name))?;
    info!("Using uplink {} ({})", name, uplink.base_url());

    match args.command {
        Command::View { name, etag } => {
            let fetched = uplink
                .fetch_package_metadata(&name, FetchOptions { etag, context: None })
                .await?;
            if let Some(etag) = &fetched.etag {
                info!("ETag: {}", etag);
            }
            println!("{}", serde_json::to_string_pretty(&fetched.metadata)?);
        }
        Command::Publish { name, document } => {
            let metadata = read_document(&document)?;
            uplink.publish_package(&name, metadata).await?;
            info!("Published {}", name);
        }
        Command::Tag {
            name,
            version,
            tag,
            document,
        } => {
            let metadata = read_document(&document)?;
            uplink
                .publish_version_tag(&name, &version, metadata, &tag)
                .await?;
            info!("Published {}@{} as {}", name, version, tag);
        }
        Command::Pull {
            name,
            filename,
            output,
        } => {
            let written = save(uplink.fetch_tarball(&name, &filename), output).await?;
            info!("Downloaded {} ({} bytes)", filename, written);
        }
        Command::PullUrl { url, output } => {
            if !uplink.can_fetch(&url) {
                warn!("{} is not served by uplink {}", url, name);
            }
            let written = save(uplink.fetch_url(&url), output).await?;
            info!("Downloaded {} ({} bytes)", url, written);
        }
        Command::Push {
            name,
            filename,
            file,
        } => {
            let source = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("Failed to open {}", file.display()))?;

            let mut upload = uplink.publish_tarball(&name, &filename);
            let copied = match upload.copy_from(source).await {
                Ok(copied) => copied,
                Err(e) => {
                    upload.abort();
                    return Err(e.into());
                }
            };
            upload.done();

            match upload.finish().await {
                Settled::Success => info!("Uploaded {} ({} bytes)", filename, copied),
                Settled::Failed(e) => return Err(e.into()),
                Settled::Aborted => anyhow::bail!("Upload of {} was aborted", filename),
            }
        }
        Command::CanFetch { url } => {
            println!("{}", uplink.can_fetch(&url));
        }
        Command::Status => check_status(name, &uplink).await,
    }

    Ok(())
}

/// Initialize logging
///
/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn read_document(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Ping an uplink, then print what its health tracker recorded
async fn check_status(name: &str, uplink: &Uplink) {
    let answer = match uplink.ping().await {
        Ok(true) => "ok".to_string(),
        Ok(false) => "error status".to_string(),
        Err(e) => e.to_string(),
    };

    let health = uplink.health().snapshot();
    println!(
        "{}\t{}\tproxy={}\talive={}\tsince={}\tping={}",
        name,
        uplink.base_url(),
        uplink.proxy().unwrap_or("-"),
        health.alive,
        health.since.to_rfc3339(),
        answer
    );
}

/// Stream a download to `output`, or stdout
async fn save(mut download: TarballDownload, output: Option<PathBuf>) -> Result<u64> {
    let mut sink: Box<dyn AsyncWrite + Unpin> = match &output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written = 0u64;
    while let Some(chunk) = download.next().await {
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.flush().await?;

    Ok(written)
}
