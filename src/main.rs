//! Catalog Preserver container tool
//!
//! Looks inside local container files without touching the archive.
//!
//! ## Usage
//!
//! ```bash
//! # List the entries of a container
//! catalog-preserver inspect /data/containers/5f0c....warc
//!
//! # Re-verify every block digest (and optionally the whole-file checksum)
//! catalog-preserver verify /data/containers/5f0c....warc --checksum sha1:a9993e...
//! ```

use anyhow::{bail, Context};
use catalog_preserver::container::EntryKind;
use catalog_preserver::digest::{digest_file, Digest, DigestAlgorithm};
use catalog_preserver::{Config, ContainerReader};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "catalog-preserver")]
#[command(about = "Inspect and verify preservation containers")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "CATALOG_PRESERVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every entry of a container
    Inspect {
        /// Container file
        container: PathBuf,
    },
    /// Verify every entry's length and block digest
    Verify {
        /// Container file
        container: PathBuf,

        /// Expected whole-container checksum, as `algorithm:hex`
        #[arg(long)]
        checksum: Option<Digest>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("catalog_preserver=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    match args.command {
        Command::Inspect { container } => inspect(container).await,
        Command::Verify {
            container,
            checksum,
        } => {
            let algorithm = checksum
                .as_ref()
                .map(|c| c.algorithm)
                .unwrap_or(config.container_checksum_algorithm);
            verify(container, algorithm, checksum).await
        }
    }
}

async fn inspect(path: PathBuf) -> anyhow::Result<()> {
    let mut reader = ContainerReader::open(&path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;

    println!("{:<9} {:<36} {:>12}  {:<24} {}", "TYPE", "ID", "LENGTH", "CONTENT-TYPE", "REFERS-TO");
    while let Some(header) = reader.next_header().await? {
        let refers_to = header
            .refers_to
            .map(|id| id.to_string())
            .or_else(|| header.filename.clone())
            .unwrap_or_default();
        println!(
            "{:<9} {:<36} {:>12}  {:<24} {}",
            header.kind.as_str(),
            header.id,
            header.content_length,
            header.content_type,
            refers_to
        );
    }
    info!(path = %path.display(), entries = reader.entries_read(), "Inspected container");
    Ok(())
}

async fn verify(
    path: PathBuf,
    algorithm: DigestAlgorithm,
    expected: Option<Digest>,
) -> anyhow::Result<()> {
    let mut reader = ContainerReader::open(&path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;

    let checks = reader.check_all().await?;
    let mut damaged = 0;
    let mut pairs = 0;
    for check in &checks {
        if check.header.kind == EntryKind::Metadata {
            pairs += 1;
        }
        if !check.is_intact() {
            damaged += 1;
            warn!(
                entry = %check.header.id,
                kind = %check.header.kind,
                expected_length = check.header.content_length,
                actual_length = check.actual_length,
                expected = %check.header.block_digest,
                computed = %check.computed_digest,
                "Entry does not match its header"
            );
        }
    }

    let checksum = digest_file(&path, algorithm).await?;
    println!("{}  {}", checksum, path.display());
    println!("{} entries, {} record pairs, {} damaged", checks.len(), pairs, damaged);

    if damaged > 0 {
        bail!("{} of {} entries are damaged", damaged, checks.len());
    }
    if let Some(expected) = expected {
        if !checksum.matches(&expected) {
            bail!(
                "Container checksum {} does not match the expected {}",
                checksum.value,
                expected.value
            );
        }
    }
    Ok(())
}
