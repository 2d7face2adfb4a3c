//! Bulwark inspection tool
//!
//! Decodes checkpoint manifests and checks them against a replica's local
//! snapshot and log files.
//!
//! # Usage
//!
//! ```bash
//! # Print a manifest
//! bulwark-inspect manifest checkpoint.bin
//!
//! # Validate every token of a manifest against the configured storage
//! bulwark-inspect --config replica.toml verify checkpoint.bin
//! ```

use anyhow::{bail, Context, Result};
use bulwark_core::DurableStorage;
use bulwark_production::{FileStorage, FileStorageConfig, ReplicaConfig};
use bulwark_types::{CheckpointManifest, StateToken};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Inspect Bulwark checkpoint manifests and local state files.
#[derive(Parser, Debug)]
#[command(name = "bulwark-inspect")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to replica configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (overrides RUST_LOG)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Decode an encoded manifest and print its tokens
    Manifest {
        /// File holding the encoded manifest
        file: PathBuf,
    },
    /// Check every token of a manifest against local storage
    Verify {
        /// File holding the encoded manifest
        file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenState {
    Valid,
    Missing,
    Corrupt,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => ReplicaConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ReplicaConfig::default(),
    };

    match cli.command {
        Command::Manifest { file } => {
            let manifest = read_manifest(&file)?;
            print_manifest(&manifest);
        }
        Command::Verify { file } => {
            let manifest = read_manifest(&file)?;
            verify(&config, &manifest)?;
        }
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<CheckpointManifest> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let manifest = CheckpointManifest::decode(&bytes)
        .with_context(|| format!("{} is not an encoded manifest", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Decoded manifest");
    Ok(manifest)
}

fn print_manifest(manifest: &CheckpointManifest) {
    println!("checkpoint:     {}", manifest.checkpoint_seq());
    println!("snapshot bytes: {}", manifest.snapshot_file_size());
    println!("snapshot tokens ({}):", manifest.snapshot_tokens().len());
    for token in manifest.snapshot_tokens() {
        println!("  {token}  {}", token.digest().to_hex());
    }
    println!("log tokens ({}):", manifest.log_tokens().len());
    for token in manifest.log_tokens() {
        println!("  {token}  {}", token.digest().to_hex());
    }
}

fn check_token(storage: &dyn DurableStorage, token: &StateToken) -> Result<TokenState> {
    let data = storage
        .read_range(token.kind(), &token.file_name(), token.offset(), token.length())
        .with_context(|| format!("Failed to read {token}"))?;
    Ok(match data {
        None => TokenState::Missing,
        Some(data) if token.validate(&data) => TokenState::Valid,
        Some(_) => TokenState::Corrupt,
    })
}

fn verify(config: &ReplicaConfig, manifest: &CheckpointManifest) -> Result<()> {
    let mut storage_config =
        FileStorageConfig::new(&config.storage.snapshot_dir, &config.storage.log_dir);
    storage_config.sync_writes = false;
    let storage = FileStorage::open(storage_config).context("Failed to open storage")?;

    info!(%manifest, "Verifying manifest");
    let mut failures = 0;
    for token in manifest
        .snapshot_tokens()
        .iter()
        .chain(manifest.log_tokens())
    {
        let state = check_token(&storage, token)?;
        let label = match state {
            TokenState::Valid => "ok",
            TokenState::Missing => "MISSING",
            TokenState::Corrupt => "CORRUPT",
        };
        println!("{label:>8}  {token}");
        if state != TokenState::Valid {
            failures += 1;
        }
    }

    if failures > 0 {
        bail!("{failures} token(s) failed verification");
    }
    println!("all tokens valid");
    Ok(())
}
