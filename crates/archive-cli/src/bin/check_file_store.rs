//! Blob-store fsck (spec §4.B): reports (and optionally deletes) blob
//! files the store no longer references, and any referenced hash missing
//! from disk.

use std::path::PathBuf;

use archive_store::{BlobStore, Store};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "check-file-store", about = "Checks the blob store for orphaned or missing files")]
struct Args {
    #[arg(long)]
    store: PathBuf,

    #[arg(long)]
    blobs: PathBuf,

    /// Delete blob files no snapshot references.
    #[arg(long)]
    delete_extras: bool,

    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    archive_cli::init_logging(&args.log);

    let store = Store::open(&args.store)?;
    let blobs = BlobStore::open(&args.blobs)?;
    let report = blobs.check_consistency(&store, args.delete_extras).await?;

    println!("missing files (referenced, not on disk): {}", report.missing_files.len());
    for hash in &report.missing_files {
        println!("  {}", hex::encode(hash));
    }
    println!("extra files (on disk, not referenced): {}", report.extra_files.len());
    for hash in &report.extra_files {
        println!("  {}", hex::encode(hash));
    }

    if !report.missing_files.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}
