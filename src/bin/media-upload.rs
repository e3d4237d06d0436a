use anyhow::{Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use media_ingest::{
    client::{
        Payload, Uploader,
        state::{SharedTracker, UploadPhase},
        transport::HttpUploadClient,
    },
    config::UploadPolicy,
};

const MIB: u64 = 1024 * 1024;

/// Upload one media file to a media-ingest server.
#[derive(Parser, Debug)]
#[command(author, version, about = "Upload a media file through the media-ingest API")]
struct Args {
    /// Base URL of the upload service
    #[arg(long, env = "MEDIA_UPLOAD_SERVER", default_value = "http://127.0.0.1:3000")]
    server: String,

    /// Bearer token identifying the uploader
    #[arg(long, env = "MEDIA_UPLOAD_TOKEN")]
    token: String,

    /// File to upload
    #[arg(long)]
    file: PathBuf,

    /// MIME type of the file
    #[arg(long, default_value = "video/webm")]
    content_type: String,

    /// Concurrent part transfers
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Largest payload, in MiB, sent as a single request
    #[arg(long, default_value_t = 25)]
    threshold_mib: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let payload = Payload::from_file(&args.file)
        .await
        .with_context(|| format!("opening {}", args.file.display()))?;
    let policy = UploadPolicy::default()
        .with_workers(args.workers)
        .with_threshold(args.threshold_mib * MIB);
    let client = Arc::new(HttpUploadClient::new(&args.server, &args.token));
    let uploader = Uploader::new(client.clone(), client, policy);

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, cancelling upload");
            on_ctrl_c.cancel();
        }
    });

    let tracker = SharedTracker::with_listener(|t| {
        if t.phase() == UploadPhase::Uploading {
            tracing::info!(
                completed_parts = t.completed_parts(),
                total_parts = t.total_parts(),
                percent = t.progress_percent(),
                "uploading"
            );
        }
    });

    let outcome = uploader
        .upload(&payload, &args.content_type, &cancel, &tracker)
        .await
        .with_context(|| format!("uploading {}", args.file.display()))?;

    println!(
        "{} {} ({:?})",
        outcome.catalog_entry_id, outcome.object_key, outcome.strategy
    );
    Ok(())
}
