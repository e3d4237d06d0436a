use anyhow::Result;
use std::{io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use media_ingest::{
    config::{AppConfig, Mode},
    db,
    identity::JwtIdentity,
    state::AppState,
    store::{LocalObjectStore, UrlSigner},
};

/// Validity of tokens printed by `--issue-token`.
const ISSUED_TOKEN_TTL: Duration = Duration::from_secs(12 * 3600);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    if let Mode::IssueToken(owner_id) = &mode {
        let token = JwtIdentity::new(&cfg.jwt_secret).issue(owner_id, ISSUED_TOKEN_TTL)?;
        println!("{}", token);
        return Ok(());
    }

    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        storage_dir = %cfg.storage_dir,
        public_url = %cfg.public_url,
        "Starting media-ingest"
    );

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        std::fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Migrations (idempotent, also run on every start) ---
    db::run_migrations(&db).await?;
    if mode == Mode::Migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Collaborators, injected into the router state ---
    let store = Arc::new(LocalObjectStore::new(
        &cfg.storage_dir,
        UrlSigner::new(&cfg.signing_secret, cfg.public_url.clone()),
    ));
    let identity = Arc::new(JwtIdentity::new(&cfg.jwt_secret));
    let state = AppState::new(db.clone(), store, identity, &cfg);

    // --- Background reaper ---
    let shutdown = CancellationToken::new();
    let reaper = state.reaper(&cfg).spawn(shutdown.clone());

    let app = media_ingest::app(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl+C, shutting down");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    let _ = reaper.await;
    Ok(())
}
