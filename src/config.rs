use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::client::retry::RetryPolicy;

const MIB: u64 = 1024 * 1024;

/// Secret used for both signing and JWT validation in `--dev` mode.
const DEV_SECRET: &str = "media-ingest-dev-secret";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL baked into capability URLs handed to clients.
    pub public_url: String,
    pub signing_secret: String,
    pub jwt_secret: String,
    pub part_url_ttl: Duration,
    pub read_url_ttl: Duration,
    pub session_ttl: Duration,
    pub reap_interval: Duration,
    pub policy: UploadPolicy,
}

/// What the process should do after configuration is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    IssueToken(String),
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Media ingest service: resumable multipart uploads into object storage")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides MEDIA_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL used in signed URLs (overrides MEDIA_INGEST_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Use built-in development secrets when none are configured
    #[arg(long)]
    pub dev: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Print a bearer token for the given owner id and exit
    #[arg(long, value_name = "OWNER_ID")]
    pub issue_token: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("MEDIA_INGEST_PORT", 3000u16)?;
        let env_storage =
            env::var("MEDIA_INGEST_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("MEDIA_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/media_ingest.db".into());

        let port = args.port.unwrap_or(env_port);
        let public_url = args
            .public_url
            .or_else(|| env::var("MEDIA_INGEST_PUBLIC_URL").ok())
            .unwrap_or_else(|| format!("http://127.0.0.1:{}", port));

        let signing_secret = secret("MEDIA_INGEST_SIGNING_SECRET", args.dev)?;
        let jwt_secret = secret("MEDIA_INGEST_JWT_SECRET", args.dev)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url,
            signing_secret,
            jwt_secret,
            part_url_ttl: Duration::from_secs(env_parse("MEDIA_INGEST_PART_URL_TTL", 3600u64)?),
            read_url_ttl: Duration::from_secs(env_parse("MEDIA_INGEST_READ_URL_TTL", 900u64)?),
            session_ttl: Duration::from_secs(env_parse("MEDIA_INGEST_SESSION_TTL", 86_400u64)?),
            reap_interval: Duration::from_secs(env_parse("MEDIA_INGEST_REAP_INTERVAL", 300u64)?),
            policy: UploadPolicy::default(),
        };

        let mode = if let Some(owner) = args.issue_token {
            Mode::IssueToken(owner)
        } else if args.migrate {
            Mode::Migrate
        } else {
            Mode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    /// Development defaults; never read the environment.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/media_ingest.db".into(),
            public_url: "http://127.0.0.1:3000".into(),
            signing_secret: DEV_SECRET.into(),
            jwt_secret: DEV_SECRET.into(),
            part_url_ttl: Duration::from_secs(3600),
            read_url_ttl: Duration::from_secs(900),
            session_ttl: Duration::from_secs(86_400),
            reap_interval: Duration::from_secs(300),
            policy: UploadPolicy::default(),
        }
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn secret(name: &str, dev: bool) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ if dev => Ok(DEV_SECRET.into()),
        _ => bail!("{} must be set (or pass --dev)", name),
    }
}

/// One step of the chunk-size step function: payloads up to `up_to` bytes
/// use parts of `chunk_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkTier {
    pub up_to: u64,
    pub chunk_size: u64,
}

/// The single source of truth for how payloads are split and transferred.
///
/// Used by the upload client to plan parts and by the server to validate
/// content types and part numbers.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    /// Payloads of at most this many bytes are uploaded in one shot.
    pub single_shot_threshold: u64,
    /// Ascending tiers; sizes above the last tier use `largest_chunk`.
    pub tiers: Vec<ChunkTier>,
    pub largest_chunk: u64,
    /// Store-imposed minimum size of every part but the last.
    pub min_part_size: u64,
    /// Store-imposed maximum number of parts per object.
    pub max_parts: u64,
    /// Size of the client worker pool.
    pub workers: usize,
    pub retry: RetryPolicy,
    pub accepted_content_types: Vec<String>,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            single_shot_threshold: 25 * MIB,
            tiers: vec![
                ChunkTier {
                    up_to: 25 * MIB,
                    chunk_size: 10 * MIB,
                },
                ChunkTier {
                    up_to: 500 * MIB,
                    chunk_size: 25 * MIB,
                },
            ],
            largest_chunk: 50 * MIB,
            min_part_size: 5 * MIB,
            max_parts: 10_000,
            workers: 5,
            retry: RetryPolicy::default(),
            accepted_content_types: vec!["video/webm".into(), "video/mp4".into()],
        }
    }
}

impl UploadPolicy {
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.single_shot_threshold = threshold;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_tiers(mut self, tiers: Vec<ChunkTier>, largest_chunk: u64) -> Self {
        self.tiers = tiers;
        self.largest_chunk = largest_chunk;
        self
    }

    pub fn with_min_part_size(mut self, min_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self
    }

    pub fn with_max_parts(mut self, max_parts: u64) -> Self {
        self.max_parts = max_parts.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Exact, case-insensitive match on the MIME essence (parameters such as
    /// `;codecs=vp9` are ignored).
    pub fn accepts(&self, content_type: &str) -> bool {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        self.accepted_content_types
            .iter()
            .any(|accepted| accepted.eq_ignore_ascii_case(essence))
    }

    /// File extension used for object keys of an accepted content type.
    pub fn extension_for(content_type: &str) -> &'static str {
        let essence = content_type.split(';').next().unwrap_or("").trim();
        if essence.eq_ignore_ascii_case("video/mp4") {
            "mp4"
        } else if essence.eq_ignore_ascii_case("video/webm") {
            "webm"
        } else {
            "bin"
        }
    }
}
