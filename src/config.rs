use anyhow::{Context, Result};
use clap::Parser;
use std::{collections::HashSet, env, path::PathBuf, str::FromStr};

use crate::backends::BackendKind;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub workers: usize,
    pub allowed_actors: Vec<String>,
    pub storage: StorageSettings,
}

/// Immutable settings consumed by the storage core.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Reject DataFiles registered without a checksum.
    pub require_checksums: bool,
    /// Reject DataFiles registered without a size.
    pub require_sizes: bool,
    pub compute_md5: bool,
    pub compute_sha512: bool,
    /// Root used when the default box has to be created.
    pub default_storage_dir: PathBuf,
    /// Root used when the receiving box has to be created.
    pub receiving_dir: PathBuf,
    /// Files up to this size may be stored inside the inode and report zero
    /// blocks while online.
    pub max_inode_file_size: u64,
    /// Backends whose native checksum hook is trusted instead of streaming.
    pub backend_checksums: HashSet<BackendKind>,
    /// Checksum read size, in multiples of the largest digest block size.
    pub checksum_chunk_blocks: usize,
    /// Bytes read from the head of a file to trigger an HSM recall.
    pub recall_read_bytes: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            require_checksums: true,
            require_sizes: true,
            compute_md5: true,
            compute_sha512: false,
            default_storage_dir: PathBuf::from("./data/store"),
            receiving_dir: PathBuf::from("./data/receiving"),
            max_inode_file_size: 384,
            backend_checksums: HashSet::new(),
            checksum_chunk_blocks: 1024,
            recall_read_bytes: 512,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "MyTardis DataFile storage service")]
pub struct Args {
    /// Host to bind to (overrides MYTARDIS_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MYTARDIS_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides MYTARDIS_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Root for the default storage box (overrides MYTARDIS_STORE_DEFAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Root for the receiving box (overrides MYTARDIS_STORE_RECEIVING_DIR)
    #[arg(long)]
    pub receiving_dir: Option<PathBuf>,

    /// Number of background task workers (overrides MYTARDIS_STORE_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run due auto-archive work once and exit
    #[arg(long)]
    pub archive_sweep: bool,
}

/// What the binary was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    ArchiveSweep,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();

        let storage = StorageSettings {
            require_checksums: env_parse("MYTARDIS_STORE_REQUIRE_CHECKSUMS", true)?,
            require_sizes: env_parse("MYTARDIS_STORE_REQUIRE_SIZES", true)?,
            compute_md5: env_parse("MYTARDIS_STORE_COMPUTE_MD5", true)?,
            compute_sha512: env_parse("MYTARDIS_STORE_COMPUTE_SHA512", false)?,
            default_storage_dir: args.storage_dir.unwrap_or_else(|| {
                env_string("MYTARDIS_STORE_DEFAULT_STORAGE_DIR", "./data/store").into()
            }),
            receiving_dir: args.receiving_dir.unwrap_or_else(|| {
                env_string("MYTARDIS_STORE_RECEIVING_DIR", "./data/receiving").into()
            }),
            max_inode_file_size: env_parse("MYTARDIS_STORE_MAX_INODE_FILE_SIZE", 384)?,
            backend_checksums: parse_backend_list(&env_string(
                "MYTARDIS_STORE_BACKEND_CHECKSUMS",
                "",
            ))?,
            checksum_chunk_blocks: env_parse("MYTARDIS_STORE_CHECKSUM_CHUNK_BLOCKS", 1024)?,
            recall_read_bytes: env_parse("MYTARDIS_STORE_RECALL_READ_BYTES", 512)?,
        };

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| env_string("MYTARDIS_STORE_HOST", "0.0.0.0")),
            port: match args.port {
                Some(port) => port,
                None => env_parse("MYTARDIS_STORE_PORT", 3000)?,
            },
            database_url: args.database_url.unwrap_or_else(|| {
                env_string("MYTARDIS_STORE_DATABASE_URL", "sqlite://./data/meta/store.db")
            }),
            workers: match args.workers {
                Some(workers) => workers,
                None => env_parse("MYTARDIS_STORE_WORKERS", 4)?,
            },
            allowed_actors: split_list(&env_string("MYTARDIS_STORE_ALLOWED_ACTORS", "")),
            storage,
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.archive_sweep {
            RunMode::ArchiveSweep
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_backend_list(value: &str) -> Result<HashSet<BackendKind>> {
    split_list(value)
        .iter()
        .map(|id| {
            BackendKind::from_identifier(id)
                .with_context(|| format!("unknown backend `{}` in MYTARDIS_STORE_BACKEND_CHECKSUMS", id))
        })
        .collect()
}
