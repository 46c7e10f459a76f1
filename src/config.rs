use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

use crate::constants::{
    DEFAULT_PRESIGNED_LINK_EXPIRATION_SECS, EXPAND_DIR_MAX_ITEM_COUNT, MULTIPART_UPLOADS_MIN_TOTAL_SIZE,
};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub log_level: String,
    pub object_store: ObjectStoreMode,
    pub s3: S3Settings,
    pub storage: StorageSettings,
    pub migrate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreMode {
    S3,
    /// In-process store, for local development.
    Memory,
}

impl FromStr for ObjectStoreMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "s3" => Ok(ObjectStoreMode::S3),
            "memory" => Ok(ObjectStoreMode::Memory),
            other => bail!("unknown object store mode `{other}` (expected `s3` or `memory`)"),
        }
    }
}

/// Connection settings of the S3 client.
#[derive(Clone)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub retry_attempts: u32,
    pub attempt_timeout: Duration,
}

// credentials never reach the logs
impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "***");
        f.debug_struct("S3Settings")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("access_key", &redact(&self.access_key))
            .field("secret_key", &redact(&self.secret_key))
            .field("retry_attempts", &self.retry_attempts)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

/// Settings handed to the data managers and the cleaner.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub bucket: String,
    /// Lifetime of presigned links and of pending uploads.
    pub presigned_link_expiration: Duration,
    pub expand_dir_max_item_count: usize,
    /// Declared sizes at or above this get multipart upload links.
    pub multipart_min_total_size: u64,
    /// `None` disables the background cleaner.
    pub cleaner_interval: Option<Duration>,
    pub cleaner_probe_timeout: Duration,
    /// Lease duration of the cleaner leader lock.
    pub cleaner_lease: Duration,
    pub datcore_adapter_url: Option<String>,
    pub datcore_timeout: Duration,
}

impl StorageSettings {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            presigned_link_expiration: Duration::from_secs(DEFAULT_PRESIGNED_LINK_EXPIRATION_SECS),
            expand_dir_max_item_count: EXPAND_DIR_MAX_ITEM_COUNT,
            multipart_min_total_size: MULTIPART_UPLOADS_MIN_TOTAL_SIZE,
            cleaner_interval: Some(Duration::from_secs(30)),
            cleaner_probe_timeout: Duration::from_secs(10),
            cleaner_lease: Duration::from_secs(120),
            datcore_adapter_url: None,
            datcore_timeout: Duration::from_secs(30),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Data storage manager for simcore.s3 and datcore locations")]
pub struct Args {
    /// Host to bind to (overrides STORAGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORAGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides STORAGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Default log filter when RUST_LOG is unset (overrides STORAGE_LOG_LEVEL)
    #[arg(long)]
    pub log_level: Option<String>,

    /// `s3` or `memory` (overrides STORAGE_OBJECT_STORE)
    #[arg(long)]
    pub object_store: Option<String>,

    /// S3 endpoint, e.g. a MinIO URL (overrides STORAGE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 region (overrides STORAGE_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Bucket holding simcore.s3 files (overrides STORAGE_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Presigned link lifetime in seconds (overrides STORAGE_PRESIGNED_LINK_EXPIRATION_SECS)
    #[arg(long)]
    pub presigned_link_expiration_secs: Option<u64>,

    /// Seconds between cleaner passes, 0 disables it (overrides STORAGE_CLEANER_INTERVAL_SECS)
    #[arg(long)]
    pub cleaner_interval_secs: Option<u64>,

    /// Datcore adapter base URL (overrides STORAGE_DATCORE_ADAPTER_URL)
    #[arg(long)]
    pub datcore_adapter_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_port = env_parse("STORAGE_PORT", 8080u16)?;
        let env_object_store: ObjectStoreMode = env_parse("STORAGE_OBJECT_STORE", ObjectStoreMode::S3)?;
        let env_expiration = env_parse(
            "STORAGE_PRESIGNED_LINK_EXPIRATION_SECS",
            DEFAULT_PRESIGNED_LINK_EXPIRATION_SECS,
        )?;
        let env_cleaner_interval = env_parse("STORAGE_CLEANER_INTERVAL_SECS", 30u64)?;

        let object_store = match args.object_store {
            Some(mode) => mode.parse()?,
            None => env_object_store,
        };
        let cleaner_interval_secs = args.cleaner_interval_secs.unwrap_or(env_cleaner_interval);

        let s3 = S3Settings {
            endpoint: args.s3_endpoint.or_else(|| env_string("STORAGE_S3_ENDPOINT")),
            region: args
                .s3_region
                .or_else(|| env_string("STORAGE_S3_REGION"))
                .unwrap_or_else(|| "us-east-1".into()),
            access_key: env_string("STORAGE_S3_ACCESS_KEY"),
            secret_key: env_string("STORAGE_S3_SECRET_KEY"),
            retry_attempts: env_parse("STORAGE_S3_RETRY_ATTEMPTS", 3u32)?,
            attempt_timeout: Duration::from_secs(env_parse("STORAGE_S3_ATTEMPT_TIMEOUT_SECS", 30u64)?),
        };

        let mut storage = StorageSettings::new(
            args.s3_bucket
                .or_else(|| env_string("STORAGE_S3_BUCKET"))
                .unwrap_or_else(|| "simcore".into()),
        );
        storage.presigned_link_expiration =
            Duration::from_secs(args.presigned_link_expiration_secs.unwrap_or(env_expiration));
        storage.expand_dir_max_item_count =
            env_parse("STORAGE_EXPAND_DIR_MAX_ITEM_COUNT", EXPAND_DIR_MAX_ITEM_COUNT)?;
        storage.multipart_min_total_size =
            env_parse("STORAGE_MULTIPART_MIN_TOTAL_SIZE", MULTIPART_UPLOADS_MIN_TOTAL_SIZE)?;
        storage.cleaner_interval =
            (cleaner_interval_secs > 0).then(|| Duration::from_secs(cleaner_interval_secs));
        storage.cleaner_probe_timeout =
            Duration::from_secs(env_parse("STORAGE_CLEANER_PROBE_TIMEOUT_SECS", 10u64)?);
        storage.datcore_adapter_url = args
            .datcore_adapter_url
            .or_else(|| env_string("STORAGE_DATCORE_ADAPTER_URL"));

        // --- Merge ---
        Ok(Self {
            host: args
                .host
                .or_else(|| env_string("STORAGE_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            database_url: args
                .database_url
                .or_else(|| env_string("STORAGE_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/storage.db".into()),
            log_level: args
                .log_level
                .or_else(|| env_string("STORAGE_LOG_LEVEL"))
                .unwrap_or_else(|| "info".into()),
            object_store,
            s3,
            storage,
            migrate: args.migrate,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arguments_override_defaults() {
        let args = Args::parse_from([
            "storage-dsm",
            "--port",
            "9000",
            "--object-store",
            "memory",
            "--s3-bucket",
            "test-bucket",
            "--cleaner-interval-secs",
            "0",
            "--migrate",
        ]);
        let cfg = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.object_store, ObjectStoreMode::Memory);
        assert_eq!(cfg.storage.bucket, "test-bucket");
        assert_eq!(cfg.storage.cleaner_interval, None);
        assert!(cfg.migrate);
        assert_eq!(cfg.addr(), format!("{}:9000", cfg.host));
    }

    #[test]
    fn debug_output_hides_s3_credentials() {
        let s3 = S3Settings {
            endpoint: Some("http://minio:9000".into()),
            region: "us-east-1".into(),
            access_key: Some("storage-user".into()),
            secret_key: Some("hunter2-secret".into()),
            retry_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
        };
        let mut cfg = AppConfig::from_args(Args::parse_from(["storage-dsm"])).unwrap();
        cfg.s3 = s3;

        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2-secret"));
        assert!(!dbg.contains("storage-user"));
        assert!(dbg.contains(r#"secret_key: Some("***")"#));
        assert!(dbg.contains("http://minio:9000"));
    }

    #[test]
    fn unknown_object_store_mode_is_rejected() {
        let args = Args::parse_from(["storage-dsm", "--object-store", "ftp"]);
        assert!(AppConfig::from_args(args).is_err());
    }
}
