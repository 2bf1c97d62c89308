use crate::services::{document_service::DocumentServiceConfig, s3_store::S3Settings};
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Which object store holds document bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ObjectBackend {
    /// Sharded directories under `storage_dir`.
    Local,
    /// S3-compatible endpoint (MinIO).
    S3,
}

impl FromStr for ObjectBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" | "minio" => Ok(Self::S3),
            other => bail!("unknown object backend `{}` (expected `local` or `s3`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub object_backend: ObjectBackend,
    pub storage_dir: String,
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,
    pub s3_region: String,
    pub bucket: String,
    pub locator_scheme: String,
    pub operation_timeout_secs: u64,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Document upload service")]
pub struct Args {
    /// Host to bind to (overrides DOCUMENT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOCUMENT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DOCUMENT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object store backend (overrides DOCUMENT_STORE_OBJECT_BACKEND)
    #[arg(long, value_enum)]
    pub object_backend: Option<ObjectBackend>,

    /// Directory for the local backend (overrides DOCUMENT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// S3 endpoint URL (overrides DOCUMENT_STORE_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Bucket holding documents (overrides DOCUMENT_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Initialize schema and bucket, then exit
    #[arg(long)]
    pub init: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and init flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let init = args.init;
        let cfg = Self::merge(args, |name| env::var(name))?;
        Ok((cfg, init))
    }

    /// Merge CLI args over environment lookups over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        let env_port = parse_var::<u16>("DOCUMENT_STORE_PORT", &var("DOCUMENT_STORE_PORT", "3000")?)?;
        let env_backend: ObjectBackend = var("DOCUMENT_STORE_OBJECT_BACKEND", "local")?.parse()?;
        let operation_timeout_secs = parse_var::<u64>(
            "DOCUMENT_STORE_OPERATION_TIMEOUT_SECS",
            &var("DOCUMENT_STORE_OPERATION_TIMEOUT_SECS", "30")?,
        )?;
        let max_upload_bytes = parse_var::<usize>(
            "DOCUMENT_STORE_MAX_UPLOAD_BYTES",
            &var("DOCUMENT_STORE_MAX_UPLOAD_BYTES", "26214400")?,
        )?;
        if operation_timeout_secs == 0 {
            bail!("DOCUMENT_STORE_OPERATION_TIMEOUT_SECS must be greater than zero");
        }

        Ok(Self {
            host: args
                .host
                .map_or_else(|| var("DOCUMENT_STORE_HOST", "0.0.0.0"), Ok)?,
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.map_or_else(
                || {
                    var(
                        "DOCUMENT_STORE_DATABASE_URL",
                        "sqlite://./data/meta/documents.db",
                    )
                },
                Ok,
            )?,
            object_backend: args.object_backend.unwrap_or(env_backend),
            storage_dir: args
                .storage_dir
                .map_or_else(|| var("DOCUMENT_STORE_STORAGE_DIR", "./data/objects"), Ok)?,
            s3_endpoint: args
                .s3_endpoint
                .map_or_else(|| var("DOCUMENT_STORE_S3_ENDPOINT", "http://minio:9000"), Ok)?,
            s3_access_key: var("DOCUMENT_STORE_S3_ACCESS_KEY", "minioadmin")?,
            s3_secret_key: var("DOCUMENT_STORE_S3_SECRET_KEY", "minioadmin")?,
            s3_region: var("DOCUMENT_STORE_S3_REGION", "us-east-1")?,
            bucket: args
                .bucket
                .map_or_else(|| var("DOCUMENT_STORE_BUCKET", "pdfs"), Ok)?,
            locator_scheme: var("DOCUMENT_STORE_LOCATOR_SCHEME", "minio")?,
            operation_timeout_secs,
            max_upload_bytes,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn document_service(&self) -> DocumentServiceConfig {
        DocumentServiceConfig {
            bucket: self.bucket.clone(),
            region: self.s3_region.clone(),
            locator_scheme: self.locator_scheme.clone(),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    pub fn s3_settings(&self) -> S3Settings {
        S3Settings {
            endpoint_url: self.s3_endpoint.clone(),
            region: self.s3_region.clone(),
            access_key_id: self.s3_access_key.clone(),
            secret_access_key: self.s3_secret_key.clone(),
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse::<T>()
        .with_context(|| format!("parsing {} value `{}`", name, value))
}
