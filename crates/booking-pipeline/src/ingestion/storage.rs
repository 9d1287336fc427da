//! Object store access for the raw dataset.
//!
//! [`GcsBlobStore`] talks to the Google Cloud Storage JSON API;
//! [`LocalBlobStore`] serves objects from a directory tree and is used for
//! offline runs and tests.

use reqwest::StatusCode;
use reqwest::blocking::Client;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Environment variable holding an OAuth2 bearer token.
pub const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
/// Environment variable overriding the API endpoint (emulators).
pub const EMULATOR_HOST_ENV: &str = "STORAGE_EMULATOR_HOST";

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object gs://{bucket}/{object} not found")]
    NotFound { bucket: String, object: String },

    #[error("request for gs://{bucket}/{object} failed with status {status}")]
    Status {
        bucket: String,
        object: String,
        status: u16,
    },

    #[error("invalid storage endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("HTTP transfer failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read-only access to named objects in named buckets.
pub trait BlobStore: Send + Sync {
    /// Copies `bucket/object` to `dest`, replacing any existing file.
    fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<(), StorageError>;

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Fills a temporary file next to `dest` and renames it into place only
/// when `fill` succeeds; on failure `dest` keeps its previous content.
fn write_atomically<F>(dest: &Path, fill: F) -> Result<(), StorageError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), StorageError>,
{
    let dir = match dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    staged.persist(dest).map_err(|e| e.error)?;
    Ok(())
}

// =============================================================================
// Google Cloud Storage
// =============================================================================

pub struct GcsBlobStore {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl GcsBlobStore {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, StorageError> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Builds a store from `STORAGE_EMULATOR_HOST` and
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, defaulting to the public endpoint.
    pub fn from_env() -> Result<Self, StorageError> {
        let endpoint = std::env::var(EMULATOR_HOST_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let token = std::env::var(ACCESS_TOKEN_ENV).ok().filter(|v| !v.is_empty());
        Self::new(endpoint, token)
    }

    /// `{endpoint}/storage/v1/b/{bucket}/o/{object}?alt=media`, with the
    /// object name percent-encoded as a single path segment.
    pub fn media_url(&self, bucket: &str, object: &str) -> Result<reqwest::Url, StorageError> {
        let mut url = reqwest::Url::parse(&self.endpoint)
            .map_err(|_| StorageError::InvalidEndpoint(self.endpoint.clone()))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(["storage", "v1", "b", bucket, "o", object]);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url)
    }
}

impl BlobStore for GcsBlobStore {
    fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<(), StorageError> {
        let url = self.media_url(bucket, object)?;
        debug!("GET {}", url);

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request.send()?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                return Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                });
            }
            status if !status.is_success() => {
                return Err(StorageError::Status {
                    bucket: bucket.to_string(),
                    object: object.to_string(),
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        write_atomically(dest, |writer| {
            response.copy_to(writer)?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("gcs ({})", self.endpoint)
    }
}

// =============================================================================
// Local directory
// =============================================================================

/// Objects stored as `<root>/<bucket>/<object>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, bucket: &str, object: &str) -> PathBuf {
        self.root.join(bucket).join(object)
    }
}

impl BlobStore for LocalBlobStore {
    fn download(&self, bucket: &str, object: &str, dest: &Path) -> Result<(), StorageError> {
        let source = self.object_path(bucket, object);
        if !source.is_file() {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                object: object.to_string(),
            });
        }
        let mut reader = File::open(&source)?;
        write_atomically(dest, |writer| {
            io::copy(&mut reader, writer)?;
            Ok(())
        })
    }

    fn describe(&self) -> String {
        format!("local ({})", self.root.display())
    }
}

static_assertions::assert_impl_all!(GcsBlobStore: Send, Sync);
static_assertions::assert_impl_all!(LocalBlobStore: Send, Sync);
