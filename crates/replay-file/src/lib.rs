//! Storage access for workload-replay.
//!
//! Captured workloads are read from, and run artifacts written to, either the
//! local filesystem or an S3 prefix. [`Location`] abstracts over the two so the
//! loader and the error exporter never branch on the scheme themselves.
//!
//! A location is detected from its string form: anything starting with
//! `s3://` is an object-storage location, everything else is a local path.

mod local;
mod s3;

use anyhow::{Context, Result};
use std::path::PathBuf;

pub use s3::S3Client;

/// A file or prefix on local disk or in object storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    S3 { bucket: String, key: String },
}

impl Location {
    /// Parse a location string, auto-detecting the scheme.
    pub fn parse(uri: &str) -> Result<Self> {
        if uri.starts_with("s3://") {
            let (bucket, key) = parse_s3_uri(uri)?;
            Ok(Location::S3 { bucket, key })
        } else {
            Ok(Location::Local(PathBuf::from(uri)))
        }
    }

    pub fn is_s3(&self) -> bool {
        matches!(self, Location::S3 { .. })
    }

    /// Append a path segment, treating this location as a directory/prefix.
    pub fn join(&self, segment: &str) -> Location {
        match self {
            Location::Local(path) => Location::Local(path.join(segment)),
            Location::S3 { bucket, key } => Location::S3 {
                bucket: bucket.clone(),
                key: if key.is_empty() || key.ends_with('/') {
                    format!("{key}{segment}")
                } else {
                    format!("{key}/{segment}")
                },
            },
        }
    }

    /// The final path segment, e.g. the file name of an object key.
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Location::Local(path) => path.file_name().and_then(|n| n.to_str()),
            Location::S3 { key, .. } => key.rsplit('/').next().filter(|n| !n.is_empty()),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            Location::Local(path) => path.display().to_string(),
            Location::S3 { bucket, key } => format!("s3://{bucket}/{key}"),
        }
    }

    /// Read the whole location into a string.
    pub async fn read_to_string(&self) -> Result<String> {
        match self {
            Location::Local(path) => local::read_to_string(path).await,
            Location::S3 { bucket, key } => {
                let client = S3Client::new().await?;
                client.read_to_string(bucket, key).await
            }
        }
    }

    /// List files directly under this location (non-recursive).
    pub async fn list(&self) -> Result<Vec<Location>> {
        match self {
            Location::Local(path) => local::list_directory(path).await,
            Location::S3 { bucket, key } => {
                let client = S3Client::new().await?;
                let prefix = if key.is_empty() || key.ends_with('/') {
                    key.clone()
                } else {
                    format!("{key}/")
                };
                client.list_prefix(bucket, &prefix).await
            }
        }
    }

    /// Write `body` to this location, creating parent directories locally.
    pub async fn write(&self, body: &[u8]) -> Result<()> {
        match self {
            Location::Local(path) => local::write(path, body).await,
            Location::S3 { bucket, key } => {
                let client = S3Client::new().await?;
                client.put(bucket, key, body.to_vec()).await
            }
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// Parse an S3 URI of the form `s3://bucket/key/to/object` (key may be empty).
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let rest = uri
        .strip_prefix("s3://")
        .context("S3 URI must start with 's3://'")?;

    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() => Ok((bucket.to_string(), key.to_string())),
        None if !rest.is_empty() => Ok((rest.to_string(), String::new())),
        _ => anyhow::bail!("S3 URI must be in format 's3://bucket[/key]'"),
    }
}
