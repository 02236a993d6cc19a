//! S3 backend.

use crate::Location;
use anyhow::{Context, Result};
use aws_config::BehaviorVersion;

/// Shared S3 client.
///
/// Client construction loads the AWS config chain, which is relatively
/// expensive, so callers doing several operations should hold one of these.
pub struct S3Client {
    client: aws_sdk_s3::Client,
}

impl S3Client {
    pub async fn new() -> Result<Self> {
        let sdk_config = aws_config::load_defaults(BehaviorVersion::latest()).await;
        let client = aws_sdk_s3::Client::new(&sdk_config);
        Ok(Self { client })
    }

    /// Read a whole object as UTF-8.
    pub async fn read_to_string(&self, bucket: &str, key: &str) -> Result<String> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to fetch object from S3: s3://{bucket}/{key}"))?;

        let bytes = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read object body: s3://{bucket}/{key}"))?
            .into_bytes();

        String::from_utf8(bytes.to_vec())
            .with_context(|| format!("Object is not valid UTF-8: s3://{bucket}/{key}"))
    }

    /// List objects directly under a prefix (delimiter `/`, so "subdirectory"
    /// entries are not descended into).
    pub async fn list_prefix(&self, bucket: &str, prefix: &str) -> Result<Vec<Location>> {
        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .delimiter("/");

            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .with_context(|| format!("Failed to list S3 prefix: s3://{bucket}/{prefix}"))?;

            if let Some(contents) = response.contents {
                for object in contents {
                    if let Some(key) = object.key {
                        // the prefix itself and directory markers are not files
                        if key == prefix || key.ends_with('/') {
                            continue;
                        }
                        results.push(Location::S3 {
                            bucket: bucket.to_string(),
                            key,
                        });
                    }
                }
            }

            if response.is_truncated == Some(true) {
                continuation_token = response.next_continuation_token;
            } else {
                break;
            }
        }

        results.sort_by_key(|a| a.display_name());

        tracing::debug!(
            "Listed {} objects in S3 prefix: s3://{}/{}",
            results.len(),
            bucket,
            prefix
        );

        Ok(results)
    }

    /// Write an object.
    pub async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .with_context(|| format!("Failed to write object to S3: s3://{bucket}/{key}"))?;
        Ok(())
    }
}

// S3 operations are exercised by integration environments with real or
// emulated credentials; unit coverage lives in the Location tests in lib.rs.
