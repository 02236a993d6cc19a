//! Local filesystem backend.

use crate::Location;
use anyhow::{Context, Result};
use std::path::Path;

pub async fn read_to_string(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file: {}", path.display()))
}

/// List the files directly under `path` (subdirectories are skipped).
pub async fn list_directory(path: &Path) -> Result<Vec<Location>> {
    let mut results = Vec::new();

    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("Failed to read directory: {}", path.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        let metadata = entry
            .metadata()
            .await
            .with_context(|| format!("Failed to get metadata for: {}", entry_path.display()))?;

        if metadata.is_file() {
            results.push(Location::Local(entry_path));
        }
    }

    // deterministic ordering for callers and tests
    results.sort_by_key(|a| a.display_name());

    tracing::debug!(
        "Listed {} files in directory: {}",
        results.len(),
        path.display()
    );

    Ok(results)
}

pub async fn write(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("Failed to write file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_and_write_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("errors/dev-alice-7.txt");

        write(&path, b"connection refused").await.unwrap();
        let contents = read_to_string(&path).await.unwrap();
        assert_eq!(contents, "connection refused");
    }

    #[tokio::test]
    async fn test_list_directory_skips_subdirs() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("a.sql"), "select 1").unwrap();
        std::fs::write(temp_dir.path().join("b.sql"), "select 2").unwrap();
        std::fs::create_dir(temp_dir.path().join("nested")).unwrap();
        std::fs::write(temp_dir.path().join("nested/c.sql"), "select 3").unwrap();

        let results = list_directory(temp_dir.path()).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn test_list_directory_missing() {
        assert!(list_directory(Path::new("/nonexistent/workload")).await.is_err());
    }
}
