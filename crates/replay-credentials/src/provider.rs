use crate::DbCredentials;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Where the master-user credentials come from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<DbCredentials>;
}

/// Fixed credentials supplied in the run configuration.
pub struct StaticSource {
    credentials: DbCredentials,
}

impl StaticSource {
    pub fn new(credentials: DbCredentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl CredentialSource for StaticSource {
    async fn fetch(&self) -> Result<DbCredentials> {
        Ok(self.credentials.clone())
    }
}

/// Credentials produced by an external helper command.
///
/// The command must print a JSON object with `username` and `password` fields
/// on stdout. This is how site-specific token services (IAM, Vault, a vendor
/// CLI) plug in without this crate depending on any of them.
pub struct CommandSource {
    program: String,
    args: Vec<String>,
}

impl CommandSource {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl CredentialSource for CommandSource {
    async fn fetch(&self) -> Result<DbCredentials> {
        debug!("Fetching credentials via {}", self.program);
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .with_context(|| format!("failed to run credential command {}", self.program))?;

        if !output.status.success() {
            anyhow::bail!(
                "credential command {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let credentials: DbCredentials = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("credential command {} produced invalid JSON", self.program))?;
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_returns_configured_credentials() {
        let source = StaticSource::new(DbCredentials::new("master", "secret"));
        let creds = source.fetch().await.unwrap();
        assert_eq!(creds.username, "master");
        assert_eq!(creds.password, "secret");
    }

    #[tokio::test]
    async fn test_command_source_parses_json_stdout() {
        let source = CommandSource::new(
            "echo",
            vec![r#"{"username":"master","password":"secret"}"#.to_string()],
        );
        let creds = source.fetch().await.unwrap();
        assert_eq!(creds.username, "master");
        assert_eq!(creds.password, "secret");
    }

    #[tokio::test]
    async fn test_command_source_rejects_failing_command() {
        let source = CommandSource::new("false", vec![]);
        assert!(source.fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_command_source_rejects_invalid_json() {
        let source = CommandSource::new("echo", vec!["not json".to_string()]);
        assert!(source.fetch().await.is_err());
    }
}
