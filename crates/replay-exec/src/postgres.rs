use crate::session::{SessionConnector, SqlSession};
use anyhow::{Context, Result};
use async_trait::async_trait;
use replay_credentials::DbCredentials;
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::debug;

/// Opens native-protocol sessions against the target cluster.
///
/// Captured ODBC sessions are replayed over the same wire; the statement
/// stream is identical either way.
pub struct PostgresConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl PostgresConnector {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

#[async_trait]
impl SessionConnector for PostgresConnector {
    async fn connect(
        &self,
        database: &str,
        credentials: &DbCredentials,
    ) -> Result<Box<dyn SqlSession>> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(database)
            .user(credentials.login_name())
            .password(&credentials.password)
            .application_name("workload-replay")
            .connect_timeout(self.connect_timeout);

        let (client, connection) = config.connect(NoTls).await.with_context(|| {
            format!(
                "failed to connect to {}:{} database {database}",
                self.host, self.port
            )
        })?;

        // The connection future drives the socket; it resolves when the
        // client is dropped.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("connection terminated: {e}");
            }
        });

        Ok(Box::new(PostgresSession { client, driver }))
    }
}

struct PostgresSession {
    client: tokio_postgres::Client,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl SqlSession for PostgresSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(anyhow::Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
