use crate::{CredentialSource, DbCredentials};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Receiving side of the published credentials. Cheap to clone; one per
/// session.
pub type CredentialsRx = watch::Receiver<Arc<DbCredentials>>;

const INITIAL_FETCH_ATTEMPTS: u32 = 3;

/// Periodically re-fetches credentials and publishes them to all sessions.
///
/// Issued database credentials typically expire (an hour is common), and a
/// long replay outlives them. Refreshing well inside the validity window
/// means a session connecting at any point during the run always sees
/// credentials with plenty of lifetime left. A failed refresh keeps the last
/// good credentials in place; only the initial fetch is fatal.
pub struct CredentialRefresher {
    source: Arc<dyn CredentialSource>,
    interval: Duration,
}

/// Owns the background refresh task. Dropping it (or calling
/// [`RefresherHandle::stop`]) ends the task; the last published credentials
/// remain readable.
pub struct RefresherHandle {
    task: tokio::task::JoinHandle<()>,
}

impl RefresherHandle {
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for RefresherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl CredentialRefresher {
    pub fn new(source: Arc<dyn CredentialSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Fetch the initial credentials (retrying a few times) and start the
    /// background refresh loop.
    pub async fn start(self) -> Result<(CredentialsRx, RefresherHandle)> {
        let initial = self
            .fetch_with_retry()
            .await
            .context("initial credential fetch failed; cannot start replay")?;
        let (tx, rx) = watch::channel(Arc::new(initial));

        let source = self.source;
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            // The first tick fires immediately and we already fetched.
            timer.tick().await;
            loop {
                timer.tick().await;
                match source.fetch().await {
                    Ok(credentials) => {
                        debug!("Refreshed credentials for {}", credentials.username);
                        if tx.send(Arc::new(credentials)).is_err() {
                            // All sessions are gone; nothing left to serve.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Credential refresh failed, keeping previous credentials: {e:#}");
                    }
                }
            }
        });

        Ok((rx, RefresherHandle { task }))
    }

    async fn fetch_with_retry(&self) -> Result<DbCredentials> {
        let mut last_err = None;
        for attempt in 1..=INITIAL_FETCH_ATTEMPTS {
            match self.source.fetch().await {
                Ok(credentials) => return Ok(credentials),
                Err(e) => {
                    warn!("Credential fetch attempt {attempt} failed: {e:#}");
                    last_err = Some(e);
                    if attempt < INITIAL_FETCH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Err(last_err.context("credential source returned no error")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail_after_first: AtomicBool,
    }

    impl CountingSource {
        fn new(fail_after_first: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_after_first: AtomicBool::new(fail_after_first),
            })
        }
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch(&self) -> Result<DbCredentials> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n > 0 && self.fail_after_first.load(Ordering::SeqCst) {
                anyhow::bail!("token service unavailable");
            }
            Ok(DbCredentials::new("master", format!("pw-{n}")))
        }
    }

    struct AlwaysFailing;

    #[async_trait]
    impl CredentialSource for AlwaysFailing {
        async fn fetch(&self) -> Result<DbCredentials> {
            anyhow::bail!("no credentials here")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_initial_and_rotated_credentials() {
        let source = CountingSource::new(false);
        let refresher = CredentialRefresher::new(source.clone(), Duration::from_secs(600));
        let (mut rx, _handle) = refresher.start().await.unwrap();
        assert_eq!(rx.borrow().password, "pw-0");

        tokio::time::advance(Duration::from_secs(601)).await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().password, "pw-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_stale_credentials() {
        let source = CountingSource::new(true);
        let refresher = CredentialRefresher::new(source.clone(), Duration::from_secs(600));
        let (rx, _handle) = refresher.start().await.unwrap();
        assert_eq!(rx.borrow().password, "pw-0");

        // let the spawned refresh task register its interval timer before
        // advancing the paused clock, so the ticks actually fire
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(1801)).await;
        tokio::task::yield_now().await;
        assert!(source.calls.load(Ordering::SeqCst) > 1);
        assert_eq!(rx.borrow().password, "pw-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_fetch_failure_is_fatal() {
        let refresher =
            CredentialRefresher::new(Arc::new(AlwaysFailing), Duration::from_secs(600));
        assert!(refresher.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_refreshing() {
        let source = CountingSource::new(false);
        let refresher = CredentialRefresher::new(source.clone(), Duration::from_secs(600));
        let (_rx, handle) = refresher.start().await.unwrap();
        handle.stop();
        tokio::task::yield_now().await;

        let before = source.calls.load(Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(1800)).await;
        tokio::task::yield_now().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), before);
    }
}
