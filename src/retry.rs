//! Bounded retry for destination writes.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dat_core::error::is_transient;
use dat_core::loader::{Loader, MetadataFilter};
use dat_core::protocol::{DatCatalog, DatDocumentMessage};

/// Ceiling for a single backoff delay.
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// How many times to retry and how long to wait in between.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at [`BACKOFF_MAX_MS`].
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
    }

    /// Run `op` until it succeeds, fails non-transiently, or retries run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && is_transient(&e) => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    tracing::warn!(
                        op = label,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient loader failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A [`Loader`] that retries transient failures of its inner loader.
pub struct RetryingLoader<L: ?Sized> {
    inner: Arc<L>,
    policy: RetryPolicy,
}

impl<L: Loader + ?Sized> RetryingLoader<L> {
    pub fn new(inner: Arc<L>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<L: Loader + ?Sized> Loader for RetryingLoader<L> {
    async fn load(
        &self,
        records: &[DatDocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> anyhow::Result<()> {
        self.policy
            .run("load", move || self.inner.load(records, namespace, stream))
            .await
    }

    async fn delete(&self, filter: &Value, namespace: &str) -> anyhow::Result<()> {
        self.policy
            .run("delete", move || self.inner.delete(filter, namespace))
            .await
    }

    async fn check(&self) -> anyhow::Result<(bool, Option<String>)> {
        self.inner.check().await
    }

    async fn initiate_sync(&self, catalog: &DatCatalog) -> anyhow::Result<()> {
        self.policy
            .run("initiate_sync", move || self.inner.initiate_sync(catalog))
            .await
    }

    fn prepare_metadata_filter(&self, filter: &MetadataFilter) -> Value {
        self.inner.prepare_metadata_filter(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dat_core::loader::memory::InMemoryLoader;
    use dat_core::protocol::{Data, DatDocumentStream, StreamMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str) -> DatDocumentMessage {
        let metadata = StreamMetadata {
            dat_record_id: Some(id.into()),
            ..Default::default()
        };
        DatDocumentMessage::new(DatDocumentStream::new("docs"), Data::new(id, metadata))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 500);
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(10), Duration::from_millis(BACKOFF_MAX_MS));
        assert_eq!(policy.backoff(200), Duration::from_millis(BACKOFF_MAX_MS));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let inner = Arc::new(InMemoryLoader::new());
        inner.fail_next_loads(2);
        let loader = RetryingLoader::new(inner.clone(), RetryPolicy::new(3, 1));

        loader.load(&[record("a")], "", "docs").await.unwrap();
        assert_eq!(inner.stored_ids(), vec!["a"]);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let inner = Arc::new(InMemoryLoader::new());
        inner.fail_next_loads(5);
        let loader = RetryingLoader::new(inner.clone(), RetryPolicy::new(2, 1));

        let err = loader.load(&[record("a")], "", "docs").await.unwrap_err();
        assert!(is_transient(&err));
        assert!(inner.stored_ids().is_empty());
    }

    struct Broken {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Loader for Broken {
        async fn load(&self, _: &[DatDocumentMessage], _: &str, _: &str) -> anyhow::Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("disk full")
        }
        async fn delete(&self, _: &Value, _: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn check(&self) -> anyhow::Result<(bool, Option<String>)> {
            Ok((true, None))
        }
        async fn initiate_sync(&self, _: &DatCatalog) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let inner = Arc::new(Broken {
            attempts: AtomicUsize::new(0),
        });
        let loader: RetryingLoader<dyn Loader> =
            RetryingLoader::new(inner.clone() as Arc<dyn Loader>, RetryPolicy::new(5, 1));

        assert!(loader.load(&[record("a")], "", "docs").await.is_err());
        assert_eq!(inner.attempts.load(Ordering::SeqCst), 1);
    }
}
