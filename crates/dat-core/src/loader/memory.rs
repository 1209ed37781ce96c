//! In-memory [`Loader`] for tests.
//!
//! Stores records in a `Vec`, evaluates `$eq`/`$in` filters on delete, and
//! keeps a log of every call so tests can assert on call order and batch
//! contents. It can also be told to fail the next N loads with a transient
//! error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{Loader, MetadataFilter};
use crate::error::DatError;
use crate::protocol::{DatCatalog, DatDocumentMessage};

/// A recorded loader invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum LoaderCall {
    InitiateSync,
    Load {
        namespace: String,
        stream: String,
        ids: Vec<String>,
    },
    Delete {
        namespace: String,
        filter: Value,
    },
}

#[derive(Default)]
struct Inner {
    calls: Vec<LoaderCall>,
    stored: Vec<(String, DatDocumentMessage)>,
}

/// Loader fake that tracks stored record ids.
#[derive(Default)]
pub struct InMemoryLoader {
    inner: Mutex<Inner>,
    failing_loads: AtomicUsize,
}

impl InMemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `load` fail with a transient error.
    pub fn fail_next_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LoaderCall> {
        self.inner.lock().expect("lock poisoned").calls.clone()
    }

    /// Ids passed to each successful `load`, in call order.
    pub fn load_batches(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                LoaderCall::Load { ids, .. } => Some(ids),
                _ => None,
            })
            .collect()
    }

    /// Ids currently stored, in insertion order.
    pub fn stored_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .stored
            .iter()
            .map(|(_, r)| r.record_id())
            .collect()
    }

    pub fn stored(&self) -> Vec<DatDocumentMessage> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .stored
            .iter()
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl Loader for InMemoryLoader {
    async fn load(
        &self,
        records: &[DatDocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> anyhow::Result<()> {
        let remaining = self.failing_loads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_loads.store(remaining - 1, Ordering::SeqCst);
            return Err(DatError::Transient("simulated load failure".into()).into());
        }

        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.calls.push(LoaderCall::Load {
            namespace: namespace.to_string(),
            stream: stream.to_string(),
            ids: records.iter().map(DatDocumentMessage::record_id).collect(),
        });
        inner
            .stored
            .extend(records.iter().map(|r| (namespace.to_string(), r.clone())));
        Ok(())
    }

    async fn delete(&self, filter: &Value, namespace: &str) -> anyhow::Result<()> {
        let parsed = MetadataFilter::from_json(filter)?;
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.calls.push(LoaderCall::Delete {
            namespace: namespace.to_string(),
            filter: filter.clone(),
        });
        inner
            .stored
            .retain(|(ns, r)| !(ns == namespace && parsed.matches(r)));
        Ok(())
    }

    async fn check(&self) -> anyhow::Result<(bool, Option<String>)> {
        Ok((true, None))
    }

    async fn initiate_sync(&self, _catalog: &DatCatalog) -> anyhow::Result<()> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .calls
            .push(LoaderCall::InitiateSync);
        Ok(())
    }
}
