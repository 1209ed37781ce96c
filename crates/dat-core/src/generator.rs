//! Embedding generator capability.

use async_trait::async_trait;

use crate::connector::{Checkable, Connector};
use crate::protocol::{ConnectorSpecification, DatMessage};

/// Enriches record envelopes with vectors.
///
/// Non-record envelopes must come back unchanged. A generator may return
/// more than one envelope per input (e.g. when it re-splits a chunk).
#[async_trait]
pub trait Generator: Connector + Checkable {
    async fn generate(
        &self,
        config: &ConnectorSpecification,
        message: DatMessage,
    ) -> anyhow::Result<Vec<DatMessage>>;

    /// Enrich several envelopes at once, preserving order.
    ///
    /// The default calls [`generate`](Generator::generate) per envelope;
    /// backends with a batch endpoint should override it.
    async fn generate_batch(
        &self,
        config: &ConnectorSpecification,
        messages: Vec<DatMessage>,
    ) -> anyhow::Result<Vec<DatMessage>> {
        let mut out = Vec::with_capacity(messages.len());
        for message in messages {
            out.extend(self.generate(config, message).await?);
        }
        Ok(out)
    }
}
