use std::{
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
#[cfg(test)]
use serde_json::Value as JsonValue;

use crate::{
    driver::DocumentClient,
    error::FaultExt,
    knobs::RECONNECT_BACKOFF,
    metadata::{
        self,
        NodeId,
    },
    oplog::{
        Namespace,
        OpKind,
        OplogRecord,
    },
};

/// Applies one operation to one remote destination. The aggregate
/// dispatcher fans each non-echo operation out to every registered applier
/// in declaration order.
#[async_trait]
pub trait Applier: Send + Sync {
    fn destination_id(&self) -> &NodeId;

    async fn apply(&self, record: &OplogRecord) -> anyhow::Result<()>;
}

/// An [`Applier`] writing to one remote collection, owning its connection.
///
/// On a transient driver fault it sleeps the reconnect backoff, reconnects,
/// and retries exactly once; a second failure is fatal and takes the
/// process down through the supervisor.
pub struct DestinationApplier {
    destination_id: NodeId,
    destination_ns: Namespace,
    client: Arc<dyn DocumentClient>,
    reconnect_backoff: Duration,
}

impl DestinationApplier {
    pub fn new(
        destination_id: NodeId,
        destination_ns: Namespace,
        client: Arc<dyn DocumentClient>,
    ) -> Self {
        Self {
            destination_id,
            destination_ns,
            client,
            reconnect_backoff: *RECONNECT_BACKOFF,
        }
    }

    #[cfg(test)]
    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// The collection this operation lands in: the configured destination,
    /// with a wildcard destination resolving to the source record's
    /// collection name.
    fn resolve_destination(&self, source_ns: &Namespace) -> Namespace {
        if self.destination_ns.is_wildcard() {
            Namespace::new(self.destination_ns.database(), source_ns.collection())
        } else {
            self.destination_ns.clone()
        }
    }

    async fn apply_once(&self, record: &OplogRecord) -> anyhow::Result<()> {
        let ns = self.resolve_destination(&record.ns);
        match record.op {
            OpKind::Insert => {
                let mut document = record.document.clone();
                metadata::acknowledge_destination(&mut document, record.op, &self.destination_id);
                self.client.insert(&ns, document).await
            },
            OpKind::Update => {
                let mut document = record.document.clone();
                metadata::acknowledge_destination(&mut document, record.op, &self.destination_id);
                let predicate = record
                    .predicate
                    .clone()
                    .context("update record without a predicate")?;
                self.client
                    .update(&ns, predicate, document, record.upsert)
                    .await
            },
            OpKind::Delete => self.client.remove(&ns, record.document.clone()).await,
        }
    }
}

#[async_trait]
impl Applier for DestinationApplier {
    fn destination_id(&self) -> &NodeId {
        &self.destination_id
    }

    async fn apply(&self, record: &OplogRecord) -> anyhow::Result<()> {
        let first_attempt = self.apply_once(record).await;
        let Err(err) = first_attempt else {
            return Ok(());
        };
        if !err.is_transient() {
            return Err(err);
        }
        tracing::warn!(
            "Applying {} {} to {} failed ({err:#}); reconnecting in {:?}",
            record.op,
            record.ns,
            self.destination_id,
            self.reconnect_backoff,
        );
        tokio::time::sleep(self.reconnect_backoff).await;
        self.client
            .reconnect()
            .await
            .with_context(|| format!("reconnecting to destination {}", self.destination_id))?;
        self.apply_once(record).await.with_context(|| {
            format!(
                "retry against destination {} also failed; giving up",
                self.destination_id
            )
        })
    }
}
