use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use crate::{
    driver::DocumentClient,
    metadata::NodeId,
    oplog::{
        Namespace,
        OplogTimestamp,
    },
};

/// Collection holding one checkpoint document per source node id:
/// `{_id: <source_id>, checkpoint: <oplog_ts>}`.
pub const CHECKPOINT_COLLECTION: &str = "local.mmm";

/// Durably persists the last oplog position dispatched for one source node,
/// in the source database itself, so the replicator is stateless across
/// restarts.
///
/// Persistence is best-effort: losing the most recent save only causes a
/// few operations to be re-dispatched on restart, which the echo-detection
/// protocol makes safe.
pub struct CheckpointStore {
    client: Arc<dyn DocumentClient>,
    source_id: NodeId,
    ns: Namespace,
}

impl CheckpointStore {
    pub fn new(client: Arc<dyn DocumentClient>, source_id: NodeId) -> Self {
        let ns = CHECKPOINT_COLLECTION
            .parse()
            .expect("checkpoint namespace is well formed");
        Self {
            client,
            source_id,
            ns,
        }
    }

    /// The last durable checkpoint for this source, or the "start from now"
    /// sentinel when none exists yet (creating the record as a side
    /// effect).
    pub async fn load(&self) -> anyhow::Result<OplogTimestamp> {
        let predicate = json!({"_id": self.source_id.as_str()});
        let existing = self
            .client
            .find_one(&self.ns, predicate.clone())
            .await
            .context("loading the replication checkpoint")?;
        let Some(document) = existing else {
            self.client
                .insert(&self.ns, predicate)
                .await
                .context("creating the replication checkpoint record")?;
            return Ok(OplogTimestamp::now());
        };
        match document.get("checkpoint") {
            Some(ts) => OplogTimestamp::from_value(ts).context("stored checkpoint is malformed"),
            None => Ok(OplogTimestamp::now()),
        }
    }

    /// Overwrites the checkpoint, idempotently. Failures are the caller's
    /// to tolerate; the next save may succeed and at-least-once delivery
    /// absorbs the gap.
    pub async fn save(&self, checkpoint: OplogTimestamp) -> anyhow::Result<()> {
        self.client
            .update(
                &self.ns,
                json!({"_id": self.source_id.as_str()}),
                json!({"$set": {"checkpoint": checkpoint.to_value()}}),
                true,
            )
            .await
            .context("persisting the replication checkpoint")
    }
}
