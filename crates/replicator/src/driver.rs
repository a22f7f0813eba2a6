//! The seam between the replicator and the database driver.
//!
//! The driver itself is an external collaborator: production embedders
//! implement these traits on top of their driver of choice, tests implement
//! them with in-memory fakes. Implementations report retriable conditions
//! as [`DriverFault`](crate::error::DriverFault) so the replicator's
//! reconnect discipline can tell them apart from fatal errors.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::oplog::{
    Namespace,
    OplogTimestamp,
};

/// Document-level operations against one database cluster.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Tear down and re-establish the underlying connection after a
    /// transient fault.
    async fn reconnect(&self) -> anyhow::Result<()>;

    async fn insert(&self, ns: &Namespace, document: JsonValue) -> anyhow::Result<()>;

    async fn update(
        &self,
        ns: &Namespace,
        predicate: JsonValue,
        document: JsonValue,
        upsert: bool,
    ) -> anyhow::Result<()>;

    async fn remove(&self, ns: &Namespace, predicate: JsonValue) -> anyhow::Result<()>;

    async fn find_one(
        &self,
        ns: &Namespace,
        predicate: JsonValue,
    ) -> anyhow::Result<Option<JsonValue>>;
}

/// A live tailing cursor over the oplog.
///
/// `next` yields `Ok(Some(record))` in oplog order, `Ok(None)` when the
/// cursor is currently exhausted (the tailer idles and polls again), and
/// `Err` when the cursor has become unusable and must be reopened.
#[async_trait]
pub trait OplogCursor: Send {
    async fn next(&mut self) -> anyhow::Result<Option<JsonValue>>;
}

/// Opens tailing cursors over a source node's oplog.
#[async_trait]
pub trait OplogReader: Send + Sync {
    /// Opens a cursor over every record with `ts` strictly greater than
    /// `after`, awaiting new data on exhaustion.
    async fn tail(&self, after: OplogTimestamp) -> anyhow::Result<Box<dyn OplogCursor>>;
}

/// Mints driver handles from topology connection strings.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn document_client(&self, uri: &str) -> anyhow::Result<Arc<dyn DocumentClient>>;

    async fn oplog_reader(&self, uri: &str) -> anyhow::Result<Arc<dyn OplogReader>>;
}
