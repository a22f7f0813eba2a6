use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::CheckpointStore,
    driver::OplogReader,
    knobs::{
        IDLE_POLL,
        RECONNECT_BACKOFF,
    },
    oplog::{
        self,
        Namespace,
        OpKind,
        OplogRecord,
        OplogTimestamp,
    },
};

/// Consumer of dispatched oplog records; implemented by the aggregate
/// dispatcher.
#[async_trait]
pub trait OplogSink: Send + Sync {
    async fn handle(&self, record: &OplogRecord) -> anyhow::Result<()>;
}

/// Tails the source oplog and drives all dispatch synchronously, in oplog
/// order, checkpointing as it goes.
///
/// Transient cursor faults are ridden out with one fixed-backoff reconnect;
/// a failed reconnect terminates `run` with the error, which the supervisor
/// escalates.
pub struct OplogTailer {
    reader: Arc<dyn OplogReader>,
    checkpoints: CheckpointStore,
    registrations: BTreeMap<(Namespace, OpKind), Vec<Arc<dyn OplogSink>>>,
    stop: CancellationToken,
    idle_poll: Duration,
    reconnect_backoff: Duration,
}

impl OplogTailer {
    pub fn new(
        reader: Arc<dyn OplogReader>,
        checkpoints: CheckpointStore,
        stop: CancellationToken,
    ) -> Self {
        Self {
            reader,
            checkpoints,
            registrations: BTreeMap::new(),
            stop,
            idle_poll: *IDLE_POLL,
            reconnect_backoff: *RECONNECT_BACKOFF,
        }
    }

    pub fn with_poll_intervals(mut self, idle_poll: Duration, reconnect_backoff: Duration) -> Self {
        self.idle_poll = idle_poll;
        self.reconnect_backoff = reconnect_backoff;
        self
    }

    /// Registers a sink for `(namespace, op)`. Registration happens at
    /// startup; the table is read-only once `run` starts. Registering the
    /// same sink twice under one key is a no-op.
    pub fn register(&mut self, sink: Arc<dyn OplogSink>, namespace: Namespace, op: OpKind) {
        let sinks = self.registrations.entry((namespace, op)).or_default();
        if sinks.iter().any(|existing| Arc::ptr_eq(existing, &sink)) {
            return;
        }
        sinks.push(sink);
    }

    /// Blocks until stopped, dispatching every oplog record with
    /// `ts > start` (or past the persisted checkpoint when `start` is
    /// `None`) to the sinks registered for its `(namespace, op)`. Records
    /// are delivered at least once.
    pub async fn run(&self, start: Option<OplogTimestamp>) -> anyhow::Result<()> {
        let mut checkpoint = match start {
            Some(ts) => ts,
            None => self.checkpoints.load().await?,
        };
        tracing::info!("Reading oplog records after {checkpoint}");
        let mut cursor = self
            .reader
            .tail(checkpoint)
            .await
            .context("opening the oplog cursor")?;

        loop {
            if self.stop.is_cancelled() {
                tracing::info!("Stop requested; closing the oplog cursor");
                return Ok(());
            }
            match cursor.next().await {
                Ok(Some(raw)) => {
                    checkpoint = self.process(&raw, checkpoint).await?;
                },
                Ok(None) => {
                    if self.sleep_or_stop(self.idle_poll).await {
                        return Ok(());
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        "Oplog cursor failed ({err:#}); reconnecting in {:?}",
                        self.reconnect_backoff,
                    );
                    if self.sleep_or_stop(self.reconnect_backoff).await {
                        return Ok(());
                    }
                    let resume = self
                        .checkpoints
                        .load()
                        .await
                        .context("reloading the checkpoint to reconnect")?;
                    cursor = self
                        .reader
                        .tail(resume)
                        .await
                        .context("reconnecting to the oplog")?;
                    tracing::info!("Reconnected to the oplog at {resume}");
                },
            }
        }
    }

    async fn process(
        &self,
        raw: &JsonValue,
        checkpoint: OplogTimestamp,
    ) -> anyhow::Result<OplogTimestamp> {
        let record = match OplogRecord::from_document(raw) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("Skipping malformed oplog record: {err:#}");
                return self.advance(checkpoint, oplog::record_timestamp(raw).ok()).await;
            },
        };
        if record.ts <= checkpoint {
            // The source must not rewind us; older records are dropped.
            tracing::warn!(
                "Ignoring out-of-order oplog record at {} behind checkpoint {}",
                record.ts,
                checkpoint,
            );
            return Ok(checkpoint);
        }
        for sink in self.sinks_for(&record.ns, record.op) {
            sink.handle(&record).await?;
        }
        self.advance(checkpoint, Some(record.ts)).await
    }

    /// Persists the new checkpoint once the record has been dispatched to
    /// every interested sink. A failed save is tolerated: the next save may
    /// succeed, and re-dispatch after a restart is safe.
    async fn advance(
        &self,
        checkpoint: OplogTimestamp,
        ts: Option<OplogTimestamp>,
    ) -> anyhow::Result<OplogTimestamp> {
        let Some(ts) = ts else {
            return Ok(checkpoint);
        };
        if ts <= checkpoint {
            return Ok(checkpoint);
        }
        if let Err(err) = self.checkpoints.save(ts).await {
            tracing::warn!("Failed to persist checkpoint {ts}: {err:#}");
        }
        Ok(ts)
    }

    fn sinks_for(&self, ns: &Namespace, op: OpKind) -> impl Iterator<Item = &Arc<dyn OplogSink>> {
        let exact = self.registrations.get(&(ns.clone(), op));
        let wildcard = self.registrations.get(&(ns.wildcard(), op));
        exact.into_iter().flatten().chain(wildcard.into_iter().flatten())
    }

    /// Sleeps cooperatively; returns true when the stop signal fired.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
