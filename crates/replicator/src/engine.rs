use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    applier::DestinationApplier,
    checkpoint::CheckpointStore,
    config::Topology,
    dispatcher::Dispatcher,
    driver::Connector,
    oplog::{
        Namespace,
        OplogTimestamp,
    },
    tailer::OplogTailer,
};

/// Wires a topology into a running replication pipeline: one applier per
/// destination namespace, one dispatcher per source namespace, one tailer
/// driving them all.
pub struct ReplicationEngine {
    tailer: OplogTailer,
    stop: CancellationToken,
}

impl ReplicationEngine {
    pub async fn new(topology: Topology, connector: Arc<dyn Connector>) -> anyhow::Result<Self> {
        topology.validate()?;
        let master = &topology.master;
        let source_client = connector
            .document_client(&master.uri)
            .await
            .with_context(|| format!("connecting to master {}", master.id))?;
        let reader = connector
            .oplog_reader(&master.uri)
            .await
            .with_context(|| format!("opening the oplog of master {}", master.id))?;
        let checkpoints = CheckpointStore::new(source_client.clone(), master.id.clone());

        let mut dispatchers: BTreeMap<Namespace, Dispatcher> = BTreeMap::new();
        for replication in &topology.replications {
            for mapping in &replication.namespaces {
                // Each applier owns its own connection to the destination.
                let destination_client = connector
                    .document_client(&replication.uri)
                    .await
                    .with_context(|| format!("connecting to destination {}", replication.id))?;
                let applier = Arc::new(DestinationApplier::new(
                    replication.id.clone(),
                    mapping.dest.clone(),
                    destination_client,
                ));
                dispatchers
                    .entry(mapping.source.clone())
                    .or_insert_with(|| Dispatcher::new(master.id.clone(), source_client.clone()))
                    .register(applier, mapping.source.clone(), &replication.operations);
            }
        }

        let stop = CancellationToken::new();
        let mut tailer = OplogTailer::new(reader, checkpoints, stop.clone());
        for dispatcher in dispatchers.into_values() {
            let dispatcher = Arc::new(dispatcher);
            let keys: Vec<_> = dispatcher.registered_keys().cloned().collect();
            for (namespace, op) in keys {
                tailer.register(dispatcher.clone(), namespace, op);
            }
        }

        Ok(Self { tailer, stop })
    }

    #[cfg(test)]
    pub fn with_poll_intervals(
        mut self,
        idle_poll: std::time::Duration,
        reconnect_backoff: std::time::Duration,
    ) -> Self {
        self.tailer = self.tailer.with_poll_intervals(idle_poll, reconnect_backoff);
        self
    }

    /// Launches the tailer under the supervisor. Replication begins at
    /// `checkpoint` when given, otherwise at the persisted checkpoint (or
    /// "now" on a fresh source).
    pub fn start(self, checkpoint: Option<OplogTimestamp>) -> ReplicationHandle {
        let stop = self.stop.clone();
        let task = tokio::spawn(supervise(self.tailer, checkpoint));
        ReplicationHandle { stop, task }
    }
}

/// Runs the tailer to completion. Transient faults never surface here; an
/// error means the tailer gave up, and the embedding process is expected to
/// exit non-zero with it.
async fn supervise(
    tailer: OplogTailer,
    checkpoint: Option<OplogTimestamp>,
) -> anyhow::Result<()> {
    match tailer.run(checkpoint).await {
        Ok(()) => {
            tracing::info!("Replication stopped");
            Ok(())
        },
        Err(err) => {
            tracing::error!("Replication failed fatally: {err:#}");
            Err(err)
        },
    }
}

/// Handle on a running replication pipeline.
pub struct ReplicationHandle {
    stop: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl ReplicationHandle {
    /// Requests a clean stop. The tailer observes the signal between
    /// records and at its sleep boundaries; in-flight applier calls
    /// complete.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Waits for the pipeline to finish. `Err` means a fatal fault;
    /// embedders map it to a non-zero exit.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.task.await.context("the replication task panicked")?
    }
}
