use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::{
    applier::Applier,
    driver::DocumentClient,
    metadata::{
        self,
        NodeId,
        ReplicationMetadata,
        METADATA_FIELD_PREFIX,
    },
    oplog::{
        Namespace,
        OpKind,
        OperationSet,
        OplogRecord,
    },
};

/// How the dispatcher treats one oplog record. Every record is exactly one
/// of these.
#[derive(Clone, Debug, PartialEq)]
enum Classification {
    /// Carries a truthy `__mmm_skip`: internally injected, dropped.
    InternalSkip,
    /// A `$set` of dotted `__mmm.…` keys: an acknowledgement written at a
    /// peer, dropped so it never re-fans-out.
    MetadataUpdate,
    /// A write that originated elsewhere and was just applied locally by a
    /// peer's applier.
    Echo { source_ts: Option<i64> },
    /// An application write on this node: stamp and replicate.
    LocalWrite,
    /// Deletes carry no metadata and are always forwarded unmodified.
    Delete,
}

/// Routes every oplog record of one registered source namespace: detects
/// and acknowledges echoes, stamps local writes with replication metadata,
/// and fans them out to the registered appliers.
///
/// The stamping rewrite is itself an oplog record; when it comes back
/// around it classifies as an echo (its hash matches its content) and is
/// dropped, so exactly one oplog operation per user write propagates.
pub struct Dispatcher {
    source_id: NodeId,
    source: Arc<dyn DocumentClient>,
    registrations: BTreeMap<(Namespace, OpKind), Vec<Arc<dyn Applier>>>,
}

impl Dispatcher {
    pub fn new(source_id: NodeId, source: Arc<dyn DocumentClient>) -> Self {
        Self {
            source_id,
            source,
            registrations: BTreeMap::new(),
        }
    }

    /// Registers an applier for `namespace` restricted to `operations`.
    /// Appliers fire in declaration order within each `(namespace, op)`
    /// key.
    pub fn register(
        &mut self,
        applier: Arc<dyn Applier>,
        namespace: Namespace,
        operations: &OperationSet,
    ) {
        for op in operations.iter() {
            self.registrations
                .entry((namespace.clone(), op))
                .or_default()
                .push(applier.clone());
        }
    }

    /// The `(namespace, op)` keys this dispatcher has appliers for; the
    /// engine registers it with the tailer under each of them.
    pub fn registered_keys(&self) -> impl Iterator<Item = &(Namespace, OpKind)> {
        self.registrations.keys()
    }

    /// Entry point, called for every oplog record whose namespace matches a
    /// registered source.
    pub async fn handle(&self, record: &OplogRecord) -> anyhow::Result<()> {
        match classify(record) {
            Classification::InternalSkip => {
                tracing::debug!("{}: dropping skip-marked {} on {}", self.source_id, record.op, record.ns);
                Ok(())
            },
            Classification::MetadataUpdate => {
                tracing::debug!("{}: dropping metadata update on {}", self.source_id, record.ns);
                Ok(())
            },
            Classification::Echo { source_ts } => self.acknowledge_echo(record, source_ts).await,
            Classification::LocalWrite => self.replicate_local_write(record).await,
            Classification::Delete => self.fan_out(record).await,
        }
    }

    /// Closes the loop on a write that arrived from a peer: records this
    /// node's acknowledgement on its own copy. Peers observe the
    /// acknowledgement as a metadata update and ignore it.
    async fn acknowledge_echo(
        &self,
        record: &OplogRecord,
        source_ts: Option<i64>,
    ) -> anyhow::Result<()> {
        let Some(source_ts) = source_ts else {
            tracing::warn!(
                "{}: echoed {} on {} carries no source_ts; not acknowledging",
                self.source_id,
                record.op,
                record.ns,
            );
            return Ok(());
        };
        let Some(predicate) = rewrite_predicate(record) else {
            tracing::warn!(
                "{}: echoed insert on {} has no _id; not acknowledging",
                self.source_id,
                record.ns,
            );
            return Ok(());
        };
        let mut setter = serde_json::Map::new();
        setter.insert(
            format!("{METADATA_FIELD_PREFIX}{}", self.source_id),
            json!(source_ts),
        );
        let ack = json!({"$set": setter});
        tracing::debug!("{}: acknowledging echoed {} on {}", self.source_id, record.op, record.ns);
        self.source
            .update(&record.ns, predicate, ack, false)
            .await
            .context("writing the echo acknowledgement")
    }

    /// Stamps a local write with fresh metadata, writes the stamped
    /// document back to the source (the oplog itself does not carry the
    /// computed metadata, so this rewrite is what lets peers detect the
    /// echoes), then fans out to the registered appliers.
    async fn replicate_local_write(&self, record: &OplogRecord) -> anyhow::Result<()> {
        let timestamp = metadata::wall_clock_ms();
        let hash = metadata::content_hash(&record.document);
        let stamp = ReplicationMetadata::stamp(self.source_id.clone(), timestamp, hash);

        let mut stamped = record.document.clone();
        if let Err(err) = metadata::embed_metadata(&mut stamped, record.op, &stamp) {
            tracing::warn!(
                "{}: cannot stamp {} on {} ({err:#}); skipping record",
                self.source_id,
                record.op,
                record.ns,
            );
            return Ok(());
        }

        match rewrite_predicate(record) {
            Some(predicate) => {
                let upsert = record.op == OpKind::Update && record.upsert;
                self.source
                    .update(&record.ns, predicate, stamped.clone(), upsert)
                    .await
                    .context("writing replication metadata back to the source")?;
            },
            None => tracing::warn!(
                "{}: local insert on {} has no _id; peers will not detect its echoes",
                self.source_id,
                record.ns,
            ),
        }

        let stamped_record = OplogRecord {
            document: stamped,
            ..record.clone()
        };
        self.fan_out(&stamped_record).await
    }

    async fn fan_out(&self, record: &OplogRecord) -> anyhow::Result<()> {
        for applier in self.appliers_for(&record.ns, record.op) {
            tracing::debug!(
                "{} => {}: {} {}",
                self.source_id,
                applier.destination_id(),
                record.op,
                record.ns,
            );
            applier.apply(record).await?;
        }
        Ok(())
    }

    fn appliers_for(&self, ns: &Namespace, op: OpKind) -> impl Iterator<Item = &Arc<dyn Applier>> {
        let exact = self.registrations.get(&(ns.clone(), op));
        let wildcard = self.registrations.get(&(ns.wildcard(), op));
        exact.into_iter().flatten().chain(wildcard.into_iter().flatten())
    }
}

#[async_trait]
impl crate::tailer::OplogSink for Dispatcher {
    async fn handle(&self, record: &OplogRecord) -> anyhow::Result<()> {
        Dispatcher::handle(self, record).await
    }
}

/// The predicate for source-side rewrites: the document's own `_id` for
/// inserts, the update's predicate otherwise.
fn rewrite_predicate(record: &OplogRecord) -> Option<JsonValue> {
    match record.op {
        OpKind::Insert => record
            .document
            .get("_id")
            .map(|id| json!({"_id": id.clone()})),
        OpKind::Update => record.predicate.clone(),
        OpKind::Delete => None,
    }
}

fn classify(record: &OplogRecord) -> Classification {
    if metadata::is_skip_marked(&record.document) {
        return Classification::InternalSkip;
    }
    if is_metadata_update(record) {
        return Classification::MetadataUpdate;
    }
    if record.op == OpKind::Delete {
        return Classification::Delete;
    }
    let Some(slot) = metadata::metadata_slot(&record.document, record.op) else {
        return Classification::LocalWrite;
    };
    // The hash discriminates true echoes from application writes that
    // happen to touch the metadata field; without one, presence decides.
    if let Some(expected) = slot.get("hash").and_then(JsonValue::as_str) {
        if metadata::content_hash(&record.document) != expected {
            return Classification::LocalWrite;
        }
    }
    Classification::Echo {
        source_ts: slot.get("source_ts").and_then(numeric_ts),
    }
}

fn numeric_ts(value: &JsonValue) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// An update whose `$set` clause touches any dotted `__mmm.…` key is a
/// peer-side acknowledgement.
fn is_metadata_update(record: &OplogRecord) -> bool {
    if record.op != OpKind::Update {
        return false;
    }
    record
        .document
        .get(metadata::SET_MODIFIER)
        .and_then(JsonValue::as_object)
        .is_some_and(|set| set.keys().any(|k| k.starts_with(METADATA_FIELD_PREFIX)))
}
