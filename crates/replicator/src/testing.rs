//! In-memory fakes standing in for the database driver in tests.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{
    json,
    Value as JsonValue,
};

use crate::{
    applier::Applier,
    driver::{
        Connector,
        DocumentClient,
        OplogCursor,
        OplogReader,
    },
    error::DriverFault,
    metadata::{
        self,
        NodeId,
    },
    oplog::{
        self,
        Namespace,
        OpKind,
        OplogRecord,
        OplogTimestamp,
    },
    tailer::OplogSink,
};

/// One driver-level write observed by a [`FakeCluster`], for assertions.
#[derive(Clone, Debug)]
pub struct ObservedWrite {
    pub ns: Namespace,
    pub op: OpKind,
    pub document: JsonValue,
    pub predicate: Option<JsonValue>,
    pub upsert: bool,
}

#[derive(Default)]
struct FakeStore {
    collections: BTreeMap<Namespace, Vec<JsonValue>>,
    oplog: Vec<JsonValue>,
    writes: Vec<ObservedWrite>,
    write_faults: usize,
    write_rejections: usize,
    cursor_faults: usize,
    tail_faults: usize,
    cursor_opens: usize,
    reconnects: usize,
    next_ts: u64,
}

impl FakeStore {
    fn check_write_fault(&mut self) -> anyhow::Result<()> {
        if self.write_faults > 0 {
            self.write_faults -= 1;
            anyhow::bail!(DriverFault::ConnectionLost("injected fault".into()));
        }
        if self.write_rejections > 0 {
            self.write_rejections -= 1;
            anyhow::bail!("injected non-transient failure");
        }
        Ok(())
    }

    /// Writes to the `local` database are not replicated and never reach
    /// the oplog, matching the real source.
    fn log_oplog(&mut self, op: OpKind, ns: &Namespace, o: JsonValue, o2: Option<JsonValue>, b: bool) {
        if ns.database() == "local" {
            return;
        }
        self.next_ts += 1;
        let mut record = json!({
            "ts": OplogTimestamp::new(1_000_000, self.next_ts as u32).to_value(),
            "op": op.as_str(),
            "ns": ns.to_string(),
            "o": o,
        });
        if let Some(o2) = o2 {
            record["o2"] = o2;
        }
        if b {
            record["b"] = json!(true);
        }
        self.oplog.push(record);
    }

    fn matches(predicate: &JsonValue, document: &JsonValue) -> bool {
        let Some(predicate) = predicate.as_object() else {
            return false;
        };
        predicate
            .iter()
            .all(|(key, value)| document.get(key) == Some(value))
    }

    fn find_position(&self, ns: &Namespace, predicate: &JsonValue) -> Option<usize> {
        self.collections
            .get(ns)?
            .iter()
            .position(|doc| Self::matches(predicate, doc))
    }

    fn apply_update(target: &mut JsonValue, spec: &JsonValue) {
        if !metadata::is_modifier_update(spec) {
            // Full replacement keeps the _id.
            let id = target.get("_id").cloned();
            *target = spec.clone();
            if let (Some(id), Some(obj)) = (id, target.as_object_mut()) {
                obj.entry("_id").or_insert(id);
            }
            return;
        }
        for (operator, fields) in spec.as_object().expect("modifier spec is a document") {
            if operator == metadata::SET_MODIFIER {
                for (path, value) in fields.as_object().expect("$set takes a document") {
                    Self::set_path(target, path, value.clone());
                }
            } else {
                panic!("modifier {operator} not supported by the fake");
            }
        }
    }

    fn set_path(target: &mut JsonValue, path: &str, value: JsonValue) {
        let mut current = target;
        let mut parts = path.split('.').peekable();
        while let Some(part) = parts.next() {
            let obj = current
                .as_object_mut()
                .expect("$set path runs through documents");
            if parts.peek().is_none() {
                obj.insert(part.to_string(), value);
                return;
            }
            current = obj
                .entry(part)
                .or_insert_with(|| JsonValue::Object(Default::default()));
        }
    }
}

/// An in-memory database cluster: collections, an oplog synthesized from
/// the writes it receives, and failure injection. Stands in for both the
/// source and the destinations.
#[derive(Clone, Default)]
pub struct FakeCluster {
    store: Arc<Mutex<FakeStore>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> Arc<dyn DocumentClient> {
        Arc::new(FakeClient {
            store: self.store.clone(),
        })
    }

    pub fn oplog_reader(&self) -> Arc<dyn OplogReader> {
        Arc::new(FakeOplogReader {
            store: self.store.clone(),
        })
    }

    /// Inserts a document without logging a write or an oplog record, as if
    /// it predated the replicator.
    pub fn seed(&self, ns: &str, document: JsonValue) {
        let ns: Namespace = ns.parse().expect("seed namespace is well formed");
        self.store
            .lock()
            .unwrap()
            .collections
            .entry(ns)
            .or_default()
            .push(document);
    }

    /// Appends a raw record to the oplog, as if a primary had logged it.
    pub fn append_oplog(&self, record: JsonValue) {
        self.store.lock().unwrap().oplog.push(record);
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<JsonValue> {
        self.store
            .lock()
            .unwrap()
            .collections
            .get(ns)
            .cloned()
            .unwrap_or_default()
    }

    pub fn oplog_records(&self) -> Vec<JsonValue> {
        self.store.lock().unwrap().oplog.clone()
    }

    /// Every driver-level write this cluster received, except internal ones
    /// against the `local` database.
    pub fn writes(&self) -> Vec<ObservedWrite> {
        self.store
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|write| write.ns.database() != "local")
            .cloned()
            .collect()
    }

    pub fn checkpoint_of(&self, source_id: &str) -> Option<OplogTimestamp> {
        let store = self.store.lock().unwrap();
        let checkpoints = store.collections.get(&Namespace::new("local", "mmm"))?;
        let document = checkpoints
            .iter()
            .find(|doc| doc.get("_id") == Some(&json!(source_id)))?;
        OplogTimestamp::from_value(document.get("checkpoint")?).ok()
    }

    pub fn reconnects(&self) -> usize {
        self.store.lock().unwrap().reconnects
    }

    pub fn cursor_opens(&self) -> usize {
        self.store.lock().unwrap().cursor_opens
    }

    /// The next `n` writes fail with a transient driver fault.
    pub fn fail_next_writes(&self, n: usize) {
        self.store.lock().unwrap().write_faults = n;
    }

    /// The next `n` writes fail with a non-transient error.
    pub fn reject_next_writes(&self, n: usize) {
        self.store.lock().unwrap().write_rejections = n;
    }

    /// The next cursor read fails with a transient driver fault.
    pub fn break_cursor_once(&self) {
        self.store.lock().unwrap().cursor_faults = 1;
    }

    /// The next `n` attempts to open a tailing cursor fail.
    pub fn fail_next_tails(&self, n: usize) {
        self.store.lock().unwrap().tail_faults = n;
    }
}

struct FakeClient {
    store: Arc<Mutex<FakeStore>>,
}

#[async_trait]
impl DocumentClient for FakeClient {
    async fn reconnect(&self) -> anyhow::Result<()> {
        self.store.lock().unwrap().reconnects += 1;
        Ok(())
    }

    async fn insert(&self, ns: &Namespace, document: JsonValue) -> anyhow::Result<()> {
        let mut store = self.store.lock().unwrap();
        store.check_write_fault()?;
        store.writes.push(ObservedWrite {
            ns: ns.clone(),
            op: OpKind::Insert,
            document: document.clone(),
            predicate: None,
            upsert: false,
        });
        store
            .collections
            .entry(ns.clone())
            .or_default()
            .push(document.clone());
        store.log_oplog(OpKind::Insert, ns, document, None, false);
        Ok(())
    }

    async fn update(
        &self,
        ns: &Namespace,
        predicate: JsonValue,
        document: JsonValue,
        upsert: bool,
    ) -> anyhow::Result<()> {
        let mut store = self.store.lock().unwrap();
        store.check_write_fault()?;
        store.writes.push(ObservedWrite {
            ns: ns.clone(),
            op: OpKind::Update,
            document: document.clone(),
            predicate: Some(predicate.clone()),
            upsert,
        });
        match store.find_position(ns, &predicate) {
            Some(position) => {
                let mut target = store.collections.get_mut(ns).expect("collection exists")
                    [position]
                    .clone();
                FakeStore::apply_update(&mut target, &document);
                store.collections.get_mut(ns).expect("collection exists")[position] =
                    target;
                store.log_oplog(OpKind::Update, ns, document, Some(predicate), upsert);
            },
            None if upsert => {
                let mut created = predicate.clone();
                FakeStore::apply_update(&mut created, &document);
                store
                    .collections
                    .entry(ns.clone())
                    .or_default()
                    .push(created);
                store.log_oplog(OpKind::Update, ns, document, Some(predicate), upsert);
            },
            None => {},
        }
        Ok(())
    }

    async fn remove(&self, ns: &Namespace, predicate: JsonValue) -> anyhow::Result<()> {
        let mut store = self.store.lock().unwrap();
        store.check_write_fault()?;
        store.writes.push(ObservedWrite {
            ns: ns.clone(),
            op: OpKind::Delete,
            document: predicate.clone(),
            predicate: None,
            upsert: false,
        });
        let Some(collection) = store.collections.get_mut(ns) else {
            return Ok(());
        };
        let before = collection.len();
        collection.retain(|doc| !FakeStore::matches(&predicate, doc));
        // Removing nothing logs nothing, so delete echoes cannot ring.
        if collection.len() < before {
            store.log_oplog(OpKind::Delete, ns, predicate, None, false);
        }
        Ok(())
    }

    async fn find_one(
        &self,
        ns: &Namespace,
        predicate: JsonValue,
    ) -> anyhow::Result<Option<JsonValue>> {
        let store = self.store.lock().unwrap();
        let found = store
            .collections
            .get(ns)
            .and_then(|docs| docs.iter().find(|doc| FakeStore::matches(&predicate, doc)))
            .cloned();
        Ok(found)
    }
}

struct FakeOplogReader {
    store: Arc<Mutex<FakeStore>>,
}

#[async_trait]
impl OplogReader for FakeOplogReader {
    async fn tail(&self, after: OplogTimestamp) -> anyhow::Result<Box<dyn OplogCursor>> {
        let mut store = self.store.lock().unwrap();
        if store.tail_faults > 0 {
            store.tail_faults -= 1;
            anyhow::bail!(DriverFault::ConnectionLost("injected tail fault".into()));
        }
        store.cursor_opens += 1;
        Ok(Box::new(FakeOplogCursor {
            store: self.store.clone(),
            after,
            position: 0,
        }))
    }
}

struct FakeOplogCursor {
    store: Arc<Mutex<FakeStore>>,
    after: OplogTimestamp,
    position: usize,
}

#[async_trait]
impl OplogCursor for FakeOplogCursor {
    async fn next(&mut self) -> anyhow::Result<Option<JsonValue>> {
        let mut store = self.store.lock().unwrap();
        if store.cursor_faults > 0 {
            store.cursor_faults -= 1;
            anyhow::bail!(DriverFault::ConnectionLost("injected cursor fault".into()));
        }
        while self.position < store.oplog.len() {
            let record = store.oplog[self.position].clone();
            self.position += 1;
            let ts = oplog::record_timestamp(&record)
                .context("fake oplog records carry timestamps")?;
            if ts > self.after {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// [`Connector`] resolving topology URIs to [`FakeCluster`]s.
pub struct FakeConnector {
    clusters: BTreeMap<String, FakeCluster>,
}

impl FakeConnector {
    pub fn new(clusters: impl IntoIterator<Item = (&'static str, FakeCluster)>) -> Self {
        Self {
            clusters: clusters
                .into_iter()
                .map(|(uri, cluster)| (uri.to_string(), cluster))
                .collect(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn document_client(&self, uri: &str) -> anyhow::Result<Arc<dyn DocumentClient>> {
        let cluster = self.clusters.get(uri).context("unknown cluster uri")?;
        Ok(cluster.client())
    }

    async fn oplog_reader(&self, uri: &str) -> anyhow::Result<Arc<dyn OplogReader>> {
        let cluster = self.clusters.get(uri).context("unknown cluster uri")?;
        Ok(cluster.oplog_reader())
    }
}

/// An [`Applier`] recording its calls.
pub struct RecordingApplier {
    destination_id: NodeId,
    calls: Mutex<Vec<OplogRecord>>,
}

impl RecordingApplier {
    pub fn new(destination_id: &str) -> Self {
        Self {
            destination_id: NodeId(destination_id.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<OplogRecord> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Applier for RecordingApplier {
    fn destination_id(&self) -> &NodeId {
        &self.destination_id
    }

    async fn apply(&self, record: &OplogRecord) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// An [`OplogSink`] recording its calls.
pub struct RecordingSink {
    calls: Mutex<Vec<OplogRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<OplogRecord> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OplogSink for RecordingSink {
    async fn handle(&self, record: &OplogRecord) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Polls `condition` until it holds, panicking after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
