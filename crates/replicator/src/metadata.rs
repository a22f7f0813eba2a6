use std::{
    collections::BTreeMap,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use anyhow::Context;
use derive_more::{
    Display,
    From,
    Into,
};
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::oplog::OpKind;

/// Reserved key carrying replication metadata inside replicated documents.
/// Applications must not write it themselves; the content hash limits the
/// damage when they do.
pub const METADATA_FIELD: &str = "__mmm";

/// Dotted prefix of acknowledgement `$set` keys, e.g. `"__mmm.node-a"`.
pub const METADATA_FIELD_PREFIX: &str = "__mmm.";

/// Reserved key marking an operation as internally injected; the dispatcher
/// drops any operation whose document carries a truthy value here.
pub const SKIP_FIELD: &str = "__mmm_skip";

pub(crate) const SET_MODIFIER: &str = "$set";

/// Identifier of a node in the replication topology.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

/// The metadata stamped on replicated writes under [`METADATA_FIELD`].
///
/// Besides the fixed fields, the object carries one entry per destination
/// node id whose value is the `source_ts` at which that destination
/// acknowledged the write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMetadata {
    /// Id of the node that originated the write.
    pub source: NodeId,
    /// Originator wall clock, milliseconds since the epoch, at stamp time.
    pub source_ts: i64,
    /// MD5 (lowercase hex) of the canonical JSON of the operation document
    /// with the metadata field removed. Absent on writes stamped by older
    /// replicator revisions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Per-destination acknowledgements.
    #[serde(flatten)]
    pub acks: BTreeMap<NodeId, i64>,
}

impl ReplicationMetadata {
    /// Fresh metadata for a local write. The originator counts as its own
    /// first acknowledged destination.
    pub fn stamp(source: NodeId, source_ts: i64, hash: String) -> Self {
        let acks = BTreeMap::from([(source.clone(), source_ts)]);
        Self {
            source,
            source_ts,
            hash: Some(hash),
            acks,
        }
    }

    pub fn from_value(value: &JsonValue) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone()).context("malformed replication metadata")
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).expect("metadata serialization is infallible")
    }
}

/// Milliseconds since the epoch on the local wall clock. Used only as a
/// per-destination acknowledgement marker; loop prevention depends on the
/// content hash, not on time.
pub fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Whether an update document uses `$`-operators, as opposed to being a
/// full-document replacement.
pub fn is_modifier_update(document: &JsonValue) -> bool {
    document
        .as_object()
        .is_some_and(|o| o.keys().any(|k| k.starts_with('$')))
}

/// The position where replication metadata lives in an operation document:
/// inside the `$set` clause for modifier updates, at the top level
/// otherwise.
pub fn metadata_slot<'a>(document: &'a JsonValue, op: OpKind) -> Option<&'a JsonValue> {
    metadata_parent(document, op)?.get(METADATA_FIELD)
}

fn metadata_parent(document: &JsonValue, op: OpKind) -> Option<&JsonValue> {
    if op == OpKind::Update && is_modifier_update(document) {
        document.get(SET_MODIFIER)
    } else {
        Some(document)
    }
}

/// Embeds freshly stamped metadata into an operation document, creating the
/// `$set` clause for modifier updates that lack one.
pub fn embed_metadata(
    document: &mut JsonValue,
    op: OpKind,
    metadata: &ReplicationMetadata,
) -> anyhow::Result<()> {
    let slot = if op == OpKind::Update && is_modifier_update(document) {
        let spec = document
            .as_object_mut()
            .context("update spec is not a document")?;
        spec.entry(SET_MODIFIER).or_insert_with(|| JsonValue::Object(Default::default()))
    } else {
        document
    };
    slot.as_object_mut()
        .context("metadata target is not a document")?
        .insert(METADATA_FIELD.to_string(), metadata.to_value());
    Ok(())
}

/// Records on the outgoing document that `destination` has this write, by
/// copying `source_ts` under the destination's id inside the metadata.
/// A no-op when the document carries no well-formed metadata.
pub fn acknowledge_destination(document: &mut JsonValue, op: OpKind, destination: &NodeId) {
    let slot = if op == OpKind::Update && is_modifier_update(document) {
        match document.get_mut(SET_MODIFIER) {
            Some(set) => set,
            None => return,
        }
    } else {
        &mut *document
    };
    let Some(metadata) = slot.get_mut(METADATA_FIELD).and_then(JsonValue::as_object_mut) else {
        return;
    };
    let Some(source_ts) = metadata.get("source_ts").cloned() else {
        return;
    };
    metadata.insert(destination.0.clone(), source_ts);
}

/// Python-style truthiness, matching how heterogeneous replicator processes
/// interpret the skip marker.
fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(o) => !o.is_empty(),
    }
}

pub fn is_skip_marked(document: &JsonValue) -> bool {
    document.get(SKIP_FIELD).is_some_and(truthy)
}

/// A copy of the operation document with replication metadata removed, from
/// the top level and from the `$set` clause. This is the content that gets
/// hashed.
pub fn without_replication_metadata(document: &JsonValue) -> JsonValue {
    let mut stripped = document.clone();
    if let Some(top) = stripped.as_object_mut() {
        top.remove(METADATA_FIELD);
        if let Some(set) = top.get_mut(SET_MODIFIER).and_then(JsonValue::as_object_mut) {
            set.remove(METADATA_FIELD);
        }
    }
    stripped
}

/// MD5 (lowercase hex) of the canonical JSON of the document with
/// replication metadata removed.
pub fn content_hash(document: &JsonValue) -> String {
    let canonical = canonical_json(&without_replication_metadata(document));
    format!("{:x}", md5::compute(canonical.as_bytes()))
}

/// Canonical JSON: compact separators, mapping keys sorted lexicographically
/// at every nesting level, list order preserved. Extended-JSON leaves such
/// as `{"$oid": …}` or `{"$timestamp": …}` are ordinary mappings and
/// canonicalize like any other. Must match the canonicalization of every
/// other replicator process tailing the same topology.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        },
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        },
        other => {
            out.push_str(&serde_json::to_string(other).expect("scalar serialization is infallible"))
        },
    }
}
