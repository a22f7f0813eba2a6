use std::{
    collections::BTreeSet,
    fmt::{
        self,
        Display,
    },
    str::FromStr,
    time::{
        SystemTime,
        UNIX_EPOCH,
    },
};

use anyhow::Context;
use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};
use serde_json::Value as JsonValue;

/// Position in the oplog: an ordered `(seconds, counter)` pair. The counter
/// disambiguates operations within the same second.
///
/// Extended-JSON form: `{"$timestamp": {"t": <seconds>, "i": <counter>}}`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OplogTimestamp {
    pub seconds: u64,
    pub counter: u32,
}

#[derive(Serialize, Deserialize)]
struct ExtendedTimestamp {
    #[serde(rename = "$timestamp")]
    timestamp: TimestampFields,
}

#[derive(Serialize, Deserialize)]
struct TimestampFields {
    t: u64,
    i: u32,
}

impl OplogTimestamp {
    pub fn new(seconds: u64, counter: u32) -> Self {
        Self { seconds, counter }
    }

    /// The sentinel used when no checkpoint exists yet: the current wall
    /// clock second with a zero counter, i.e. "start from now".
    pub fn now() -> Self {
        let seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            seconds,
            counter: 0,
        }
    }

    pub fn from_value(value: &JsonValue) -> anyhow::Result<Self> {
        serde_json::from_value(value.clone()).context("not an extended-JSON timestamp")
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).expect("timestamp serialization is infallible")
    }
}

impl Serialize for OplogTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        ExtendedTimestamp {
            timestamp: TimestampFields {
                t: self.seconds,
                i: self.counter,
            },
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OplogTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let extended = ExtendedTimestamp::deserialize(deserializer)?;
        Ok(Self {
            seconds: extended.timestamp.t,
            counter: extended.timestamp.i,
        })
    }
}

impl Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}, {})", self.seconds, self.counter)
    }
}

/// The oplog operation kinds the replicator understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
        }
    }
}

impl FromStr for OpKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "i" => Ok(OpKind::Insert),
            "u" => Ok(OpKind::Update),
            "d" => Ok(OpKind::Delete),
            other => anyhow::bail!("unknown oplog operation {other:?}"),
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subset of the operation kinds, configured as a string like `"iu"`.
/// Defaults to all three.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationSet(BTreeSet<OpKind>);

impl OperationSet {
    pub fn all() -> Self {
        Self(BTreeSet::from([OpKind::Insert, OpKind::Update, OpKind::Delete]))
    }

    pub fn contains(&self, op: OpKind) -> bool {
        self.0.contains(&op)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = OpKind> + '_ {
        self.0.iter().copied()
    }
}

impl Default for OperationSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromStr for OperationSet {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut ops = BTreeSet::new();
        for c in s.chars() {
            ops.insert(OpKind::from_str(&c.to_string())?);
        }
        Ok(Self(ops))
    }
}

impl Display for OperationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for op in &self.0 {
            f.write_str(op.as_str())?;
        }
        Ok(())
    }
}

impl Serialize for OperationSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OperationSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A `(database, collection)` pair. The string form is `"db.col"`; the
/// collection part may itself contain dots. A collection of `"*"` is a
/// wildcard matching every collection in the database.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    database: String,
    collection: String,
}

const WILDCARD_COLLECTION: &str = "*";

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn is_wildcard(&self) -> bool {
        self.collection == WILDCARD_COLLECTION
    }

    /// The wildcard namespace covering this namespace's database.
    pub fn wildcard(&self) -> Namespace {
        Namespace::new(self.database.clone(), WILDCARD_COLLECTION)
    }

    /// Whether a registration under `self` covers the concrete namespace of
    /// an oplog record.
    pub fn matches(&self, concrete: &Namespace) -> bool {
        if self.database != concrete.database {
            return false;
        }
        self.is_wildcard() || self.collection == concrete.collection
    }
}

impl FromStr for Namespace {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let Some((database, collection)) = s.split_once('.') else {
            anyhow::bail!("invalid namespace {s:?}: expected \"<db>.<collection>\"");
        };
        if database.is_empty() || collection.is_empty() {
            anyhow::bail!("invalid namespace {s:?}: empty database or collection");
        }
        Ok(Namespace::new(database, collection))
    }
}

impl Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// One oplog record, parsed down to the fields the replicator consumes.
/// Everything else in the raw document passes through opaquely.
#[derive(Clone, Debug)]
pub struct OplogRecord {
    /// Oplog field `ts`.
    pub ts: OplogTimestamp,
    /// Oplog field `op`.
    pub op: OpKind,
    /// Oplog field `ns`.
    pub ns: Namespace,
    /// Oplog field `o`: the document for inserts and deletes, the update
    /// spec for updates.
    pub document: JsonValue,
    /// Oplog field `o2`: the update predicate, present iff `op` is an
    /// update.
    pub predicate: Option<JsonValue>,
    /// Oplog field `b`.
    pub upsert: bool,
}

impl OplogRecord {
    pub fn from_document(raw: &JsonValue) -> anyhow::Result<Self> {
        let ts = record_timestamp(raw).context("missing or invalid `ts`")?;
        let op: OpKind = raw
            .get("op")
            .and_then(JsonValue::as_str)
            .context("missing `op`")?
            .parse()?;
        let ns: Namespace = raw
            .get("ns")
            .and_then(JsonValue::as_str)
            .context("missing `ns`")?
            .parse()?;
        let document = raw.get("o").cloned().context("missing `o`")?;
        let predicate = raw.get("o2").cloned();
        if op == OpKind::Update && predicate.is_none() {
            anyhow::bail!("update record without `o2` predicate");
        }
        let upsert = raw.get("b").and_then(JsonValue::as_bool).unwrap_or(false);
        Ok(Self {
            ts,
            op,
            ns,
            document,
            predicate,
            upsert,
        })
    }
}

/// Best-effort extraction of a record's timestamp, used to keep the
/// checkpoint advancing past records that fail to parse outright.
pub fn record_timestamp(raw: &JsonValue) -> anyhow::Result<OplogTimestamp> {
    let ts = raw.get("ts").context("record has no `ts`")?;
    OplogTimestamp::from_value(ts)
}
