use std::collections::BTreeSet;

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    metadata::NodeId,
    oplog::{
        Namespace,
        OperationSet,
    },
};

/// The replication topology one process runs with: its own master node plus
/// the destinations it pushes to. Loaded from a YAML file shaped like:
///
/// ```yaml
/// master:
///   name: 'my master'
///   id: 'my-server'
///   uri: 'localhost:27017'
/// replications:
///   - name: 'another server'
///     id: 'my-other-server'
///     uri: 'localhost:27019'
///     operations: 'iud'
///     namespaces:
///       - source: 'mydb.mycol'
///         dest: 'otherdb.othercol'
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Topology {
    pub master: MasterConfig,
    pub replications: Vec<ReplicationConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterConfig {
    /// Human-readable label, unused by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub id: NodeId,
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub id: NodeId,
    pub uri: String,
    /// Which operation kinds to replicate, as a subset of `"iud"`.
    #[serde(default)]
    pub operations: OperationSet,
    pub namespaces: Vec<NamespaceMapping>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceMapping {
    pub source: Namespace,
    pub dest: Namespace,
}

impl Topology {
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let topology: Topology =
            serde_yaml::from_str(contents).context("parsing the topology file")?;
        topology.validate()?;
        Ok(topology)
    }

    /// Validates the cross-field constraints the serde layer cannot see.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.master.id.as_str().is_empty() {
            anyhow::bail!("the master id must not be empty");
        }
        let mut seen = BTreeSet::new();
        for replication in &self.replications {
            let id = &replication.id;
            if id.as_str().is_empty() {
                anyhow::bail!("replication destinations must have a non-empty id");
            }
            if id == &self.master.id {
                anyhow::bail!("destination {id} reuses the master id");
            }
            if !seen.insert(id.clone()) {
                anyhow::bail!(
                    "destination {id} is configured twice; acknowledgements are keyed by \
                     destination id"
                );
            }
            if replication.operations.is_empty() {
                anyhow::bail!("destination {id} has an empty operation set");
            }
            if replication.namespaces.is_empty() {
                anyhow::bail!("destination {id} replicates no namespaces");
            }
        }
        Ok(())
    }
}
