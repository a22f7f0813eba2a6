//! Multi-master replicator core for a document database exposing an
//! append-only oplog.
//!
//! One [`engine::ReplicationEngine`] runs per master node. It tails the
//! node's oplog, stamps local writes with replication metadata, and fans
//! them out to the configured destinations; cross-configured engines form
//! an N-way active/active topology. Loop prevention is content-addressed:
//! every replicated write carries the hash of its own non-metadata content,
//! so a write coming back around is recognized as an echo, acknowledged,
//! and dropped instead of propagating again.
//!
//! The database driver is an external collaborator behind the traits in
//! [`driver`]; embedders supply an implementation together with a
//! [`config::Topology`].

pub mod applier;
pub mod checkpoint;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod engine;
pub mod error;
pub mod knobs;
pub mod metadata;
pub mod oplog;
pub mod tailer;

#[cfg(test)]
pub mod testing;

pub use crate::{
    config::Topology,
    engine::{
        ReplicationEngine,
        ReplicationHandle,
    },
};
