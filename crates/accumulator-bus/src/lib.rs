//! A thin, testable abstraction over a partitioned, append-only, keyed log.
//!
//! The accumulator never talks to `rdkafka` directly — it talks to the [`Bus`] trait. This
//! crate owns the one real implementation, [`KafkaBus`], plus the rebalance plumbing that
//! lets a restarting worker find out which partitions it now owns.

mod error;
mod kafka;
mod memory;

pub use error::Error;
pub use kafka::{BusConfig, KafkaBus};
pub use memory::InMemoryBus;

use async_trait::async_trait;

/// A single record read from the bus, still carrying its partition and offset.
///
/// `value` is already JSON-decoded here rather than left as raw bytes: the accumulator has no
/// business writing its own JSON tokeniser, and decoding at the point the bytes are read off
/// the wire keeps every downstream consumer of a `Record` dealing with a structured tree. A
/// payload that isn't a JSON object is not discarded here, though — it's carried as an `Err` so
/// that exactly one place (the accumulator's transition function) implements the "malformed:
/// drop, count, still commit" policy.
#[derive(Debug, Clone)]
pub struct Record {
    pub partition: i32,
    pub offset: i64,
    pub timestamp: i64,
    pub key: Option<String>,
    pub value: Result<serde_json::Value, DecodeError>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("payload is not a JSON object: {0}")]
pub struct DecodeError(pub String);

/// A partition assignment change, delivered out-of-band from record consumption so that a
/// worker supervisor can load or unload state-store sections as ownership moves.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(Vec<i32>),
    Revoked(Vec<i32>),
}

/// Receives [`RebalanceEvent`]s for a [`Bus`]. Split out from the `Bus` trait itself so that
/// `Bus` stays `&self`-only and trivially shareable across partition workers.
pub struct RebalanceEvents(pub(crate) tokio::sync::mpsc::UnboundedReceiver<RebalanceEvent>);

impl RebalanceEvents {
    pub async fn recv(&mut self) -> Option<RebalanceEvent> {
        self.0.recv().await
    }
}

/// Abstract view of a partitioned, append-only, keyed log.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Block until the next record is available on any assigned partition. Transient errors
    /// (broker unavailability, leader elections, etc.) are retried internally with bounded
    /// backoff and never surface here; only a non-retryable client error does.
    async fn recv(&self) -> Result<Record, Error>;

    /// Publish a record onto the main topic, keyed for partition routing. At-least-once;
    /// no ordering is implied relative to `recv`.
    async fn send(&self, key: String, value: serde_json::Value) -> Result<(), Error>;

    /// Publish a state-store mutation onto the changelog topic, explicitly targeting the
    /// same partition index as the input partition it backs (mirroring the 1:1 partition
    /// correspondence a compacted changelog topic needs for restore to work).
    async fn send_changelog(
        &self,
        partition: i32,
        key: String,
        value: serde_json::Value,
    ) -> Result<(), Error>;

    /// Replay a changelog partition from its start to its current high watermark, returning
    /// every (key, value) pair in offset order. Used once, on partition assignment.
    async fn restore_changelog(
        &self,
        partition: i32,
    ) -> Result<Vec<(String, serde_json::Value)>, Error>;

    /// Mark `offset` (the next-to-read offset) as the position to commit for `partition` on
    /// the next [`Bus::commit`] call. Does not itself talk to the broker.
    fn store_offset(&self, partition: i32, offset: i64) -> Result<(), Error>;

    /// Commit all previously-stored offsets. The accumulator calls this only after the
    /// corresponding state mutations are durable in the changelog (§4.2 failure semantics).
    async fn commit(&self) -> Result<(), Error>;
}
