//! Orchestration around the pure [`crate::state_machine`]: for one assigned partition, reads
//! prior state, applies a record, persists the result, and publishes a completion when the
//! transition produced one. This is the ~70% of the design that wraps the state machine with
//! the state store and the bus.

use crate::state_machine::{self, Outcome};
use crate::Error;
use accumulator_bus::{Bus, Record};
use accumulator_store::RocksStore;
use std::sync::Arc;

/// Owns the processing of a single assigned partition. Cheaply cloneable so the worker
/// supervisor can hand one to a dedicated task per partition while sharing the underlying
/// store and bus handles.
#[derive(Clone)]
pub struct PartitionProcessor {
    partition: i32,
    store: Arc<RocksStore>,
}

impl PartitionProcessor {
    pub fn new(partition: i32, store: Arc<RocksStore>) -> Self {
        PartitionProcessor { partition, store }
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Rebuild this partition's local state from its changelog. Must be called once before
    /// any [`Self::handle`] call, on partition assignment.
    pub async fn restore(&self, bus: &dyn Bus) -> Result<(), Error> {
        self.store.restore(bus, self.partition).await?;
        Ok(())
    }

    /// Apply one inbound record belonging to this partition: steps 1-8 of §4.3, plus the
    /// counters a production instance needs (malformed, self-echo, completed).
    ///
    /// Returns `Ok(true)` when the input offset is now eligible for commit — true in every
    /// case except a state-store write failure, which propagates instead (§7: fatal to the
    /// worker).
    #[tracing::instrument(skip(self, bus, record), fields(partition = self.partition, offset = record.offset))]
    pub async fn handle(&self, bus: &dyn Bus, record: Record) -> Result<bool, Error> {
        let value = match record.value {
            Ok(value) => value,
            Err(decode_err) => {
                tracing::warn!(%decode_err, "dropping malformed record");
                metrics::counter!("accumulator_malformed_records_total").increment(1);
                return Ok(true);
            }
        };

        let id = value.get("@id").and_then(|v| v.as_str()).map(str::to_string);

        let prior = match &id {
            Some(id) => self.store.get(self.partition, id)?,
            None => None,
        };

        match state_machine::apply(prior, &value, record.offset) {
            Outcome::SelfEcho => {
                tracing::trace!("ignoring self-echo of a final record");
                Ok(true)
            }
            Outcome::Malformed { reason } => {
                tracing::warn!(reason, "dropping malformed record");
                metrics::counter!("accumulator_malformed_records_total").increment(1);
                Ok(true)
            }
            Outcome::Applied { state, emit } => {
                let id = state.id.clone();
                self.store.put(bus, self.partition, &id, &state).await?;

                if let Some(final_record) = emit {
                    bus.send(id.clone(), final_record).await?;
                    metrics::counter!("accumulator_completions_total").increment(1);
                    tracing::info!(id, "emitted final record");
                }

                Ok(true)
            }
        }
    }

    /// Release this partition's local state on revoke or shutdown. The changelog remains the
    /// durable record for whoever is assigned it next.
    pub fn release(&self) -> Result<(), Error> {
        self.store.release(self.partition)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use accumulator_bus::InMemoryBus;
    use serde_json::json;
    use tempfile::TempDir;

    fn build() -> (TempDir, Arc<RocksStore>) {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(RocksStore::open(dir.path()).expect("open store"));
        (dir, store)
    }

    #[tokio::test]
    async fn end_to_end_join_emits_one_final() {
        let (_dir, store) = build();
        let bus = InMemoryBus::new();
        let processor = PartitionProcessor::new(0, store);
        processor.restore(&bus).await.unwrap();

        let kinds = json!(["Sykepengehistorikk", "AndreYtelser"]);
        processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 0,
                    timestamp: 0,
                    key: Some("b1".to_string()),
                    value: Ok(json!({"@id": "b1", "@behov": kinds})),
                },
            )
            .await
            .unwrap();
        processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 1,
                    timestamp: 0,
                    key: Some("b1".to_string()),
                    value: Ok(json!({
                        "@id": "b1", "@behov": kinds,
                        "@løsning": {"Sykepengehistorikk": 1},
                    })),
                },
            )
            .await
            .unwrap();
        processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 2,
                    timestamp: 0,
                    key: Some("b1".to_string()),
                    value: Ok(json!({
                        "@id": "b1", "@behov": kinds,
                        "@løsning": {"AndreYtelser": 2},
                    })),
                },
            )
            .await
            .unwrap();

        let emitted = bus.emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].0, "b1");
    }

    /// P8: a malformed record adjacent to well-formed ones for the same id does not perturb
    /// that id's accumulated state, and still reports its offset as commit-eligible.
    #[tokio::test]
    async fn malformed_record_is_isolated() {
        let (_dir, store) = build();
        let bus = InMemoryBus::new();
        let processor = PartitionProcessor::new(0, store);
        processor.restore(&bus).await.unwrap();

        processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 0,
                    timestamp: 0,
                    key: Some("b1".to_string()),
                    value: Ok(json!({"@id": "b1", "@behov": ["a"]})),
                },
            )
            .await
            .unwrap();

        let committed = processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 1,
                    timestamp: 0,
                    key: None,
                    value: Err(accumulator_bus::DecodeError("not json".to_string())),
                },
            )
            .await
            .unwrap();
        assert!(committed, "malformed records are still commit-eligible");

        let state = processor.store.get(0, "b1").unwrap().expect("untouched by malformed record");
        assert_eq!(state.required, Some(vec!["a".to_string()]));
    }

    /// P7: replaying a changelog into a fresh store reproduces the state a live store held.
    #[tokio::test]
    async fn restart_rebuilds_identical_state() {
        let (_dir, store) = build();
        let bus = InMemoryBus::new();
        let processor = PartitionProcessor::new(0, store);
        processor.restore(&bus).await.unwrap();

        processor
            .handle(
                &bus,
                Record {
                    partition: 0,
                    offset: 0,
                    timestamp: 0,
                    key: Some("b1".to_string()),
                    value: Ok(json!({"@id": "b1", "@behov": ["a"], "@løsning": {"a": 1}})),
                },
            )
            .await
            .unwrap();
        let before = processor.store.get(0, "b1").unwrap();

        let (_dir2, fresh_store) = build();
        let fresh_processor = PartitionProcessor::new(0, fresh_store);
        fresh_processor.restore(&bus).await.unwrap();
        let after = fresh_processor.store.get(0, "b1").unwrap();

        assert_eq!(before, after);
    }
}
