//! The changelog-backed key/value store behind each partition's need state.
//!
//! Mirrors the cache-plus-`WriteBatch` shape of a Kafka Streams state store: a local RocksDB
//! instance holds one column family per owned partition, and every mutation is shadowed by a
//! write to that partition's changelog topic via [`accumulator_bus::Bus`] before it is
//! considered durable. On restart (or on a rebalance handing a partition to a new worker), the
//! column family is rebuilt from scratch by replaying the changelog from its beginning.

mod error;

pub use error::Error;

use accumulator_bus::Bus;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// The accumulated state for a single correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeedState {
    pub id: String,
    /// `None` until some observed record for this id has carried a `@behov` field at all;
    /// `Some(vec![])` once a record explicitly declared an empty requirement set. The
    /// distinction matters: an id with no `@behov` ever observed can never be complete, while
    /// one with an explicitly empty `@behov` is complete on first contact.
    pub required: Option<Vec<String>>,
    pub template: serde_json::Value,
    pub solutions: BTreeMap<String, serde_json::Value>,
    pub last_completed_at: Option<i64>,
}

impl NeedState {
    /// True once every required answer kind has a recorded solution. Evaluated as a pure
    /// superset test over the keys of `solutions`, independent of value content or ordering.
    /// An id whose `required` set is still unknown is never complete.
    pub fn is_complete(&self) -> bool {
        match &self.required {
            Some(required) => required.iter().all(|kind| self.solutions.contains_key(kind)),
            None => false,
        }
    }
}

fn cf_name(partition: i32) -> String {
    format!("partition-{partition}")
}

/// A RocksDB-backed store with one column family per owned partition.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open (or create) the on-disk store at `path`, attaching any column families already
    /// present from a prior run so a restart doesn't lose partitions it was mid-restore on.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);

        let existing_cfs = DB::list_cf(&db_opts, path).unwrap_or_default();
        let descriptors = existing_cfs
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&db_opts, path, descriptors)?;
        Ok(RocksStore { db })
    }

    /// Load (creating if absent) the local column family for `partition`, then replay its
    /// changelog from the beginning so the in-process view matches what was last durably
    /// written, even if a crash happened after a local write but before offset commit.
    pub async fn restore(&self, bus: &dyn Bus, partition: i32) -> Result<(), Error> {
        let name = cf_name(partition);
        if self.db.cf_handle(&name).is_none() {
            self.db.create_cf(&name, &Options::default())?;
        }

        let entries = bus.restore_changelog(partition).await?;
        let cf = self
            .db
            .cf_handle(&name)
            .ok_or(Error::PartitionNotLoaded(partition))?;

        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            if value.is_null() {
                // A null changelog value is a tombstone, matching the usual compacted-topic
                // convention even though this accumulator never emits one today.
                batch.delete_cf(cf, key.as_bytes());
            } else {
                let state: NeedState = serde_json::from_value(value)?;
                batch.put_cf(cf, key.as_bytes(), serde_json::to_vec(&state)?);
            }
        }
        self.db.write(batch)?;
        tracing::debug!(partition, "restored partition from changelog");
        Ok(())
    }

    /// Drop the local column family for a partition this worker no longer owns. The changelog
    /// topic remains the durable record; whoever is assigned the partition next rebuilds it
    /// with [`Self::restore`].
    pub fn release(&self, partition: i32) -> Result<(), Error> {
        match self.db.drop_cf(&cf_name(partition)) {
            Ok(()) => {
                tracing::debug!(partition, "released partition column family");
                Ok(())
            }
            Err(err) if err.to_string().contains("Invalid column family") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn get(&self, partition: i32, id: &str) -> Result<Option<NeedState>, Error> {
        let cf = self
            .db
            .cf_handle(&cf_name(partition))
            .ok_or(Error::PartitionNotLoaded(partition))?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `state` locally, then shadow the write onto the changelog. The local write lands
    /// first so a reader within this process sees its own write immediately; if the process
    /// crashes before the changelog write lands, the changelog stays authoritative on restart
    /// and the triggering record is simply reprocessed once its offset was never committed.
    pub async fn put(
        &self,
        bus: &dyn Bus,
        partition: i32,
        id: &str,
        state: &NeedState,
    ) -> Result<(), Error> {
        let cf = self
            .db
            .cf_handle(&cf_name(partition))
            .ok_or(Error::PartitionNotLoaded(partition))?;
        let bytes = serde_json::to_vec(state)?;
        self.db.put_cf(cf, id.as_bytes(), bytes)?;

        bus.send_changelog(partition, id.to_string(), serde_json::to_value(state)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use accumulator_bus::InMemoryBus;
    use tempfile::TempDir;

    fn build_test_store() -> (TempDir, RocksStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = RocksStore::open(dir.path()).expect("open rocks store");
        (dir, store)
    }

    fn sample_state(id: &str) -> NeedState {
        NeedState {
            id: id.to_string(),
            required: Some(vec!["a".to_string(), "b".to_string()]),
            template: serde_json::json!({"@id": id}),
            solutions: BTreeMap::new(),
            last_completed_at: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, store) = build_test_store();
        let bus = InMemoryBus::new();
        store.restore(&bus, 0).await.unwrap();

        let state = sample_state("need-1");
        store.put(&bus, 0, "need-1", &state).await.unwrap();

        let loaded = store.get(0, "need-1").unwrap().expect("present");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn restore_rebuilds_from_changelog() {
        let (_dir, store) = build_test_store();
        let bus = InMemoryBus::new();

        let mut state = sample_state("need-1");
        state.solutions.insert("a".to_string(), serde_json::json!("x"));
        bus.seed_changelog(
            3,
            vec![("need-1".to_string(), serde_json::to_value(&state).unwrap())],
        );

        store.restore(&bus, 3).await.unwrap();

        let loaded = store.get(3, "need-1").unwrap().expect("present");
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn release_then_restore_is_idempotent() {
        let (_dir, store) = build_test_store();
        let bus = InMemoryBus::new();
        store.restore(&bus, 1).await.unwrap();
        store.release(1).unwrap();
        // Releasing an unowned partition again must not error.
        store.release(1).unwrap();
        store.restore(&bus, 1).await.unwrap();
        assert_eq!(store.get(1, "missing").unwrap(), None);
    }

    #[test]
    fn is_complete_is_a_superset_test() {
        let mut state = sample_state("need-1");
        assert!(!state.is_complete());
        state.solutions.insert("a".to_string(), serde_json::json!(1));
        assert!(!state.is_complete());
        state.solutions.insert("b".to_string(), serde_json::json!(2));
        assert!(state.is_complete());
        state.solutions.insert("c".to_string(), serde_json::json!(3));
        assert!(state.is_complete(), "extra solutions beyond required still count as complete");
    }
}
