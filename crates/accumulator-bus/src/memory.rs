use crate::{Bus, Error, Record};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// An in-process [`Bus`] double with no network or broker involved, used to drive the
/// accumulator's scenario tests (E1-E5) and the restart-fidelity property deterministically.
pub struct InMemoryBus {
    incoming_tx: mpsc::UnboundedSender<Record>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Record>>,
    emitted: Mutex<Vec<(String, serde_json::Value)>>,
    changelog: Mutex<HashMap<i32, Vec<(String, serde_json::Value)>>>,
    committed: Mutex<HashMap<i32, i64>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        InMemoryBus {
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            emitted: Mutex::new(Vec::new()),
            changelog: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue an inbound record for a future `recv()` to return.
    pub fn push(&self, partition: i32, offset: i64, key: &str, value: serde_json::Value) {
        self.incoming_tx
            .send(Record {
                partition,
                offset,
                timestamp: 0,
                key: Some(key.to_string()),
                value: Ok(value),
            })
            .expect("receiver is held by self and never dropped first");
    }

    /// Enqueue an inbound record whose payload failed to decode as JSON.
    pub fn push_malformed(&self, partition: i32, offset: i64, reason: &str) {
        self.incoming_tx
            .send(Record {
                partition,
                offset,
                timestamp: 0,
                key: None,
                value: Err(crate::DecodeError(reason.to_string())),
            })
            .expect("receiver is held by self and never dropped first");
    }

    /// All records published via [`Bus::send`], in publication order.
    pub fn emitted(&self) -> Vec<(String, serde_json::Value)> {
        self.emitted.lock().unwrap().clone()
    }

    /// Seed the changelog for `partition` as though it had been written by a prior process,
    /// for restart-fidelity tests.
    pub fn seed_changelog(&self, partition: i32, entries: Vec<(String, serde_json::Value)>) {
        self.changelog.lock().unwrap().insert(partition, entries);
    }

    pub fn committed_offset(&self, partition: i32) -> Option<i64> {
        self.committed.lock().unwrap().get(&partition).copied()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Bus for InMemoryBus {
    async fn recv(&self) -> Result<Record, Error> {
        let mut rx = self.incoming_rx.lock().unwrap();
        // A test double never sees a real transient error; a closed channel means the test
        // dropped its sender deliberately and is done driving this bus.
        rx.try_recv()
            .map_err(|_| Error::Timeout("in-memory bus has no more queued records"))
    }

    async fn send(&self, key: String, value: serde_json::Value) -> Result<(), Error> {
        self.emitted.lock().unwrap().push((key, value));
        Ok(())
    }

    async fn send_changelog(
        &self,
        partition: i32,
        key: String,
        value: serde_json::Value,
    ) -> Result<(), Error> {
        self.changelog
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .push((key, value));
        Ok(())
    }

    async fn restore_changelog(
        &self,
        partition: i32,
    ) -> Result<Vec<(String, serde_json::Value)>, Error> {
        Ok(self
            .changelog
            .lock()
            .unwrap()
            .get(&partition)
            .cloned()
            .unwrap_or_default())
    }

    fn store_offset(&self, partition: i32, offset: i64) -> Result<(), Error> {
        self.committed.lock().unwrap().insert(partition, offset);
        Ok(())
    }

    async fn commit(&self) -> Result<(), Error> {
        Ok(())
    }
}
