//! Wires the three components together: for each partition this instance is assigned, a
//! dedicated task owns a [`PartitionProcessor`], restoring its state on assignment and
//! releasing it on revoke or shutdown. The main loop dispatches inbound records to the right
//! partition's task and drives a periodic offset commit, matching the per-partition worker
//! model of §5.

use accumulator_bus::{Bus, RebalanceEvent, RebalanceEvents};
use accumulator_core::PartitionProcessor;
use accumulator_store::RocksStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tracks how many partition workers are currently alive, for the `/healthz` sink.
#[derive(Default)]
pub struct Health {
    active: AtomicUsize,
}

impl Health {
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

struct Worker {
    sender: mpsc::Sender<accumulator_bus::Record>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(
        partition: i32,
        store: Arc<RocksStore>,
        bus: Arc<dyn Bus>,
        commit_interval: Duration,
        cancel: CancellationToken,
        health: Arc<Health>,
    ) -> Worker {
        let (sender, mut receiver) = mpsc::channel(64);

        let handle = tokio::spawn(async move {
            let processor = PartitionProcessor::new(partition, store);

            if let Err(err) = processor.restore(bus.as_ref()).await {
                tracing::error!(partition, %err, "failed to restore partition, abandoning assignment");
                return;
            }

            health.active.fetch_add(1, Ordering::Relaxed);
            tracing::info!(partition, "partition worker started");

            let mut commit_tick = tokio::time::interval(commit_interval);
            commit_tick.tick().await; // first tick fires immediately; skip it

            loop {
                tokio::select! {
                    record = receiver.recv() => {
                        let Some(record) = record else { break };
                        let offset = record.offset;
                        match processor.handle(bus.as_ref(), record).await {
                            Ok(true) => {
                                if let Err(err) = bus.store_offset(partition, offset + 1) {
                                    tracing::warn!(partition, %err, "failed to store offset");
                                }
                            }
                            Ok(false) => {}
                            Err(err) => {
                                tracing::error!(partition, %err, "state store failure, abandoning partition");
                                break;
                            }
                        }
                    }
                    _ = commit_tick.tick() => {
                        if let Err(err) = bus.commit().await {
                            tracing::warn!(partition, %err, "periodic commit failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::info!(partition, "shutting down partition worker");
                        break;
                    }
                }
            }

            if let Err(err) = bus.commit().await {
                tracing::warn!(partition, %err, "final commit before teardown failed");
            }
            if let Err(err) = processor.release() {
                tracing::warn!(partition, %err, "failed to release partition state");
            }
            health.active.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(partition, "partition worker stopped");
        });

        Worker { sender, handle }
    }

    async fn shutdown(self) {
        drop(self.sender);
        if let Err(err) = self.handle.await {
            tracing::warn!(%err, "partition worker task panicked during shutdown");
        }
    }
}

/// Drives the supervisor loop until `cancel` fires or the bus reports a fatal error: reacts to
/// rebalance events by spawning/tearing down per-partition workers, and dispatches each inbound
/// record to the worker owning its partition.
pub async fn run(
    bus: Arc<dyn Bus>,
    mut rebalances: RebalanceEvents,
    store: Arc<RocksStore>,
    commit_interval: Duration,
    cancel: CancellationToken,
    health: Arc<Health>,
) {
    let mut workers: HashMap<i32, Worker> = HashMap::new();

    loop {
        tokio::select! {
            event = rebalances.recv() => {
                match event {
                    Some(RebalanceEvent::Assigned(partitions)) => {
                        for partition in partitions {
                            let worker = Worker::spawn(
                                partition,
                                store.clone(),
                                bus.clone(),
                                commit_interval,
                                cancel.child_token(),
                                health.clone(),
                            );
                            workers.insert(partition, worker);
                        }
                    }
                    Some(RebalanceEvent::Revoked(partitions)) => {
                        for partition in partitions {
                            if let Some(worker) = workers.remove(&partition) {
                                worker.shutdown().await;
                            }
                        }
                    }
                    None => {
                        tracing::warn!("rebalance channel closed, continuing with current assignment");
                    }
                }
            }
            record = bus.recv() => {
                match record {
                    Ok(record) => {
                        let partition = record.partition;
                        match workers.get(&partition) {
                            Some(worker) if worker.sender.send(record).await.is_ok() => {}
                            _ => tracing::warn!(partition, "record for unassigned or stopped partition, dropping"),
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "fatal bus read error, shutting down");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    for (_, worker) in workers {
        worker.shutdown().await;
    }
}
