/// Errors surfaced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bus error during changelog replay: {0}")]
    Bus(#[from] accumulator_bus::Error),

    #[error("partition {0} has no open column family (not loaded via restore())")]
    PartitionNotLoaded(i32),
}
