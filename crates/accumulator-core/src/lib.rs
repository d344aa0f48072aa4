//! The accumulation engine: a per-correlation-id state machine (§4.3) plus the orchestration
//! that wraps it with a state store and a bus. See [`state_machine::apply`] for the pure
//! transition logic and [`processor::PartitionProcessor`] for the per-partition driver a
//! worker supervisor runs.

mod error;
pub mod processor;
pub mod state_machine;

pub use error::Error;
pub use processor::PartitionProcessor;
