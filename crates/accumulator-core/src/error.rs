/// Errors that abandon a partition worker. Malformed individual records are not errors — they
/// are a value produced by [`crate::state_machine::apply`] and handled inline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bus error: {0}")]
    Bus(#[from] accumulator_bus::Error),

    #[error("state store error: {0}")]
    Store(#[from] accumulator_store::Error),
}
