/// Errors surfaced across the partitioned-log boundary.
///
/// Transient broker errors are retried internally (see [`crate::KafkaBus::recv`]) and never
/// reach a caller as this type; what does reach a caller is either a hard connection/config
/// failure or a malformed payload, which the accumulator counts and drops rather than treats
/// as fatal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
