use crate::{DecodeError, Error, Record, RebalanceEvent, RebalanceEvents};
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything the bus needs to reach the cluster. Security mechanisms and bootstrap discovery
/// beyond the bare `security.protocol`/SASL properties are an external collaborator's concern
/// (§1); this struct only carries what the core's configuration surface enumerates (§6).
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub changelog_topic: String,
    pub consumer_group_id: String,
    pub service_user: Option<(String, String)>,
}

/// Forwards librdkafka rebalance callbacks onto an unbounded channel. The callback itself runs
/// on librdkafka's internal poll thread and must not block, so it only ever does a
/// non-blocking send; the receiving end lives on the worker supervisor's own task.
struct RebalanceForwarder {
    tx: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for RebalanceForwarder {}

impl ConsumerContext for RebalanceForwarder {
    fn post_rebalance(&self, rebalance: &Rebalance) {
        let event = match rebalance {
            Rebalance::Assign(tpl) => {
                RebalanceEvent::Assigned(tpl.elements().iter().map(|e| e.partition()).collect())
            }
            Rebalance::Revoke(tpl) => {
                RebalanceEvent::Revoked(tpl.elements().iter().map(|e| e.partition()).collect())
            }
            Rebalance::Error(err) => {
                tracing::warn!(%err, "rebalance error reported by librdkafka");
                return;
            }
        };
        if self.tx.send(event).is_err() {
            tracing::debug!("rebalance receiver dropped, supervisor must be shutting down");
        }
    }
}

type RebalancingConsumer = StreamConsumer<RebalanceForwarder>;

pub struct KafkaBus {
    consumer: RebalancingConsumer,
    producer: FutureProducer,
    config: BusConfig,
}

impl KafkaBus {
    pub fn connect(config: BusConfig) -> Result<(Self, RebalanceEvents), Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", &config.consumer_group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");
        if let Some((username, password)) = &config.service_user {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanism", "SCRAM-SHA-512")
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        let consumer: RebalancingConsumer =
            client_config.create_with_context(RebalanceForwarder { tx })?;
        consumer.subscribe(&[config.topic.as_str()])?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .create()?;

        Ok((
            KafkaBus {
                consumer,
                producer,
                config,
            },
            RebalanceEvents(rx),
        ))
    }

    async fn publish(
        &self,
        topic: &str,
        partition: Option<i32>,
        key: String,
        value: serde_json::Value,
    ) -> Result<(), Error> {
        let payload = serde_json::to_vec(&value).expect("Value always serializes");
        let mut record = FutureRecord::to(topic).key(&key).payload(&payload);
        if let Some(partition) = partition {
            record = record.partition(partition);
        }

        match self.producer.send(record, Timeout::After(Duration::from_secs(30))).await {
            Ok(_) => Ok(()),
            Err((err, _owned)) => Err(Error::Kafka(err)),
        }
    }
}

#[async_trait::async_trait]
impl crate::Bus for KafkaBus {
    async fn recv(&self) -> Result<Record, Error> {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.consumer.recv().await {
                Ok(msg) => {
                    let value = match msg.payload() {
                        Some(bytes) => serde_json::from_slice::<serde_json::Value>(bytes)
                            .map_err(|e| DecodeError(e.to_string())),
                        None => Err(DecodeError("empty payload".to_string())),
                    };
                    return Ok(Record {
                        partition: msg.partition(),
                        offset: msg.offset(),
                        timestamp: msg.timestamp().to_millis().unwrap_or_default(),
                        key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                        value,
                    });
                }
                Err(err) if is_transient(&err) => {
                    tracing::warn!(%err, ?backoff, "retrying transient bus read error");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                }
                Err(err) => return Err(Error::Kafka(err)),
            }
        }
    }

    async fn send(&self, key: String, value: serde_json::Value) -> Result<(), Error> {
        self.publish(&self.config.topic, None, key, value).await
    }

    async fn send_changelog(
        &self,
        partition: i32,
        key: String,
        value: serde_json::Value,
    ) -> Result<(), Error> {
        self.publish(&self.config.changelog_topic, Some(partition), key, value)
            .await
    }

    async fn restore_changelog(
        &self,
        partition: i32,
    ) -> Result<Vec<(String, serde_json::Value)>, Error> {
        let topic = self.config.changelog_topic.clone();
        let bootstrap = self.config.bootstrap_servers.clone();

        tokio::task::spawn_blocking(move || -> Result<_, Error> {
            use rdkafka::consumer::BaseConsumer;

            let restore_consumer: BaseConsumer = ClientConfig::new()
                .set("bootstrap.servers", &bootstrap)
                .set("group.id", "changelog-restore")
                .set("enable.auto.commit", "false")
                .create()?;

            let (_low, high) = restore_consumer
                .fetch_watermarks(&topic, partition, Duration::from_secs(30))
                .map_err(Error::Kafka)?;

            if high == 0 {
                return Ok(Vec::new());
            }

            let mut tpl = TopicPartitionList::new();
            tpl.add_partition_offset(&topic, partition, Offset::Beginning)?;
            restore_consumer.assign(&tpl)?;

            let mut entries = Vec::new();
            loop {
                let Some(result) = restore_consumer.poll(Duration::from_secs(10)) else {
                    return Err(Error::Timeout("changelog restore"));
                };
                let msg = result?;
                if let (Some(key), Some(payload)) = (msg.key(), msg.payload()) {
                    let key = String::from_utf8_lossy(key).into_owned();
                    let value: serde_json::Value = serde_json::from_slice(payload)
                        .unwrap_or(serde_json::Value::Null);
                    entries.push((key, value));
                }
                if msg.offset() + 1 >= high {
                    break;
                }
            }
            Ok(entries)
        })
        .await
        .expect("restore task does not panic")
    }

    fn store_offset(&self, partition: i32, offset: i64) -> Result<(), Error> {
        self.consumer
            .store_offset(&self.config.topic, partition, offset)
            .map_err(Error::Kafka)
    }

    async fn commit(&self) -> Result<(), Error> {
        let consumer = &self.consumer;
        consumer
            .commit_consumer_state(CommitMode::Async)
            .or_else(|err| match err {
                // No stored offsets yet is not an error worth surfacing.
                KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::NoOffset) => Ok(()),
                other => Err(other),
            })
            .map_err(Error::Kafka)
    }
}

fn is_transient(err: &KafkaError) -> bool {
    matches!(
        err,
        KafkaError::MessageConsumption(
            rdkafka::types::RDKafkaErrorCode::AllBrokersDown
                | rdkafka::types::RDKafkaErrorCode::RequestTimedOut
                | rdkafka::types::RDKafkaErrorCode::TransportError
        )
    )
}
