use std::collections::HashSet;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use super::{
    topic_matches, Binding, DelayQueue, Delivery, EventBus, OutgoingMessage, Subscription, Topology,
    DEFAULT_EXCHANGE,
};
use crate::config::BrokerArgs;
use crate::error::{BusError, PublishError};
use crate::shutdown::Shutdown;

const EXPIRATION_HEADER: &str = "x-expiration-ms";
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka backend. Exchanges are topics, routing keys are record keys,
/// queues are consumer groups filtering on their bindings.
pub struct KafkaBus {
    brokers: String,
    partitions: i32,
    replication: i32,
    producer: FutureProducer,
    topology: RwLock<Topology>,
    forwarders: Mutex<HashSet<String>>,
    shutdown: Shutdown,
}

impl KafkaBus {
    pub fn connect(args: &BrokerArgs, shutdown: Shutdown) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &args.kafka_brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        Ok(Self {
            brokers: args.kafka_brokers.clone(),
            partitions: args.topic_partitions,
            replication: args.replication_factor,
            producer,
            topology: RwLock::new(Topology::default()),
            forwarders: Mutex::new(HashSet::new()),
            shutdown,
        })
    }

    fn consumer(&self, group: &str) -> Result<StreamConsumer, BusError> {
        ClientConfig::new()
            .set("group.id", group)
            .set("bootstrap.servers", &self.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BusError::Subscribe {
                queue: group.to_string(),
                reason: e.to_string(),
            })
    }

    async fn create_topics(&self, names: &[String]) -> Result<(), BusError> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .create()
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let topics: Vec<NewTopic> = names
            .iter()
            .map(|name| NewTopic::new(name, self.partitions, TopicReplication::Fixed(self.replication)))
            .collect();

        let results = admin
            .create_topics(&topics, &AdminOptions::new())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "created topic"),
                Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => debug!(topic = %topic, "topic already exists"),
                Err((topic, code)) => {
                    return Err(BusError::Declare {
                        name: topic,
                        reason: code.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    fn start_forwarder(&self, queue: &DelayQueue) -> Result<(), BusError> {
        let mut running = self.forwarders.lock().unwrap_or_else(|p| p.into_inner());
        if running.contains(&queue.name) {
            return Ok(());
        }
        let consumer = self.consumer(&queue.name)?;
        consumer
            .subscribe(&[queue.name.as_str()])
            .map_err(|e| BusError::Subscribe {
                queue: queue.name.clone(),
                reason: e.to_string(),
            })?;

        running.insert(queue.name.clone());
        tokio::spawn(forward_expired(
            self.producer.clone(),
            consumer,
            queue.clone(),
            self.shutdown.clone(),
        ));
        Ok(())
    }
}

fn topic_for<'a>(exchange: &'a str, routing_key: &'a str) -> &'a str {
    if exchange == DEFAULT_EXCHANGE {
        routing_key
    } else {
        exchange
    }
}

fn publish_error(exchange: &str, routing_key: &str, err: KafkaError) -> PublishError {
    match err {
        KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure,
        ) => PublishError::Disconnected,
        other => PublishError::Rejected {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), BusError> {
        let mut topics: Vec<String> = topology.exchanges.clone();
        topics.extend(topology.delay_queues.iter().map(|q| q.name.clone()));
        self.create_topics(&topics).await?;

        {
            let mut known = self.topology.write().unwrap_or_else(|p| p.into_inner());
            for exchange in &topology.exchanges {
                if !known.exchanges.contains(exchange) {
                    known.exchanges.push(exchange.clone());
                }
            }
            for binding in &topology.bindings {
                if !known.bindings.contains(binding) {
                    known.bindings.push(binding.clone());
                }
            }
            for delay in &topology.delay_queues {
                if !known.delay_queues.contains(delay) {
                    known.delay_queues.push(delay.clone());
                }
            }
        }

        for delay in &topology.delay_queues {
            self.start_forwarder(delay)?;
        }
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), PublishError> {
        let topic = topic_for(&message.exchange, &message.routing_key);
        let mut headers = OwnedHeaders::new();
        let expiration = message.expiration.map(|e| e.as_millis().to_string());
        if let Some(millis) = &expiration {
            headers = headers.insert(Header {
                key: EXPIRATION_HEADER,
                value: Some(millis.as_str()),
            });
        }

        let record = FutureRecord::to(topic)
            .key(&message.routing_key)
            .payload(&message.payload)
            .headers(headers);

        self.producer
            .send(record, SEND_TIMEOUT)
            .await
            .map_err(|(e, _)| publish_error(&message.exchange, &message.routing_key, e))?;

        debug!(exchange = %message.exchange, routing_key = %message.routing_key, "published message");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn Subscription>, BusError> {
        let bindings: Vec<Binding> = {
            let known = self.topology.read().unwrap_or_else(|p| p.into_inner());
            known.bindings_for(queue).cloned().collect()
        };
        if bindings.is_empty() {
            return Err(BusError::UnknownQueue(queue.to_string()));
        }

        let mut topics: Vec<&str> = bindings.iter().map(|b| b.exchange.as_str()).collect();
        topics.sort_unstable();
        topics.dedup();

        let consumer = self.consumer(queue)?;
        consumer.subscribe(&topics).map_err(|e| BusError::Subscribe {
            queue: queue.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(KafkaSubscription {
            consumer,
            queue: queue.to_string(),
            bindings,
            in_flight: None,
            requeued: None,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

impl Position {
    fn of(message: &OwnedMessage) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }
}

struct KafkaSubscription {
    consumer: StreamConsumer,
    queue: String,
    bindings: Vec<Binding>,
    in_flight: Option<Position>,
    /// Last requeued record and how many times it has been delivered.
    requeued: Option<(Position, u32)>,
}

impl KafkaSubscription {
    fn commit(&self, position: &Position) -> Result<(), BusError> {
        commit_past(&self.consumer, position).map_err(|e| BusError::Settle {
            queue: self.queue.clone(),
            reason: e.to_string(),
        })
    }

    fn take_in_flight(&mut self) -> Result<Position, BusError> {
        self.in_flight.take().ok_or_else(|| BusError::Settle {
            queue: self.queue.clone(),
            reason: "no delivery in flight".to_string(),
        })
    }

    fn is_bound(&self, topic: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.exchange == topic && topic_matches(&b.routing_key, routing_key))
    }
}

fn commit_past(consumer: &StreamConsumer, position: &Position) -> Result<(), KafkaError> {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset + 1))?;
    consumer.commit(&tpl, CommitMode::Sync)
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn next(&mut self) -> Option<Result<Delivery, BusError>> {
        if self.in_flight.is_some() {
            return Some(Err(BusError::Settle {
                queue: self.queue.clone(),
                reason: "previous delivery not settled".to_string(),
            }));
        }
        loop {
            let message = match self.consumer.recv().await {
                Ok(m) => m.detach(),
                Err(e) => return Some(Err(BusError::Transport(e.to_string()))),
            };
            let position = Position::of(&message);
            let routing_key = message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned())
                .unwrap_or_default();

            if !self.is_bound(&position.topic, &routing_key) {
                if let Err(e) = self.commit(&position) {
                    return Some(Err(e));
                }
                continue;
            }

            let delivery_count = match &self.requeued {
                Some((requeued, count)) if *requeued == position => count + 1,
                _ => 1,
            };
            self.in_flight = Some(position);
            return Some(Ok(Delivery {
                routing_key,
                payload: message.payload().unwrap_or_default().to_vec(),
                redelivered: delivery_count > 1,
                delivery_count,
            }));
        }
    }

    async fn ack(&mut self) -> Result<(), BusError> {
        let position = self.take_in_flight()?;
        self.requeued = None;
        self.commit(&position)
    }

    async fn nack(&mut self, requeue: bool) -> Result<(), BusError> {
        let position = self.take_in_flight()?;
        if !requeue {
            self.requeued = None;
            return self.commit(&position);
        }
        self.consumer
            .seek(&position.topic, position.partition, Offset::Offset(position.offset), SEND_TIMEOUT)
            .map_err(|e| BusError::Settle {
                queue: self.queue.clone(),
                reason: e.to_string(),
            })?;
        let count = match &self.requeued {
            Some((requeued, count)) if *requeued == position => count + 1,
            _ => 1,
        };
        self.requeued = Some((position, count));
        Ok(())
    }
}

fn expiration_of(message: &OwnedMessage) -> Option<Duration> {
    let headers = message.headers()?;
    headers
        .iter()
        .find(|h| h.key == EXPIRATION_HEADER)
        .and_then(|h| h.value)
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// How long a record published at `published_ms` still has to wait.
fn remaining_hold(published_ms: Option<i64>, now_ms: i64, hold: Duration) -> Duration {
    let hold_ms = i64::try_from(hold.as_millis()).unwrap_or(i64::MAX);
    let Some(published_ms) = published_ms else {
        return hold;
    };
    let due = published_ms.saturating_add(hold_ms);
    Duration::from_millis(u64::try_from(due - now_ms).unwrap_or(0))
}

/// Emulates broker TTL + dead-lettering for one delay queue: each record is
/// held until it expires, then re-published to the dead-letter target.
async fn forward_expired(producer: FutureProducer, consumer: StreamConsumer, queue: DelayQueue, mut shutdown: Shutdown) {
    info!(queue = %queue.name, ttl_ms = queue.ttl.as_millis() as u64, "delay queue forwarder started");
    let target = topic_for(&queue.dead_letter_exchange, &queue.dead_letter_routing_key).to_string();

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            received = consumer.recv() => received,
        };
        let message = match received {
            Ok(m) => m.detach(),
            Err(e) => {
                warn!(queue = %queue.name, error = %e, "delay queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let hold = expiration_of(&message).map_or(queue.ttl, |e| e.min(queue.ttl));
        let wait = remaining_hold(
            message.timestamp().to_millis(),
            chrono::Utc::now().timestamp_millis(),
            hold,
        );
        tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        let position = Position::of(&message);
        let payload = message.payload().unwrap_or_default();
        let record = FutureRecord::to(&target)
            .key(&queue.dead_letter_routing_key)
            .payload(payload);
        if let Err((e, _)) = producer.send(record, SEND_TIMEOUT).await {
            error!(queue = %queue.name, error = %e, "failed to dead-letter expired message, retrying");
            if let Err(e) = consumer.seek(&position.topic, position.partition, Offset::Offset(position.offset), SEND_TIMEOUT) {
                error!(queue = %queue.name, error = %e, "failed to rewind delay queue");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }
        if let Err(e) = commit_past(&consumer, &position) {
            warn!(queue = %queue.name, error = %e, "failed to commit forwarded message");
        }
    }
    info!(queue = %queue.name, "delay queue forwarder stopped");
}
