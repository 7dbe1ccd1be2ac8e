//! Messaging plumbing shared by order-service and payment-service: wire
//! events, the broker abstraction, the consumer loop and the delay queue.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod delay;
pub mod error;
pub mod events;
pub mod shutdown;
pub mod telemetry;

pub use bus::{publish_json, DelayQueue, Delivery, EventBus, InMemoryBus, KafkaBus, OutgoingMessage, Subscription, Topology};
pub use config::BrokerArgs;
pub use consumer::{spawn_consumer, ConsumerOptions};
pub use delay::{payment_timeout_queue, TimeoutScheduler};
pub use error::{BusError, HandlerError, PublishError, RepositoryError};
pub use events::*;
pub use shutdown::Shutdown;
