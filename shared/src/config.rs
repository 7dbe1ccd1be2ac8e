use clap::Args;

/// Broker flags shared by every service binary.
#[derive(Debug, Clone, Args)]
pub struct BrokerArgs {
    #[arg(long, env = "KAFKA_BROKERS", default_value = "localhost:9092")]
    pub kafka_brokers: String,

    #[arg(long, env = "KAFKA_TOPIC_PARTITIONS", default_value_t = 1)]
    pub topic_partitions: i32,

    #[arg(long, env = "KAFKA_REPLICATION_FACTOR", default_value_t = 1)]
    pub replication_factor: i32,

    /// Stop requeueing a failing message after this many deliveries. Unbounded when unset.
    #[arg(long, env = "MAX_DELIVERIES")]
    pub max_deliveries: Option<u32>,
}
