use thiserror::Error;

/// A message could not be handed to the broker.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("broker connection is down")]
    Disconnected,

    #[error("failed to serialize payload for {routing_key}: {reason}")]
    Serialization { routing_key: String, reason: String },

    #[error("broker rejected message for {exchange}/{routing_key}: {reason}")]
    Rejected {
        exchange: String,
        routing_key: String,
        reason: String,
    },
}

/// Topology and subscription failures.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("failed to declare {name}: {reason}")]
    Declare { name: String, reason: String },

    #[error("queue {0} has not been declared")]
    UnknownQueue(String),

    #[error("failed to subscribe to {queue}: {reason}")]
    Subscribe { queue: String, reason: String },

    #[error("failed to settle delivery on {queue}: {reason}")]
    Settle { queue: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    #[error("datastore unavailable: {0}")]
    Unavailable(String),

    #[error("query failed: {0}")]
    Query(String),

    /// The datastore refused the data itself. Retrying the same write fails the same way.
    #[error("rejected by datastore: {0}")]
    Rejected(String),
}

/// Postgres data exceptions (SQLSTATE class 22) that diesel reports as `Unknown`.
const DATA_EXCEPTION_MARKERS: [&str; 5] = [
    "out of range",
    "numeric field overflow",
    "value too long",
    "invalid input syntax",
    "invalid input value",
];

impl RepositoryError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        RepositoryError::Unavailable(err.to_string())
    }

    pub fn is_transient(&self) -> bool {
        !matches!(self, RepositoryError::Rejected(_))
    }
}

impl From<diesel::result::Error> for RepositoryError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => RepositoryError::NotFound,
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::ClosedConnection,
                info,
            ) => RepositoryError::Unavailable(info.message().to_string()),
            // Unique violations stay transient: the next delivery sees the winning row.
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::CheckViolation
                | diesel::result::DatabaseErrorKind::NotNullViolation
                | diesel::result::DatabaseErrorKind::ForeignKeyViolation,
                info,
            ) => RepositoryError::Rejected(info.message().to_string()),
            diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::Unknown, info)
                if DATA_EXCEPTION_MARKERS
                    .iter()
                    .any(|marker| info.message().contains(marker)) =>
            {
                RepositoryError::Rejected(info.message().to_string())
            }
            other => RepositoryError::Query(other.to_string()),
        }
    }
}

/// Outcome of an event handler, classified for the ack/nack decision.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The event can never be processed (bad id, missing field).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// The event refers to an aggregate this service does not know.
    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

impl HandlerError {
    /// Transient failures are requeued, everything else is dropped.
    pub fn is_retryable(&self) -> bool {
        match self {
            HandlerError::Repository(e) => e.is_transient(),
            HandlerError::Publish(_) => true,
            HandlerError::InvalidEvent(_) | HandlerError::NotFound(_) => false,
        }
    }
}
