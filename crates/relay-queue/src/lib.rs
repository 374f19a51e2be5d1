use async_trait::async_trait;

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "activemq")]
pub mod activemq;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// One raw message as fetched from a broker, before parsing.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Unparsed message body
    pub body: Vec<u8>,
    /// Broker handle used to ack/nack/change visibility
    pub receipt_handle: String,
    /// Broker-assigned message id, when the broker exposes one
    pub broker_message_id: Option<String>,
    /// Group property carried at the broker level (e.g. FIFO group id)
    pub message_group_id: Option<String>,
}

/// Approximate queue depth for monitoring.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub queue_identifier: String,
    /// Messages visible in the queue (pending)
    pub pending_messages: u64,
    /// Messages currently held by consumers (in-flight); 0 when the broker
    /// cannot report it
    pub in_flight_messages: u64,
}

/// Handle to one broker queue. Implementations wrap the broker client and its
/// acknowledgement semantics; the consumer driver owns the fetch loop.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Unique identifier for this queue handle.
    fn identifier(&self) -> &str;

    /// Fetch up to `max_messages` raw deliveries. May long-poll; the caller
    /// applies the hard per-request deadline.
    async fn fetch(&self, max_messages: u32) -> Result<Vec<RawDelivery>>;

    /// Remove the message from the queue. An already-expired or unknown
    /// receipt handle is benign.
    async fn ack(&self, receipt_handle: &str) -> Result<()>;

    /// Decline the message. Brokers with visibility timeouts treat this as a
    /// no-op and rely on redelivery; others clear their processing marker.
    async fn nack(&self, receipt_handle: &str) -> Result<()>;

    /// Whether `change_visibility` has any effect for this broker.
    fn supports_visibility_control(&self) -> bool {
        false
    }

    /// Hide the message for `seconds` before the broker re-offers it.
    async fn change_visibility(&self, _receipt_handle: &str, _seconds: u32) -> Result<()> {
        Ok(())
    }

    /// Approximate pending/in-flight counts; `None` when unsupported.
    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        Ok(None)
    }

    /// Release broker resources. Fetches after this return `QueueError::Stopped`.
    async fn stop(&self);
}
