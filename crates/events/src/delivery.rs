use serde::{Deserialize, Serialize};

/// Why a message ended up on a dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// Negatively acknowledged without requeue.
    Rejected,
    /// Requeued more times than the source queue allows.
    DeliveryLimit,
}

/// Provenance attached to a dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    /// Queue the message was dead-lettered from.
    pub queue: String,
    pub reason: DeathReason,
    pub original_routing_key: String,
    /// Times this message has been dead-lettered from `queue`.
    pub count: u32,
}

/// A message handed to a consumer. It stays unacknowledged until the consumer
/// calls `ack` or `nack` with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned handle for ack/nack.
    pub tag: String,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
    pub death: Option<DeathRecord>,
}

impl Delivery {
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}
