//! The intake queue contract.
//!
//! Delivery is at-least-once: a message stays owned by its consumer until it is
//! acknowledged, and a crash or a `nack(requeue = true)` hands it out again.
//! Consumers must therefore be idempotent.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::delivery::Delivery;
use crate::topology::Topology;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The delivery was already settled, or never handed out.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(String),

    #[error("topology error: {0}")]
    Topology(String),
}

/// Durable, topic-routed publish/subscribe with dead-lettering.
///
/// `declare` must run before anything is published; messages whose routing key
/// matches no bound queue are dropped.
#[async_trait]
pub trait IntakeQueue: Send + Sync {
    /// Declare exchanges, queues, bindings and dead-letter wiring. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), QueueError>;

    /// Publish `payload` to the topology's publish exchange under `routing_key`.
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next message on `queue`.
    async fn next_delivery(
        &self,
        queue: &str,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    /// Remove the message from the queue.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Give the message back. With `requeue` it is redelivered first (or
    /// dead-lettered once it exceeds the queue's delivery limit); without, it
    /// is dead-lettered straight away.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError>;

    /// Messages on `queue` not yet acknowledged.
    async fn depth(&self, queue: &str) -> Result<u64, QueueError>;
}

/// Serialize `message` as JSON and publish it.
pub async fn publish_json<T>(
    queue: &dyn IntakeQueue,
    routing_key: &str,
    message: &T,
) -> Result<(), QueueError>
where
    T: Serialize + Sync + ?Sized,
{
    let payload =
        serde_json::to_vec(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
    queue.publish(routing_key, &payload).await
}
