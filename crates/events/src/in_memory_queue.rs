//! In-memory broker for tests/dev.
//!
//! Follows the AMQP semantics the intake pipeline relies on: topic routing,
//! unacknowledged deliveries owned by the consumer, requeue at the head of the
//! queue, dead-lettering through the queue's dead-letter exchange. Nothing
//! survives the process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::delivery::{DeathReason, DeathRecord, Delivery};
use crate::queue::{IntakeQueue, QueueError};
use crate::topology::Topology;

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    /// Deliveries so far.
    delivery_count: u32,
    death: Option<DeathRecord>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<String, StoredMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topology: Option<Topology>,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
}

#[derive(Debug, Default)]
pub struct InMemoryIntakeQueue {
    state: Mutex<BrokerState>,
    arrivals: Notify,
}

impl InMemoryIntakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages handed out on `queue` and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// Messages waiting on `queue`, oldest first.
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn try_take(&self, queue: &str) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.lock();
        state.next_tag += 1;
        let tag = format!("{queue}:{}", state.next_tag);

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        let Some(mut msg) = q.ready.pop_front() else {
            return Ok(None);
        };
        msg.delivery_count += 1;

        let delivery = Delivery {
            tag: tag.clone(),
            queue: queue.to_string(),
            routing_key: msg.routing_key.clone(),
            body: msg.body.clone(),
            delivery_count: msg.delivery_count,
            death: msg.death.clone(),
        };
        q.unacked.insert(tag, msg);
        Ok(Some(delivery))
    }
}

fn take_unacked(
    state: &mut BrokerState,
    delivery: &Delivery,
) -> Result<StoredMessage, QueueError> {
    state
        .queues
        .get_mut(&delivery.queue)
        .ok_or_else(|| QueueError::UnknownQueue(delivery.queue.clone()))?
        .unacked
        .remove(&delivery.tag)
        .ok_or_else(|| QueueError::UnknownDelivery(delivery.tag.clone()))
}

/// Route `msg` to every queue bound to `exchange` under its routing key.
/// Returns the number of queues it reached.
fn route(state: &mut BrokerState, exchange: &str, msg: StoredMessage) -> usize {
    let Some(topology) = &state.topology else {
        return 0;
    };
    let targets: Vec<String> = topology
        .routes(exchange, &msg.routing_key)
        .map(|q| q.name.clone())
        .collect();

    for name in &targets {
        state
            .queues
            .entry(name.clone())
            .or_default()
            .ready
            .push_back(msg.clone());
    }
    targets.len()
}

fn dead_letter(state: &mut BrokerState, from_queue: &str, msg: StoredMessage, reason: DeathReason) {
    let dlx = state
        .topology
        .as_ref()
        .and_then(|t| t.queue(from_queue))
        .and_then(|q| q.dead_letter_exchange.clone());
    let Some(dlx) = dlx else {
        warn!(queue = %from_queue, routing_key = %msg.routing_key, "no dead-letter exchange; message dropped");
        return;
    };

    let count = match &msg.death {
        Some(d) if d.queue == from_queue => d.count + 1,
        _ => 1,
    };
    let dead = StoredMessage {
        routing_key: msg.routing_key.clone(),
        body: msg.body,
        delivery_count: 0,
        death: Some(DeathRecord {
            queue: from_queue.to_string(),
            reason,
            original_routing_key: msg.routing_key,
            count,
        }),
    };
    if route(state, &dlx, dead) == 0 {
        warn!(queue = %from_queue, exchange = %dlx, "dead-letter exchange has no matching queue; message dropped");
    }
}

#[async_trait]
impl IntakeQueue for InMemoryIntakeQueue {
    async fn declare(&self, topology: &Topology) -> Result<(), QueueError> {
        topology.validate()?;
        let mut state = self.lock();
        for q in &topology.queues {
            state.queues.entry(q.name.clone()).or_default();
        }
        state.topology = Some(topology.clone());
        Ok(())
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let exchange = state
                .topology
                .as_ref()
                .map(|t| t.exchange.clone())
                .ok_or_else(|| QueueError::Topology("publish before declare".to_string()))?;

            let msg = StoredMessage {
                routing_key: routing_key.to_string(),
                body: payload.to_vec(),
                delivery_count: 0,
                death: None,
            };
            if route(&mut state, &exchange, msg) == 0 {
                debug!(routing_key = %routing_key, "message matched no queue; dropped");
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn next_delivery(
        &self,
        queue: &str,
        _consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            // Register interest before checking, so an arrival between the
            // check and the wait is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue)? {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.lock();
        take_unacked(&mut state, delivery)?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            let msg = take_unacked(&mut state, delivery)?;

            if !requeue {
                dead_letter(&mut state, &delivery.queue, msg, DeathReason::Rejected);
            } else {
                let limit = state
                    .topology
                    .as_ref()
                    .and_then(|t| t.queue(&delivery.queue))
                    .and_then(|q| q.max_deliveries);
                match limit {
                    Some(max) if msg.delivery_count >= max => {
                        dead_letter(&mut state, &delivery.queue, msg, DeathReason::DeliveryLimit);
                    }
                    _ => {
                        if let Some(q) = state.queues.get_mut(&delivery.queue) {
                            q.ready.push_front(msg);
                        }
                    }
                }
            }
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<u64, QueueError> {
        let state = self.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| QueueError::UnknownQueue(queue.to_string()))?;
        Ok((q.ready.len() + q.unacked.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::*;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(50);

    async fn broker(max_deliveries: u32) -> InMemoryIntakeQueue {
        let q = InMemoryIntakeQueue::new();
        q.declare(&Topology::standard(max_deliveries)).await.unwrap();
        q
    }

    #[tokio::test]
    async fn publish_before_declare_fails() {
        let q = InMemoryIntakeQueue::new();
        let err = q.publish(FLASH_SALE_ORDER, b"x").await.unwrap_err();
        assert!(matches!(err, QueueError::Topology(_)));
    }

    #[tokio::test]
    async fn messages_are_routed_by_key() {
        let q = broker(5).await;
        q.publish(FLASH_SALE_ORDER, b"intent").await.unwrap();
        q.publish(ORDER_CREATED, b"created").await.unwrap();

        assert_eq!(q.depth(FLASH_SALE_QUEUE).await.unwrap(), 1);
        assert_eq!(q.depth(ORDER_CREATED_QUEUE).await.unwrap(), 1);
        assert_eq!(q.depth(USER_REGISTERED_QUEUE).await.unwrap(), 0);
        assert_eq!(q.depth(DEAD_LETTER_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn ack_removes_the_message() {
        let q = broker(5).await;
        q.publish(FLASH_SALE_ORDER, b"intent").await.unwrap();

        let d = q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().unwrap();
        assert_eq!(d.body, b"intent");
        assert_eq!(d.delivery_count, 1);
        assert!(!d.redelivered());
        assert_eq!(q.unacked(FLASH_SALE_QUEUE), 1);

        q.ack(&d).await.unwrap();
        assert_eq!(q.depth(FLASH_SALE_QUEUE).await.unwrap(), 0);
        assert!(matches!(q.ack(&d).await, Err(QueueError::UnknownDelivery(_))));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers_at_head() {
        let q = broker(5).await;
        q.publish(FLASH_SALE_ORDER, b"first").await.unwrap();
        q.publish(FLASH_SALE_ORDER, b"second").await.unwrap();

        let d = q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().unwrap();
        q.nack(&d, true).await.unwrap();

        let again = q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().unwrap();
        assert_eq!(again.body, b"first");
        assert_eq!(again.delivery_count, 2);
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let q = broker(5).await;
        q.publish(FLASH_SALE_ORDER, b"poison").await.unwrap();

        let d = q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().unwrap();
        q.nack(&d, false).await.unwrap();

        assert_eq!(q.depth(FLASH_SALE_QUEUE).await.unwrap(), 0);
        let dead = q.next_delivery(DEAD_LETTER_QUEUE, "ops", WAIT).await.unwrap().unwrap();
        assert_eq!(dead.body, b"poison");
        assert_eq!(dead.routing_key, FLASH_SALE_ORDER);
        let death = dead.death.unwrap();
        assert_eq!(death.reason, DeathReason::Rejected);
        assert_eq!(death.queue, FLASH_SALE_QUEUE);
    }

    #[tokio::test]
    async fn exhausted_redeliveries_are_dead_lettered() {
        let q = broker(2).await;
        q.publish(FLASH_SALE_ORDER, b"flaky").await.unwrap();

        for _ in 0..2 {
            let d = q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().unwrap();
            q.nack(&d, true).await.unwrap();
        }

        assert!(q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().is_none());
        assert_eq!(q.depth(DEAD_LETTER_QUEUE).await.unwrap(), 1);
        let dead = q.next_delivery(DEAD_LETTER_QUEUE, "ops", WAIT).await.unwrap().unwrap();
        assert_eq!(dead.death.unwrap().reason, DeathReason::DeliveryLimit);
    }

    #[tokio::test]
    async fn notification_queue_without_dlx_drops_rejected_messages() {
        let q = broker(5).await;
        q.publish(USER_REGISTERED, b"u").await.unwrap();
        let d = q.next_delivery(USER_REGISTERED_QUEUE, "c1", WAIT).await.unwrap().unwrap();
        q.nack(&d, false).await.unwrap();
        assert_eq!(q.depth(USER_REGISTERED_QUEUE).await.unwrap(), 0);
        assert_eq!(q.depth(DEAD_LETTER_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let q = Arc::new(broker(5).await);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                q.next_delivery(FLASH_SALE_QUEUE, "c1", Duration::from_secs(5)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.publish(FLASH_SALE_ORDER, b"late").await.unwrap();

        let d = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(d.body, b"late");
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let q = broker(5).await;
        assert!(q.next_delivery(FLASH_SALE_QUEUE, "c1", WAIT).await.unwrap().is_none());
        assert!(matches!(
            q.next_delivery("nope", "c1", WAIT).await,
            Err(QueueError::UnknownQueue(_))
        ));
    }
}
