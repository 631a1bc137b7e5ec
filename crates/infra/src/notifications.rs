//! Plain notification events: `order.created` and `user.registered`.
//!
//! Publishing is best effort from the caller's point of view. Consumers log
//! the event and acknowledge it; these are the hooks downstream integrations
//! (warehouse, coupons) attach to.

use async_trait::async_trait;
use tracing::{info, warn};

use flashsale_core::{OrderNo, UserId};
use flashsale_events::{
    Delivery, IntakeQueue, OrderCreated, QueueError, UserRegistered, publish_json, routing,
};

use crate::workers::{DeliveryHandler, Settle};

pub async fn announce_order_created(
    queue: &dyn IntakeQueue,
    order_no: &OrderNo,
) -> Result<(), QueueError> {
    publish_json(
        queue,
        routing::ORDER_CREATED,
        &OrderCreated {
            order_no: order_no.clone(),
        },
    )
    .await
}

pub async fn announce_user_registered(
    queue: &dyn IntakeQueue,
    user_id: UserId,
) -> Result<(), QueueError> {
    publish_json(queue, routing::USER_REGISTERED, &UserRegistered { user_id }).await
}

/// Consumer for the notification queues: logs each event and acknowledges it.
/// Undecodable events are logged and acknowledged too; they cannot improve.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationLogger;

#[async_trait]
impl DeliveryHandler for NotificationLogger {
    async fn on_delivery(&self, delivery: &Delivery) -> Settle {
        match delivery.routing_key.as_str() {
            routing::ORDER_CREATED => match serde_json::from_slice::<OrderCreated>(&delivery.body) {
                Ok(event) => info!(order_no = %event.order_no, "order created"),
                Err(err) => warn!(error = %err, "undecodable order.created event"),
            },
            routing::USER_REGISTERED => {
                match serde_json::from_slice::<UserRegistered>(&delivery.body) {
                    Ok(event) => info!(user_id = %event.user_id, "user registered"),
                    Err(err) => warn!(error = %err, "undecodable user.registered event"),
                }
            }
            other => warn!(routing_key = %other, queue = %delivery.queue, "unexpected notification"),
        }
        Settle::Ack
    }
}
