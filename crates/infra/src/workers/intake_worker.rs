use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flashsale_events::{Delivery, IntakeQueue};

/// Pause after a broker error before pulling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// How a handled delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Done with the message (processed or deliberately discarded).
    Ack,
    /// Hand the message back for redelivery.
    Requeue,
    /// Dead-letter the message now; redelivery cannot help.
    Reject,
}

/// Per-message processing. Must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn on_delivery(&self, delivery: &Delivery) -> Settle;
}

/// Handle to stop and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop pulling new messages and wait for the in-flight one (if any) to
    /// be settled.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                warn!(worker = %self.name, error = %err, "intake worker ended abnormally");
            }
        }
    }
}

/// Long-lived consumer loop over one queue.
///
/// - Pulls one delivery at a time and settles it before pulling the next
/// - Shutdown interrupts only the wait for a message, never a handler or a settlement
#[derive(Debug)]
pub struct IntakeWorker;

impl IntakeWorker {
    pub fn spawn(
        name: impl Into<String>,
        queue: Arc<dyn IntakeQueue>,
        queue_name: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
        poll: Duration,
    ) -> WorkerHandle {
        let name = name.into();
        let queue_name = queue_name.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(worker_loop(
            name.clone(),
            queue,
            queue_name,
            handler,
            poll,
            shutdown_rx,
        ));

        WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

async fn worker_loop(
    name: String,
    queue: Arc<dyn IntakeQueue>,
    queue_name: String,
    handler: Arc<dyn DeliveryHandler>,
    poll: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(worker = %name, queue = %queue_name, "intake worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            next = queue.next_delivery(&queue_name, &name, poll) => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker = %name, error = %err, "failed to pull from intake queue");
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }
        };

        let settle = handler.on_delivery(&delivery).await;
        let settled = match settle {
            Settle::Ack => queue.ack(&delivery).await,
            Settle::Requeue => queue.nack(&delivery, true).await,
            Settle::Reject => queue.nack(&delivery, false).await,
        };
        match settled {
            Ok(()) => debug!(worker = %name, tag = %delivery.tag, ?settle, "delivery settled"),
            // The broker hands it out again once it notices the delivery is unsettled.
            Err(err) => warn!(worker = %name, tag = %delivery.tag, error = %err, "failed to settle delivery"),
        }
    }

    info!(worker = %name, "intake worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use flashsale_events::{InMemoryIntakeQueue, Topology, routing};

    const POLL: Duration = Duration::from_millis(20);

    struct Counting {
        seen: AtomicUsize,
        settle: Settle,
    }

    #[async_trait]
    impl DeliveryHandler for Counting {
        async fn on_delivery(&self, _delivery: &Delivery) -> Settle {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.settle
        }
    }

    struct Slow {
        started: AtomicBool,
        finished: AtomicBool,
    }

    #[async_trait]
    impl DeliveryHandler for Slow {
        async fn on_delivery(&self, _delivery: &Delivery) -> Settle {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.finished.store(true, Ordering::SeqCst);
            Settle::Ack
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn broker(max_deliveries: u32) -> Arc<InMemoryIntakeQueue> {
        let queue = Arc::new(InMemoryIntakeQueue::new());
        queue.declare(&Topology::standard(max_deliveries)).await.unwrap();
        queue
    }

    #[tokio::test]
    async fn acked_messages_leave_the_queue() {
        let queue = broker(5).await;
        for n in 0..3 {
            queue
                .publish(routing::ORDER_CREATED, format!("{n}").as_bytes())
                .await
                .unwrap();
        }
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            settle: Settle::Ack,
        });
        let worker = IntakeWorker::spawn(
            "created-0",
            queue.clone(),
            routing::ORDER_CREATED_QUEUE,
            handler.clone(),
            POLL,
        );

        eventually(|| handler.seen.load(Ordering::SeqCst) == 3).await;
        worker.shutdown().await;
        assert_eq!(queue.depth(routing::ORDER_CREATED_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn requeued_message_is_dead_lettered_at_the_limit() {
        let queue = broker(3).await;
        queue.publish(routing::FLASH_SALE_ORDER, b"{}").await.unwrap();
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            settle: Settle::Requeue,
        });
        let worker = IntakeWorker::spawn(
            "seckill-0",
            queue.clone(),
            routing::FLASH_SALE_QUEUE,
            handler.clone(),
            POLL,
        );

        eventually(|| queue.ready_bodies(routing::DEAD_LETTER_QUEUE).len() == 1).await;
        worker.shutdown().await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 3);
        assert_eq!(queue.depth(routing::FLASH_SALE_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_message_is_dead_lettered_at_once() {
        let queue = broker(5).await;
        queue.publish(routing::FLASH_SALE_ORDER, b"{}").await.unwrap();
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            settle: Settle::Reject,
        });
        let worker = IntakeWorker::spawn(
            "seckill-0",
            queue.clone(),
            routing::FLASH_SALE_QUEUE,
            handler.clone(),
            POLL,
        );

        eventually(|| queue.ready_bodies(routing::DEAD_LETTER_QUEUE).len() == 1).await;
        worker.shutdown().await;
        assert_eq!(handler.seen.load(Ordering::SeqCst), 1);
        assert_eq!(queue.depth(routing::FLASH_SALE_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_in_flight_message() {
        let queue = broker(5).await;
        queue.publish(routing::USER_REGISTERED, b"{}").await.unwrap();
        let handler = Arc::new(Slow {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        });
        let worker = IntakeWorker::spawn(
            "registered-0",
            queue.clone(),
            routing::USER_REGISTERED_QUEUE,
            handler.clone(),
            POLL,
        );

        eventually(|| handler.started.load(Ordering::SeqCst)).await;
        worker.shutdown().await;
        assert!(handler.finished.load(Ordering::SeqCst));
        assert_eq!(queue.unacked(routing::USER_REGISTERED_QUEUE), 0);
        assert_eq!(queue.depth(routing::USER_REGISTERED_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_worker_stops_promptly() {
        let queue = broker(5).await;
        let handler = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            settle: Settle::Ack,
        });
        let worker = IntakeWorker::spawn(
            "idle",
            queue,
            routing::ORDER_CREATED_QUEUE,
            handler,
            Duration::from_secs(30),
        );
        tokio::time::timeout(Duration::from_secs(1), worker.shutdown())
            .await
            .unwrap();
    }
}
