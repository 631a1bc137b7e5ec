//! Broker topology: exchanges, queues, bindings and dead-letter wiring.
//!
//! All exchanges are durable topic exchanges. A queue may name a dead-letter
//! exchange; messages rejected without requeue (or exceeding the queue's
//! delivery limit) are re-published there under their original routing key.

use serde::{Deserialize, Serialize};

use crate::queue::QueueError;
use crate::routing::{self, topic_matches};

/// A queue bound to an exchange with a topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub exchange: String,
    pub pattern: String,
}

impl Binding {
    pub fn new(exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            pattern: pattern.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub bindings: Vec<Binding>,
    pub dead_letter_exchange: Option<String>,
    /// Deliveries allowed before a requeued message is dead-lettered instead.
    pub max_deliveries: Option<u32>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            bindings: Vec::new(),
            dead_letter_exchange: None,
            max_deliveries: None,
        }
    }

    pub fn bind(mut self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.bindings.push(Binding::new(exchange, pattern));
        self
    }

    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max);
        self
    }

    fn is_bound(&self, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .iter()
            .any(|b| b.exchange == exchange && topic_matches(&b.pattern, routing_key))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Exchange producers publish to.
    pub exchange: String,
    pub exchanges: Vec<String>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    /// The flash-sale topology:
    ///
    /// - `flashsale.dlx` → `dlq_queue` bound with `#`
    /// - `flashsale.events` → `order_seckill_queue` on `order.seckill`, dead-lettering to the DLX
    /// - `flashsale.events` → `order_created_queue` / `user_registered_queue` notifications
    pub fn standard(max_deliveries: u32) -> Self {
        Self {
            exchange: routing::EVENT_EXCHANGE.to_string(),
            exchanges: vec![
                routing::DEAD_LETTER_EXCHANGE.to_string(),
                routing::EVENT_EXCHANGE.to_string(),
            ],
            queues: vec![
                QueueSpec::durable(routing::DEAD_LETTER_QUEUE)
                    .bind(routing::DEAD_LETTER_EXCHANGE, routing::CATCH_ALL),
                QueueSpec::durable(routing::FLASH_SALE_QUEUE)
                    .bind(routing::EVENT_EXCHANGE, routing::FLASH_SALE_ORDER)
                    .dead_letter_to(routing::DEAD_LETTER_EXCHANGE)
                    .with_max_deliveries(max_deliveries),
                QueueSpec::durable(routing::ORDER_CREATED_QUEUE)
                    .bind(routing::EVENT_EXCHANGE, routing::ORDER_CREATED),
                QueueSpec::durable(routing::USER_REGISTERED_QUEUE)
                    .bind(routing::EVENT_EXCHANGE, routing::USER_REGISTERED),
            ],
        }
    }

    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Queues receiving a message published to `exchange` with `routing_key`.
    pub fn routes<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> impl Iterator<Item = &'a QueueSpec> + 'a {
        self.queues
            .iter()
            .filter(move |q| q.is_bound(exchange, routing_key))
    }

    /// Every binding and dead-letter target must name a declared exchange.
    pub fn validate(&self) -> Result<(), QueueError> {
        let declared = |name: &str| self.exchanges.iter().any(|e| e == name);

        if !declared(&self.exchange) {
            return Err(QueueError::Topology(format!(
                "publish exchange '{}' is not declared",
                self.exchange
            )));
        }
        for q in &self.queues {
            for b in &q.bindings {
                if !declared(&b.exchange) {
                    return Err(QueueError::Topology(format!(
                        "queue '{}' binds to undeclared exchange '{}'",
                        q.name, b.exchange
                    )));
                }
            }
            if let Some(dlx) = &q.dead_letter_exchange {
                if !declared(dlx) {
                    return Err(QueueError::Topology(format!(
                        "queue '{}' dead-letters to undeclared exchange '{dlx}'",
                        q.name
                    )));
                }
            }
        }
        Ok(())
    }
}
