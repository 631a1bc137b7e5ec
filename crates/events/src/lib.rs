//! Intake queue: topic-routed, at-least-once message delivery with dead-lettering.
//!
//! This crate holds the transport-agnostic pieces (routing, topology, payloads,
//! the [`IntakeQueue`] contract) plus an in-memory broker for tests/dev.
//! Infrastructure-backed brokers live in `flashsale-infra`.

pub mod delivery;
pub mod in_memory_queue;
pub mod message;
pub mod queue;
pub mod routing;
pub mod topology;

pub use delivery::{DeathReason, DeathRecord, Delivery};
pub use in_memory_queue::InMemoryIntakeQueue;
pub use message::{IntentLine, OrderCreated, OrderIntent, UserRegistered};
pub use queue::{IntakeQueue, QueueError, publish_json};
pub use routing::topic_matches;
pub use topology::{Binding, QueueSpec, Topology};
