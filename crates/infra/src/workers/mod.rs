//! Background consumers of the intake queue.

pub mod intake_worker;

pub use intake_worker::{DeliveryHandler, IntakeWorker, Settle, WorkerHandle};
