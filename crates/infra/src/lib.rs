//! Infrastructure layer: fast store, durable store, intake queue wiring, and
//! the flash-sale services built on them.

pub mod cache;
pub mod checkout;
pub mod config;
pub mod context;
pub mod fast_store;
pub mod gate;
pub mod intake;
pub mod keys;
pub mod notifications;
pub mod persister;
pub mod ranking;
pub mod repository;
pub mod workers;
