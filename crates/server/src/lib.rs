//! Flash-sale process: startup sequence, background consumers, shutdown.

pub mod bootstrap;

pub use bootstrap::{App, StartupError};
