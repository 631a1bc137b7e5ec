//! `flashsale-core`: identifiers, id generation and the domain error model.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod snowflake;

pub use error::{ConfigError, DomainError, DomainResult};
pub use id::{ItemId, OrderId, OrderLineId, OrderNo, UserId};
pub use snowflake::{Clock, IdGenerator, SnowflakeParts};
