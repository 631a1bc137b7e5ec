//! Orders domain module.
//!
//! Orders, their lines, and the pending → paid / pending → cancelled lifecycle,
//! implemented purely as deterministic domain logic (no IO, no storage).

pub mod order;

pub use order::{LineDraft, Order, OrderLine, OrderStatus};
