//! Inventory domain module.
//!
//! Purchasable items and the rules deciding whether a quantity can be sold.
//! Pure domain logic (no IO, no storage).

pub mod item;

pub use item::{Item, ItemStatus};
