//! Strongly-typed identifiers used across the domain.
//!
//! Entity ids are 64-bit snowflakes. On the wire they are written as decimal
//! strings (64-bit integers do not survive JSON number parsing in every client)
//! and accepted back as either strings or numbers.

use core::fmt;
use core::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;

/// Identifier of a purchasable item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(i64);

/// Identifier of a durable order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId(i64);

/// Identifier of a line within an order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderLineId(i64);

/// Identifier of a buyer, used unchanged from the authentication boundary inward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(i64);

struct I64IdVisitor(&'static str);

impl<'de> Visitor<'de> for I64IdVisitor {
    type Value = i64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a {} as integer or decimal string", self.0)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<i64, E> {
        Ok(v)
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<i64, E> {
        i64::try_from(v).map_err(|_| E::custom(format!("{} out of range: {v}", self.0)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<i64, E> {
        v.trim()
            .parse::<i64>()
            .map_err(|e| E::custom(format!("{}: {e}", self.0)))
    }
}

macro_rules! impl_i64_newtype {
    ($t:ident, $name:literal) => {
        impl $t {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<i64>()
                    .map(Self)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))
            }
        }

        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(I64IdVisitor($name)).map(Self)
            }
        }
    };
}

impl_i64_newtype!(ItemId, "ItemId");
impl_i64_newtype!(OrderId, "OrderId");
impl_i64_newtype!(OrderLineId, "OrderLineId");
impl_i64_newtype!(UserId, "UserId");

/// Human/trace-readable order number, unique per order.
///
/// Generated before the order intent is published so that every redelivery
/// of the same intent carries the same number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNo(String);

impl OrderNo {
    pub const PREFIX: &'static str = "ORD";
    pub const MAX_LEN: usize = 64;

    /// Derive an order number from a freshly generated snowflake id.
    pub fn from_id(id: i64) -> Self {
        Self(format!("{}{id}", Self::PREFIX))
    }

    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(DomainError::validation("order_no must not be empty"));
        }
        if raw.len() > Self::MAX_LEN {
            return Err(DomainError::validation(format!(
                "order_no longer than {} characters",
                Self::MAX_LEN
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderNo {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<OrderNo> for String {
    fn from(value: OrderNo) -> Self {
        value.0
    }
}

impl fmt::Display for OrderNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
