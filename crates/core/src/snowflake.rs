//! Snowflake id generation.
//!
//! Layout of a generated id (most significant bit first):
//!
//! ```text
//! | 1 bit unused | 41 bits ms since epoch | 10 bits node | 12 bits sequence |
//! ```
//!
//! Ids from one generator are strictly increasing. Generators on different
//! nodes sharing the same epoch never collide because the node segment differs.

use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use tracing::warn;

use crate::error::ConfigError;

pub const NODE_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const TIME_BITS: u32 = 41;

pub const MAX_NODE: i64 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;
const MAX_TICK: i64 = (1 << TIME_BITS) - 1;
const NODE_SHIFT: u32 = SEQUENCE_BITS;
const TIME_SHIFT: u32 = SEQUENCE_BITS + NODE_BITS;

/// Wall clock in milliseconds since the Unix epoch.
pub type Clock = Box<dyn Fn() -> i64 + Send + Sync>;

#[derive(Debug, Default)]
struct TickState {
    last_tick: i64,
    sequence: i64,
}

/// Decomposed view of a generated id.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SnowflakeParts {
    /// Milliseconds since the generator epoch.
    pub tick: i64,
    pub node: i64,
    pub sequence: i64,
}

/// Time-ordered 64-bit id generator.
pub struct IdGenerator {
    epoch_ms: i64,
    node: i64,
    clock: Clock,
    state: Mutex<TickState>,
}

impl core::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("epoch_ms", &self.epoch_ms)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    /// Build a generator from a `YYYY-MM-DD` epoch and a node discriminator in `0..=1023`.
    pub fn new(epoch: &str, node: i64) -> Result<Self, ConfigError> {
        Self::with_clock(epoch, node, Box::new(|| Utc::now().timestamp_millis()))
    }

    /// Same as [`IdGenerator::new`] with an injected wall clock (milliseconds since Unix epoch).
    pub fn with_clock(epoch: &str, node: i64, clock: Clock) -> Result<Self, ConfigError> {
        let epoch_ms = parse_epoch(epoch)?;
        if !(0..=MAX_NODE).contains(&node) {
            return Err(ConfigError::NodeOutOfRange {
                node,
                max: MAX_NODE,
            });
        }
        if epoch_ms > clock() {
            return Err(ConfigError::InvalidEpoch {
                value: epoch.to_string(),
                reason: "epoch lies in the future".to_string(),
            });
        }

        Ok(Self {
            epoch_ms,
            node,
            clock,
            state: Mutex::new(TickState::default()),
        })
    }

    pub fn node(&self) -> i64 {
        self.node
    }

    /// Generate the next id.
    ///
    /// Never issues a tick ahead of the wall clock: on sequence exhaustion or
    /// when the clock is behind the last issued tick, the caller yields until
    /// the clock catches up.
    pub fn next_id(&self) -> i64 {
        let mut regression_logged = false;
        loop {
            let now = self.current_tick();

            // The critical section is a handful of integer ops; a poisoned lock still
            // holds a consistent (last_tick, sequence) pair.
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

            if now < state.last_tick {
                if !regression_logged {
                    warn!(
                        last_tick = state.last_tick,
                        observed = now,
                        "clock moved backwards; waiting for it to catch up"
                    );
                    regression_logged = true;
                }
                drop(state);
                std::thread::yield_now();
                continue;
            }

            if now == state.last_tick {
                let sequence = (state.sequence + 1) & SEQUENCE_MASK;
                if sequence == 0 {
                    drop(state);
                    std::thread::yield_now();
                    continue;
                }
                state.sequence = sequence;
            } else {
                state.last_tick = now;
                state.sequence = 0;
            }

            return (now << TIME_SHIFT) | (self.node << NODE_SHIFT) | state.sequence;
        }
    }

    fn current_tick(&self) -> i64 {
        ((self.clock)() - self.epoch_ms).clamp(0, MAX_TICK)
    }

    /// Split an id back into its segments.
    pub fn decompose(id: i64) -> SnowflakeParts {
        SnowflakeParts {
            tick: id >> TIME_SHIFT,
            node: (id >> NODE_SHIFT) & MAX_NODE,
            sequence: id & SEQUENCE_MASK,
        }
    }
}

fn parse_epoch(epoch: &str) -> Result<i64, ConfigError> {
    let date = NaiveDate::parse_from_str(epoch.trim(), "%Y-%m-%d").map_err(|e| {
        ConfigError::InvalidEpoch {
            value: epoch.to_string(),
            reason: e.to_string(),
        }
    })?;
    let midnight = date.and_hms_opt(0, 0, 0).ok_or_else(|| ConfigError::InvalidEpoch {
        value: epoch.to_string(),
        reason: "no midnight on that date".to_string(),
    })?;
    Ok(midnight.and_utc().timestamp_millis())
}
