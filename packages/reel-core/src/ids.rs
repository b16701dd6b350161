//! # Id Generator
//!
//! 64-bit, time-sortable identifiers for messages and other entities.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  bit 63        22 21          12 11                 0            │
//! │  ┌───────────────┬──────────────┬────────────────────┐           │
//! │  │ ms since epoch│   node id    │  sequence in ms    │           │
//! │  │   (41 bits)   │  (10 bits)   │    (12 bits)       │           │
//! │  └───────────────┴──────────────┴────────────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sequence resets every millisecond. When 4096 ids have been issued
//! within one millisecond the generator spins until the clock ticks over.
//! If the clock ever reports a time earlier than the last issued id, the
//! generator refuses to continue: reusing an id window could collide.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Custom epoch: 2024-01-01T00:00:00Z in milliseconds.
pub const DEFAULT_EPOCH_MS: i64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

/// Highest node id that fits in the node field.
pub const MAX_NODE_ID: i64 = (1 << NODE_BITS) - 1;

const MAX_SEQUENCE: i64 = (1 << SEQUENCE_BITS) - 1;
const TIMESTAMP_SHIFT: u32 = NODE_BITS + SEQUENCE_BITS;

/// Millisecond clock used by the generator.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        crate::time::now_timestamp_millis()
    }
}

struct GeneratorState {
    last_ms: i64,
    sequence: i64,
}

/// Snowflake-style id generator.
pub struct IdGenerator {
    node_id: i64,
    epoch_ms: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl IdGenerator {
    /// Create a generator for `node_id` on the system clock.
    pub fn new(node_id: i64) -> Result<Self> {
        Self::with_clock(node_id, DEFAULT_EPOCH_MS, Arc::new(SystemClock))
    }

    /// Create a generator with an explicit epoch and clock.
    pub fn with_clock(node_id: i64, epoch_ms: i64, clock: Arc<dyn Clock>) -> Result<Self> {
        if !(0..=MAX_NODE_ID).contains(&node_id) {
            return Err(Error::InvalidConfig(format!(
                "node id {} outside 0..={}",
                node_id, MAX_NODE_ID
            )));
        }

        Ok(Self {
            node_id,
            epoch_ms,
            clock,
            state: Mutex::new(GeneratorState {
                last_ms: -1,
                sequence: 0,
            }),
        })
    }

    /// Issue the next id.
    ///
    /// Returns [`Error::ClockMovedBackwards`] if the clock regressed. Callers
    /// must treat that as fatal.
    pub fn next_id(&self) -> Result<i64> {
        let mut state = self.state.lock();
        let mut now = self.clock.now_millis();

        if now < state.last_ms {
            tracing::error!(
                last_ms = state.last_ms,
                now_ms = now,
                "Clock moved backwards, refusing to issue ids"
            );
            return Err(Error::ClockMovedBackwards {
                last_ms: state.last_ms,
                now_ms: now,
            });
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & MAX_SEQUENCE;
            if state.sequence == 0 {
                // Sequence exhausted for this millisecond
                while now <= state.last_ms {
                    std::hint::spin_loop();
                    now = self.clock.now_millis();
                }
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        Ok(((now - self.epoch_ms) << TIMESTAMP_SHIFT) | (self.node_id << SEQUENCE_BITS) | state.sequence)
    }

    /// Node id embedded in every id from this generator.
    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Unix timestamp (ms) at which `id` was issued.
    pub fn timestamp_of(&self, id: i64) -> i64 {
        (id >> TIMESTAMP_SHIFT) + self.epoch_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Clock whose time is set by the test.
    struct ManualClock(AtomicI64);

    impl Clock for ManualClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Clock that stays on `base` for the first `ticks` reads, then moves on.
    struct SteppingClock {
        base: i64,
        ticks: i64,
        reads: AtomicI64,
    }

    impl Clock for SteppingClock {
        fn now_millis(&self) -> i64 {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            if n < self.ticks {
                self.base
            } else {
                self.base + 1
            }
        }
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let gen = IdGenerator::new(1).unwrap();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = gen.next_id().unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_id_layout() {
        let clock = Arc::new(ManualClock(AtomicI64::new(DEFAULT_EPOCH_MS + 1000)));
        let gen = IdGenerator::with_clock(7, DEFAULT_EPOCH_MS, clock).unwrap();

        let id = gen.next_id().unwrap();
        assert_eq!(id >> 22, 1000);
        assert_eq!((id >> 12) & MAX_NODE_ID, 7);
        assert_eq!(id & MAX_SEQUENCE, 0);
        assert_eq!(gen.timestamp_of(id), DEFAULT_EPOCH_MS + 1000);

        let second = gen.next_id().unwrap();
        assert_eq!(second & MAX_SEQUENCE, 1);
    }

    #[test]
    fn test_sequence_overflow_waits_for_next_millisecond() {
        let base = DEFAULT_EPOCH_MS + 50;
        let clock = Arc::new(SteppingClock {
            base,
            ticks: 4096 + 3,
            reads: AtomicI64::new(0),
        });
        let gen = IdGenerator::with_clock(1, DEFAULT_EPOCH_MS, clock).unwrap();

        let mut ids = Vec::new();
        for _ in 0..4097 {
            ids.push(gen.next_id().unwrap());
        }

        // First 4096 share the millisecond, the next rolls over
        assert_eq!(gen.timestamp_of(ids[4095]), base);
        assert_eq!(gen.timestamp_of(ids[4096]), base + 1);
        assert_eq!(ids[4096] & MAX_SEQUENCE, 0);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_clock_moving_backwards_is_fatal() {
        let clock = Arc::new(ManualClock(AtomicI64::new(DEFAULT_EPOCH_MS + 10_000)));
        let gen = IdGenerator::with_clock(1, DEFAULT_EPOCH_MS, clock.clone()).unwrap();
        gen.next_id().unwrap();

        clock.0.store(DEFAULT_EPOCH_MS + 9_000, Ordering::SeqCst);
        let err = gen.next_id().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::ClockMovedBackwards { .. }));
    }

    #[test]
    fn test_rejects_out_of_range_node() {
        assert!(IdGenerator::new(MAX_NODE_ID + 1).is_err());
        assert!(IdGenerator::new(-1).is_err());
        assert!(IdGenerator::new(MAX_NODE_ID).is_ok());
    }
}
