//! Flow control: fill level, watermarks, bounded blocking push wrappers.
//!
//! The core data plane never blocks; these wrappers loop on
//! [`Error::Full`](crate::Error::Full) with a spin-then-sleep progression
//! so callers opt in to waiting explicitly. Deadlines use the monotonic
//! clock.

use std::hint;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::queue::Queue;

/// High/low fill thresholds in percent.
///
/// Only validation is part of the contract here: `low < high <= 100`.
/// Reacting to threshold crossings is left to callers polling
/// [`Queue::fill_level`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    high: u8,
    low: u8,
}

impl Watermarks {
    /// Build a validated pair of thresholds.
    pub fn new(high: u8, low: u8) -> Result<Self> {
        if high > 100 {
            return Err(Error::InvalidArgument("high watermark exceeds 100"));
        }
        if low >= high {
            return Err(Error::InvalidArgument(
                "low watermark must be below the high watermark",
            ));
        }
        Ok(Self { high, low })
    }

    /// High threshold in percent.
    #[inline]
    pub fn high(&self) -> u8 {
        self.high
    }

    /// Low threshold in percent.
    #[inline]
    pub fn low(&self) -> u8 {
        self.low
    }
}

/// Spin-then-sleep waiter shared by the blocking push wrappers.
///
/// Progression: CPU pause for the first `SPIN_LIMIT` rounds, then sleeps
/// that start at `BASE_SLEEP` and double up to `MAX_SLEEP`.
#[derive(Debug)]
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 100;
    const BASE_SLEEP_US: u64 = 10;
    const MAX_SLEEP_US: u64 = 1_000;

    #[inline]
    fn new() -> Self {
        Self { step: 0 }
    }

    /// Wait a little, escalating from pause to capped sleeps.
    fn snooze(&mut self) {
        if self.step < Self::SPIN_LIMIT {
            hint::spin_loop();
        } else {
            let exp = (self.step - Self::SPIN_LIMIT).min(7);
            let us = (Self::BASE_SLEEP_US << exp).min(Self::MAX_SLEEP_US);
            thread::sleep(Duration::from_micros(us));
        }
        self.step += 1;
    }
}

impl Queue {
    /// Ring occupancy as a percentage, 0 to 100.
    pub fn fill_level(&self) -> u8 {
        let stats = self.stats();
        if stats.capacity == 0 {
            return 0;
        }
        ((stats.used * 100) / stats.capacity) as u8
    }

    /// True when the fill level has reached `threshold` percent.
    pub fn is_pressured(&self, threshold: u8) -> bool {
        self.fill_level() >= threshold
    }

    /// Store a validated watermark configuration on this handle.
    pub fn set_backpressure(&self, watermarks: Watermarks) {
        self.watermarks_cell().set(Some(watermarks));
    }

    /// The watermark configuration, if one was set.
    pub fn watermarks(&self) -> Option<Watermarks> {
        self.watermarks_cell().get()
    }

    /// Push, waiting for space up to `timeout`.
    ///
    /// `Some(Duration::ZERO)` is purely non-blocking; `None` waits
    /// forever. Full is retried with a spin-then-sleep progression; any
    /// other error returns immediately. Returns [`Error::Full`] once the
    /// deadline passes.
    pub fn push_wait(&self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        match self.push(data) {
            Err(Error::Full) => {}
            other => return other,
        }
        if timeout == Some(Duration::ZERO) {
            return Err(Error::Full);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut backoff = Backoff::new();
        loop {
            match self.push(data) {
                Err(Error::Full) => {}
                other => return other,
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Full);
                }
            }
            backoff.snooze();
        }
    }

    /// Push, retrying full with exponentially growing sleeps.
    ///
    /// Starts at `base_delay` (floored to one microsecond), doubles each
    /// retry, and caps at 100 ms. `max_retries == 0` retries forever;
    /// otherwise the call gives up with [`Error::Full`] after
    /// `max_retries` failed attempts.
    pub fn push_backoff(
        &self,
        data: &[u8],
        max_retries: u32,
        base_delay: Duration,
    ) -> Result<()> {
        const MAX_DELAY: Duration = Duration::from_millis(100);

        let mut delay = base_delay.max(Duration::from_micros(1));
        let mut retries = 0u32;
        loop {
            match self.push(data) {
                Err(Error::Full) => {}
                other => return other,
            }

            retries += 1;
            if max_retries > 0 && retries >= max_retries {
                return Err(Error::Full);
            }

            thread::sleep(delay);
            delay = (delay * 2).min(MAX_DELAY);
        }
    }
}
