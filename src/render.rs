//! Fixed-rate render tick (spec §4.6 — C6).
//!
//! Grounded on `renderThread` in the original client: an absolute-clock
//! sleep to the next tick boundary, with a drift check every 100 ticks that
//! resyncs the clock base if observed elapsed time has fallen behind the
//! cumulative tick period (the case after a TTY switch or suspend/resume).

use std::time::{Duration, Instant};

/// Ticks that resync the clock base every `RESYNC_CHECK_TICKS` ticks
/// (spec §4.6: "Every 100 ticks").
const RESYNC_CHECK_TICKS: u32 = 100;

/// Drives one thread's fixed-period tick loop. Not tied to any particular
/// renderer; `Core::run` owns one of these for the render thread.
pub struct FixedTicker {
    period: Duration,
    base: Instant,
    next_tick: Duration,
    ticks_since_resync: u32,
}

impl FixedTicker {
    /// Start a new ticker with the given period, anchored to now.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            base: Instant::now(),
            next_tick: period,
            ticks_since_resync: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Absolute-sleep until the next tick boundary, then check for drift
    /// every `RESYNC_CHECK_TICKS` ticks (spec §4.6). Called once per loop
    /// iteration, after the tick's work (`bind`/`render`) has run.
    pub fn wait_for_next_tick(&mut self) {
        let target = self.base + self.next_tick;
        let now = Instant::now();
        if target > now {
            std::thread::sleep(target - now);
        }
        self.next_tick += self.period;

        self.ticks_since_resync += 1;
        if self.ticks_since_resync >= RESYNC_CHECK_TICKS {
            self.ticks_since_resync = 0;
            let elapsed = self.base.elapsed();
            if elapsed > self.next_tick {
                // Drift detected (spec §4.6: "happens after TTY switches,
                // suspend/resume"); resync the clock base to now instead of
                // trying to catch up tick-by-tick.
                log::debug!(
                    "render tick drift detected: elapsed={:?} expected={:?}, resyncing",
                    elapsed,
                    self.next_tick
                );
                self.base = Instant::now();
                self.next_tick = self.period;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_for_next_tick_advances_target_by_one_period() {
        let mut ticker = FixedTicker::new(Duration::from_millis(1));
        let before = ticker.next_tick;
        ticker.wait_for_next_tick();
        assert_eq!(ticker.next_tick, before + ticker.period);
    }

    #[test]
    fn resync_triggers_after_configured_tick_count_on_drift() {
        let mut ticker = FixedTicker::new(Duration::from_nanos(1));
        // Force the ticker far behind schedule so the 100th check sees
        // elapsed > next_tick without actually sleeping for that long.
        ticker.base = Instant::now() - Duration::from_secs(1);
        for _ in 0..RESYNC_CHECK_TICKS {
            ticker.wait_for_next_tick();
        }
        // After resync the cumulative next_tick should be small again,
        // i.e. close to one period rather than ~100 periods behind.
        assert!(ticker.next_tick <= ticker.period * 2);
    }
}
