use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Exponentially weighted moving average of an event rate.
///
/// Events accumulate lock-free between ticks; `tick` runs on a fixed
/// cadence and folds the interval's instantaneous rate into the average.
/// Readers tolerate racing with a tick, the shard controller only needs a
/// recent value.
#[derive(Debug)]
pub(crate) struct EwmaRate {
    events: AtomicI64,
    alpha: f64,
    interval: Duration,
    state: Mutex<EwmaState>,
}

#[derive(Debug, Default)]
struct EwmaState {
    rate: f64,
    initialized: bool,
}

impl EwmaRate {
    pub fn new(alpha: f64, interval: Duration) -> Self {
        Self {
            events: AtomicI64::new(0),
            alpha,
            interval,
            state: Mutex::new(EwmaState::default()),
        }
    }

    pub fn incr(&self, count: i64) {
        self.events.fetch_add(count, Ordering::Relaxed);
    }

    /// The average rate per second, zero until the first non-empty tick.
    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    pub fn tick(&self) {
        let events = self.events.swap(0, Ordering::Relaxed);
        let instant_rate = events as f64 / self.interval.as_secs_f64();

        let mut state = self.state.lock();
        if state.initialized {
            state.rate += self.alpha * (instant_rate - state.rate);
        } else if events > 0 {
            state.initialized = true;
            state.rate = instant_rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_is_zero_before_first_tick() {
        let rate = EwmaRate::new(0.2, Duration::from_secs(10));
        rate.incr(100);
        assert_eq!(rate.rate(), 0.0);
    }

    #[test]
    fn first_tick_seeds_the_average() {
        let rate = EwmaRate::new(0.2, Duration::from_secs(10));
        rate.incr(100);
        rate.tick();
        assert_eq!(rate.rate(), 10.0);
    }

    #[test]
    fn later_ticks_fold_with_alpha() {
        let rate = EwmaRate::new(0.2, Duration::from_secs(10));
        rate.incr(100);
        rate.tick();
        rate.tick();
        // 10 + 0.2 * (0 - 10)
        assert!((rate.rate() - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_ticks_do_not_seed() {
        let rate = EwmaRate::new(0.2, Duration::from_secs(10));
        rate.tick();
        rate.incr(50);
        rate.tick();
        assert_eq!(rate.rate(), 5.0);
    }
}
