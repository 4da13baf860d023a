use std::collections::VecDeque;
use std::num::NonZero;
use std::time::Instant;

use parking_lot::Mutex;

use crate::nonzero;

/// Admission control for bytes sent to clients over the shared downlink.
pub(crate) trait BandwidthPolicy: Send + Sync + std::fmt::Debug {
    /// Whether `bytes` may be sent now. A `true` answer accounts the bytes as
    /// sent.
    fn has_downlink_bandwidth(&self, bytes: usize) -> bool;
}

#[derive(Debug)]
pub(crate) struct Unlimited;

impl BandwidthPolicy for Unlimited {
    fn has_downlink_bandwidth(&self, _bytes: usize) -> bool {
        true
    }
}

/// Per-second byte counts of the last few seconds.
#[derive(Debug)]
struct SlidingWindow {
    slots: VecDeque<usize>,
    capacity: NonZero<usize>,
    sum: usize,
    last: Instant,
}

impl SlidingWindow {
    fn new(capacity: NonZero<usize>, now: Instant) -> Self {
        let mut slots = VecDeque::with_capacity(capacity.get());
        slots.push_back(0);

        Self {
            slots,
            capacity,
            sum: 0,
            last: now,
        }
    }

    /// Opens one empty slot per full second elapsed since the last advance.
    fn advance(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs();
        if elapsed == 0 {
            return;
        }

        // more than a full window elapsed: everything expires
        let fresh = usize::try_from(elapsed).map_or(self.capacity.get(), |e| {
            e.min(self.capacity.get())
        });

        for _ in 0..fresh {
            if self.slots.len() == self.capacity.get()
                && let Some(front) = self.slots.pop_front()
            {
                self.sum -= front;
            }
            self.slots.push_back(0);
        }

        self.last += std::time::Duration::from_secs(elapsed);
    }

    fn add(&mut self, bytes: usize) {
        if let Some(back) = self.slots.back_mut() {
            *back += bytes;
            self.sum += bytes;
        }
    }

    fn sum(&self) -> usize {
        debug_assert_eq!(self.sum, self.slots.iter().sum::<usize>());
        self.sum
    }
}

/// Limits the downlink to a byte rate averaged over a short sliding window.
#[derive(Debug)]
pub(crate) struct DownlinkLimiter {
    window: Mutex<SlidingWindow>,
    budget: usize,
}

impl DownlinkLimiter {
    const WINDOW_SECS: NonZero<usize> = nonzero!(4);

    #[must_use]
    pub(crate) fn new(rate: NonZero<usize>) -> Self {
        Self::new_at(rate, Instant::now())
    }

    fn new_at(rate: NonZero<usize>, now: Instant) -> Self {
        Self {
            window: Mutex::new(SlidingWindow::new(Self::WINDOW_SECS, now)),
            budget: rate.get().saturating_mul(Self::WINDOW_SECS.get()),
        }
    }

    fn admit_at(&self, bytes: usize, now: Instant) -> bool {
        let mut window = self.window.lock();
        window.advance(now);

        let used = window.sum();
        // an idle window admits any single chunk, or large chunks would starve
        if used > 0 && used.saturating_add(bytes) > self.budget {
            return false;
        }

        window.add(bytes);
        true
    }
}

impl BandwidthPolicy for DownlinkLimiter {
    fn has_downlink_bandwidth(&self, bytes: usize) -> bool {
        self.admit_at(bytes, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn unlimited_always_admits() {
        assert!(Unlimited.has_downlink_bandwidth(0));
        assert!(Unlimited.has_downlink_bandwidth(usize::MAX));
    }

    #[test]
    fn limiter_enforces_budget() {
        let start = Instant::now();
        let limiter = DownlinkLimiter::new_at(nonzero!(100), start);

        // budget of 4 seconds at 100 B/s
        assert!(limiter.admit_at(250, start));
        assert!(limiter.admit_at(150, start));
        assert!(!limiter.admit_at(1, start));
        assert!(!limiter.admit_at(1, start + Duration::from_millis(900)));

        // the first second's slot is still inside the window
        assert!(!limiter.admit_at(1, start + Duration::from_secs(3)));

        // after a full window everything has expired
        assert!(limiter.admit_at(400, start + Duration::from_secs(4)));
        assert!(!limiter.admit_at(1, start + Duration::from_secs(4)));
    }

    #[test]
    fn idle_limiter_admits_oversized_chunk() {
        let start = Instant::now();
        let limiter = DownlinkLimiter::new_at(nonzero!(10), start);

        assert!(limiter.admit_at(1000, start));
        assert!(!limiter.admit_at(1, start + Duration::from_secs(1)));
        assert!(limiter.admit_at(1, start + Duration::from_secs(60)));
    }

    #[test]
    fn window_expires_slots() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(nonzero!(3), start);

        window.add(5);
        window.advance(start + Duration::from_secs(1));
        window.add(7);
        assert_eq!(window.sum(), 12);

        window.advance(start + Duration::from_secs(3));
        assert_eq!(window.sum(), 7);

        window.advance(start + Duration::from_secs(100));
        assert_eq!(window.sum(), 0);
    }
}
