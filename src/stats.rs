//! Allocation statistics.

use core::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct StatCount {
    pub allocated: AtomicI64,
    pub freed: AtomicI64,
    pub peak: AtomicI64,
    pub current: AtomicI64,
}

impl StatCount {
    const fn new() -> Self {
        Self {
            allocated: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        self.update(amount);
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount);
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
        if amount > 0 {
            self.allocated.fetch_add(amount, Ordering::Relaxed);
        } else {
            self.freed.fetch_add(-amount, Ordering::Relaxed);
        }
    }
}

/// Process-wide counters, all in bytes except `blocks`.
pub struct Stats {
    pub blocks: StatCount,
    pub metadata: StatCount,
    pub small: StatCount,
    pub large: StatCount,
    pub purged: StatCount,
}

static STATS: Stats = Stats {
    blocks: StatCount::new(),
    metadata: StatCount::new(),
    small: StatCount::new(),
    large: StatCount::new(),
    purged: StatCount::new(),
};

pub fn stats() -> &'static Stats {
    &STATS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peak_tracks_high_water_mark() {
        let c = StatCount::default();
        c.increase(10);
        c.increase(5);
        c.decrease(12);
        c.increase(1);
        assert_eq!(c.current.load(Ordering::Relaxed), 4);
        assert_eq!(c.peak.load(Ordering::Relaxed), 15);
        assert_eq!(c.allocated.load(Ordering::Relaxed), 16);
        assert_eq!(c.freed.load(Ordering::Relaxed), 12);
    }
}
