//! Cooperative yielding for long synchronous scans.

use std::thread;
use std::time::{Duration, Instant};

/// Called once per unit of work in long loops.
pub trait YieldProvider {
    fn tick(&mut self);
}

/// Never yields.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoYield;

impl YieldProvider for NoYield {
    fn tick(&mut self) {}
}

/// Yields the thread every `every` ticks, but no more often than
/// `min_interval`.
#[derive(Debug, Clone)]
pub struct CooperativeYield {
    every: u64,
    min_interval: Duration,
    ticks: u64,
    yields: u64,
    last_yield: Instant,
}

impl CooperativeYield {
    pub fn new(every: u64, min_interval: Duration) -> Self {
        CooperativeYield {
            every,
            min_interval,
            ticks: 0,
            yields: 0,
            last_yield: Instant::now(),
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn yields(&self) -> u64 {
        self.yields
    }
}

impl YieldProvider for CooperativeYield {
    fn tick(&mut self) {
        self.ticks += 1;
        if self.every == 0 || self.ticks % self.every != 0 {
            return;
        }
        if self.last_yield.elapsed() < self.min_interval {
            return;
        }
        thread::yield_now();
        self.yields += 1;
        self.last_yield = Instant::now();
    }
}
