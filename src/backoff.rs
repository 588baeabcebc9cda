//! Retry pacing for pollers and the reconnecting transport.
//!
//! [`FibonacciBackoff`] is tick-driven: a poller calls [`FibonacciBackoff::tick`]
//! once per time unit and fetches only when it returns `true`. Consecutive
//! not-ready outcomes stretch the wait along the fibonacci sequence
//! (`1, 1, 2, 3, 5, 8, ...` ticks); a success drops it back to the base interval.
//!
//! [`ReconnectBackoff`] is delay-driven: the transport asks for the next delay
//! after each failed or lost connection. The delay for attempt `n` is
//! `initial × 2^n`, capped at `max`, with symmetric jitter applied on top.

use rand::Rng;
use std::time::Duration;

/// fib(1) = fib(2) = 1. `fib(0)` is treated as 1 so a wait is never zero ticks.
pub fn fib(step: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..step {
        (a, b) = (b, a.saturating_add(b));
    }
    b
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibonacciBackoff {
    retry_count: u64,
    fibonacci_step: u32,
    wait_interval: u64,
    base_interval: u64,
}

impl FibonacciBackoff {
    pub fn new(base_interval: u64) -> Self {
        let base_interval = base_interval.max(1);
        Self {
            retry_count: 0,
            fibonacci_step: 0,
            wait_interval: base_interval,
            base_interval,
        }
    }

    /// Advance one time unit. Returns `true` when a fetch is due.
    pub fn tick(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count % self.wait_interval == 0
    }

    /// Record a not-ready or transient outcome.
    pub fn on_retryable(&mut self) {
        self.fibonacci_step = self.fibonacci_step.saturating_add(1);
        self.wait_interval = fib(self.fibonacci_step);
        self.retry_count = 0;
    }

    pub fn on_success(&mut self) {
        self.fibonacci_step = 0;
        self.wait_interval = self.base_interval;
        self.retry_count = 0;
    }

    pub fn wait_interval(&self) -> u64 {
        self.wait_interval
    }

    pub fn fibonacci_step(&self) -> u32 {
        self.fibonacci_step
    }

    pub fn retry_count(&self) -> u64 {
        self.retry_count
    }
}

/// Exponential reconnect delay with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter: f64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Number of consecutive failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = base.mul_f64((1.0 + spread).max(0.0));
        // never reconnect immediately
        jittered.max(Duration::from_millis(1)).min(self.max)
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let secs = self.initial.as_secs_f64() * 2f64.powi(exp);
        if !secs.is_finite() || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs).max(Duration::from_millis(1))
        }
    }
}
