//! Polling strategies for settled-request detection.
//!
//! A strategy instance is stateful. The engine instantiates a fresh one per
//! call; sharing an instance across calls would let one call's backoff
//! history starve another's polling.

use backoff::backoff::Backoff;
use std::time::Duration;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLL_INTERVAL_MULTIPLIER: f64 = 1.2;

/// Yields the delay before the next poll, `None` once polling should stop.
pub trait PollStrategy: Send {
    fn next_poll_delay(&mut self) -> Option<Duration>;
}

/// Creates one strategy instance per call.
pub trait PollStrategyFactory: Send + Sync {
    fn instantiate(&self) -> Box<dyn PollStrategy>;
}

impl PollStrategy for backoff::ExponentialBackoff {
    fn next_poll_delay(&mut self) -> Option<Duration> {
        self.next_backoff()
    }
}

/// The stock factory: exponential backoff between half a second and ten
/// seconds, with light jitter.
#[derive(Clone)]
pub struct ExponentialPollStrategyFactory {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl Default for ExponentialPollStrategyFactory {
    fn default() -> Self {
        Self {
            initial_interval: MIN_POLL_INTERVAL,
            max_interval: MAX_POLL_INTERVAL,
            multiplier: POLL_INTERVAL_MULTIPLIER,
            randomization_factor: 0.1,
        }
    }
}

impl PollStrategyFactory for ExponentialPollStrategyFactory {
    fn instantiate(&self) -> Box<dyn PollStrategy> {
        Box::new(backoff::ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            start_time: std::time::Instant::now(),
            max_interval: self.max_interval,
            max_elapsed_time: None,
            clock: backoff::SystemClock::default(),
        })
    }
}
