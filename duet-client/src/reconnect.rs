//! Bounded connectivity-restart loop
//!
//! A single fixed-interval ticker runs while the transport is disconnected.
//! Every tick inside the budget is one restart attempt. The first tick at or
//! past the budget exhausts the loop.

use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub budget: Duration,
}

/// What to do on a retry tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send a connectivity-restart offer; carries the 1-based attempt number
    Attempt(u32),
    /// Budget spent; the loop has stopped
    Exhausted,
    /// No loop is running (a tick raced with cancellation)
    Idle,
}

pub struct ReconnectionManager {
    policy: RetryPolicy,
    started_at: Option<Instant>,
    attempts: u32,
    ticker: Option<JoinHandle<()>>,
}

impl ReconnectionManager {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            started_at: None,
            attempts: 0,
            ticker: None,
        }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.started_at.is_some()
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start the loop. `tick` is sent on `tx` every interval.
    ///
    /// Returns false, and changes nothing, if a loop is already running.
    pub fn start<T>(&mut self, tx: mpsc::UnboundedSender<T>, tick: T) -> bool
    where
        T: Clone + Send + 'static,
    {
        if self.is_active() {
            debug!("Retry loop already running");
            return false;
        }

        let now = Instant::now();
        let interval = self.policy.interval;
        self.started_at = Some(now);
        self.attempts = 0;
        self.ticker = Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(now + interval, interval);
            loop {
                timer.tick().await;
                if tx.send(tick.clone()).is_err() {
                    break;
                }
            }
        }));

        info!(
            interval_secs = interval.as_secs(),
            budget_secs = self.policy.budget.as_secs(),
            "Retry loop started"
        );
        true
    }

    pub fn on_tick(&mut self) -> RetryDecision {
        let Some(started_at) = self.started_at else {
            return RetryDecision::Idle;
        };

        if started_at.elapsed() >= self.policy.budget {
            info!(attempts = self.attempts, "Retry budget exhausted");
            self.cancel();
            return RetryDecision::Exhausted;
        }

        self.attempts += 1;
        RetryDecision::Attempt(self.attempts)
    }

    /// Stop the loop. Safe to call at any time, any number of times.
    pub fn cancel(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        self.started_at = None;
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.cancel();
    }
}
