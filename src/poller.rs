//! Fixed-interval polling of an externally owned status until it reaches a
//! terminal value.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use log::{info, warn};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Default)]
pub struct TerminalStates {
    success: HashSet<String>,
    failure: HashSet<String>,
}

impl TerminalStates {
    pub fn new(success: &[&str], failure: &[&str]) -> Self {
        Self {
            success: success.iter().map(|s| s.to_string()).collect(),
            failure: failure.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// ACM certificate lifecycle.
    pub fn certificate() -> Self {
        Self::new(
            &["ISSUED"],
            &["FAILED", "VALIDATION_TIMED_OUT", "REVOKED", "EXPIRED", "INACTIVE"],
        )
    }

    /// CloudFront distribution rollout. Distributions have no failure state.
    pub fn distribution() -> Self {
        Self::new(&["Deployed"], &[])
    }

    pub fn is_success(&self, status: &str) -> bool {
        self.success.contains(status)
    }

    pub fn is_failure(&self, status: &str) -> bool {
        self.failure.contains(status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded(String),
    Failed(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub outcome: PollOutcome,
    pub observations: u32,
    pub waits: u32,
}

#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    timeout: Option<Duration>,
}

impl Poller {
    pub fn new(interval: Duration, timeout: Option<Duration>) -> Self {
        Self { interval, timeout }
    }

    /// Invoke `fetch` until it returns a terminal status, the deadline passes,
    /// or `cancel` resolves. A failed fetch is logged and treated as a
    /// non-terminal observation.
    pub async fn poll<F, Fut, C>(
        &self,
        label: &str,
        terminal: &TerminalStates,
        mut fetch: F,
        cancel: C,
    ) -> PollReport
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String>>,
        C: Future<Output = ()>,
    {
        tokio::pin!(cancel);
        let started = Instant::now();
        let mut observations = 0;
        let mut waits = 0;

        let report = |outcome, observations, waits| PollReport {
            outcome,
            observations,
            waits,
        };

        loop {
            let observed = tokio::select! {
                result = fetch() => result,
                _ = &mut cancel => return report(PollOutcome::Cancelled, observations, waits),
            };
            observations += 1;

            match observed {
                Ok(status) => {
                    info!("{} {} status: {}", clock(), label, status);
                    if terminal.is_success(&status) {
                        return report(PollOutcome::Succeeded(status), observations, waits);
                    }
                    if terminal.is_failure(&status) {
                        return report(PollOutcome::Failed(status), observations, waits);
                    }
                }
                Err(e) => warn!("{} Failed to fetch {} status: {:#}", clock(), label, e),
            }

            if let Some(timeout) = self.timeout {
                if started.elapsed() + self.interval > timeout {
                    warn!("Gave up on {} after {}s", label, started.elapsed().as_secs());
                    return report(PollOutcome::TimedOut, observations, waits);
                }
            }

            info!(
                "Checking {} again in {} seconds... (Ctrl+C to stop)",
                label,
                self.interval.as_secs()
            );
            waits += 1;
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = &mut cancel => {
                    info!("Monitoring of {} stopped", label);
                    return report(PollOutcome::Cancelled, observations, waits);
                }
            }
        }
    }
}

fn clock() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}
