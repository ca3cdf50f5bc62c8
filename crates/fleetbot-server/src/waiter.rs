use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};

pub trait DelayStrategy: Send + Sync {
    /// Delay before probe number `attempt` (1-based; the first probe runs immediately).
    fn delay(&self, attempt: u32) -> Duration;
}

pub struct ConstantDelay(pub Duration);

impl DelayStrategy for ConstantDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

pub struct WaitPolicy {
    pub delay: Box<dyn DelayStrategy>,
    pub timeout: Duration,
}

impl WaitPolicy {
    pub fn constant(delay: Duration, timeout: Duration) -> Self {
        Self {
            delay: Box::new(ConstantDelay(delay)),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Reached(T),
    TimedOut(Option<T>),
}

/// Probes until `done` accepts an observation or the budget runs out.
///
/// Probe errors abort the wait. Probes and sleeps are clamped to the remaining
/// budget, so the call returns within the timeout plus scheduling slack.
pub async fn wait_for_status<T, E, P, Fut, D>(
    policy: &WaitPolicy,
    mut probe: P,
    done: D,
) -> Result<WaitOutcome<T>, E>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: Fn(&T) -> bool,
{
    let deadline = Instant::now() + policy.timeout;
    let mut last = None;
    let mut attempt = 0u32;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WaitOutcome::TimedOut(last));
        }
        let observed = match timeout(remaining, probe()).await {
            Ok(result) => result?,
            Err(_) => return Ok(WaitOutcome::TimedOut(last)),
        };
        if done(&observed) {
            return Ok(WaitOutcome::Reached(observed));
        }
        last = Some(observed);
        attempt += 1;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(WaitOutcome::TimedOut(last));
        }
        sleep(policy.delay.delay(attempt).min(remaining)).await;
    }
}
