//! Cancellable exponential backoff.
//!
//! `exponential_backoff` runs a probe immediately and then again after each
//! delay of the [`Backoff`] policy until the probe reports [`Readiness::Ready`],
//! fails, or the step budget runs out. The loop checks the cancellation token
//! before every probe and while sleeping.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Delay schedule for a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub duration: Duration,
    /// Growth applied to the delay after each step.
    pub factor: f64,
    /// Maximum number of probe attempts.
    pub steps: u32,
    /// Upper limit of a single delay. Without one, a delay that no longer
    /// fits in a `Duration` saturates at `Duration::MAX`.
    pub cap: Option<Duration>,
}

impl Backoff {
    pub const fn new(duration: Duration, factor: f64, steps: u32) -> Self {
        Self {
            duration,
            factor,
            steps,
            cap: None,
        }
    }

    pub const fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Returns the current delay and advances the schedule by one step.
    pub fn step(&mut self) -> Duration {
        if self.steps < 1 {
            return self.duration;
        }
        self.steps -= 1;

        let current = self.duration;
        if self.factor != 0.0 {
            let limit = self.cap.unwrap_or(Duration::MAX);
            self.duration = grow(current, self.factor).map_or(limit, |next| next.min(limit));
        }
        current
    }

    /// Upper bound of the time spent sleeping when every attempt is used.
    pub fn total_delay(&self) -> Duration {
        let mut schedule = *self;
        let mut total = Duration::ZERO;
        while schedule.steps > 1 {
            total = total.saturating_add(schedule.step());
        }
        total
    }

    /// Whether the uncapped schedule stays within `Duration` for every step.
    pub fn is_representable(&self) -> bool {
        if self.steps <= 1 {
            return true;
        }
        let sleeps = f64::from(self.steps - 1);
        let initial = self.duration.as_secs_f64();
        let total = if self.factor == 1.0 || self.factor == 0.0 {
            initial * sleeps
        } else {
            initial * (self.factor.powf(sleeps) - 1.0) / (self.factor - 1.0)
        };
        Duration::try_from_secs_f64(total).is_ok()
    }
}

fn grow(current: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(current.as_secs_f64() * factor).ok()
}

/// Outcome of a single probe.
#[derive(Debug)]
pub enum Readiness<E> {
    Ready,
    NotReady,
    Failed(E),
}

/// The loop stopped without the condition being met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("timed out waiting for the condition after {steps} attempts")]
    Exhausted { steps: u32 },

    #[error("cancelled while waiting for the condition")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error(transparent)]
    Failed(E),
}

impl<E> WaitError<E> {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, WaitError::Interrupted(_))
    }
}

pub async fn exponential_backoff<F, Fut, E>(
    ctx: &CancellationToken,
    mut backoff: Backoff,
    mut probe: F,
) -> Result<(), WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness<E>>,
{
    let budget = backoff.steps;
    while backoff.steps > 0 {
        if ctx.is_cancelled() {
            return Err(Interrupted::Cancelled.into());
        }

        match probe().await {
            Readiness::Ready => return Ok(()),
            Readiness::Failed(e) => return Err(WaitError::Failed(e)),
            Readiness::NotReady => {}
        }

        if backoff.steps == 1 {
            break;
        }

        let delay = backoff.step();
        tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(Interrupted::Cancelled.into()),
            _ = sleep(delay) => {}
        }
    }

    Err(Interrupted::Exhausted { steps: budget }.into())
}

/// Runs `fut` until it completes or `ctx` is cancelled, whichever comes first.
/// Returns `None` on cancellation.
pub(crate) async fn cancellable<T>(
    ctx: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => None,
        out = fut => Some(out),
    }
}
