//! Fixed-period ticker that paces a state machine's tick loop.
//!
//! The ticker is owned by the machine's background task and polled inside
//! its `tokio::select!` loop, next to the quit and pause signals:
//!
//! ```ignore
//! loop {
//!     tokio::select! {
//!         _ = &mut quit_rx => break,
//!         info = ticker.wait_for_tick() => {
//!             // info.ticks_skipped > 0: the previous action overran
//!             machine.step().await;
//!             ticker.record_tick_end();
//!         }
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{self, Instant as TokioInstant};
use tracing::{debug, trace, warn};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when a tick fires late (the previous action overran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TickPolicy {
    /// Skip the missed tick(s) and schedule the next one from now.
    #[default]
    Skip,
    /// Keep the original cadence; the next tick fires at its originally
    /// scheduled time.
    Drop,
}

/// Configuration for a [`Ticker`].
#[derive(Debug, Clone)]
pub struct TickConfig {
    /// Time between two ticks.
    pub period: Duration,
    /// Overrun handling policy.
    pub policy: TickPolicy,
    /// Fraction of the period (0.0–1.0) an action may take before a
    /// warning is logged.
    pub budget_warn_threshold: f64,
    /// Upper bound of a random delay added to the first tick, so that many
    /// agents started together don't tick in lockstep.
    pub initial_jitter: Duration,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            policy: TickPolicy::default(),
            budget_warn_threshold: 0.80,
            initial_jitter: Duration::ZERO,
        }
    }
}

impl TickConfig {
    /// Shortest supported tick period.
    pub const MIN_PERIOD: Duration = Duration::from_millis(1);

    /// Create a config for a specific period with default settings.
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            ..Default::default()
        }
    }

    /// Clamp out-of-range values so the config is safe to use.
    pub fn validated(mut self) -> Self {
        if self.period < Self::MIN_PERIOD {
            warn!(
                period_ms = self.period.as_secs_f64() * 1000.0,
                "tick period below minimum, clamping"
            );
            self.period = Self::MIN_PERIOD;
        }
        self.budget_warn_threshold = self.budget_warn_threshold.clamp(0.0, 1.0);
        self
    }
}

// ---------------------------------------------------------------------------
// Tick info
// ---------------------------------------------------------------------------

/// Information about a fired tick, returned by [`Ticker::wait_for_tick`].
#[derive(Debug, Clone)]
pub struct TickInfo {
    /// Monotonically increasing tick number (starts at 1).
    pub tick: u64,
    /// `true` if the tick fired more than 10% of a period late.
    pub overrun: bool,
    /// How many ticks were skipped because of the overrun.
    pub ticks_skipped: u64,
}

// ---------------------------------------------------------------------------
// Ticker
// ---------------------------------------------------------------------------

/// Fixed-period ticker with pause/resume and action budget monitoring.
pub struct Ticker {
    config: TickConfig,
    tick_count: u64,
    next_tick: TokioInstant,
    /// Set by `wait_for_tick`, consumed by `record_tick_end`.
    tick_start: Option<Instant>,
    paused: bool,
}

impl Ticker {
    /// Create a new ticker. The first tick is due one period from now,
    /// plus the configured jitter.
    pub fn new(config: TickConfig) -> Self {
        let config = config.validated();

        let jitter = if config.initial_jitter > Duration::ZERO {
            let us = config.initial_jitter.as_micros() as u64;
            Duration::from_micros(rand::rng().random_range(0..us.max(1)))
        } else {
            Duration::ZERO
        };

        debug!(
            period_ms = config.period.as_secs_f64() * 1000.0,
            policy = ?config.policy,
            "ticker created"
        );

        Self {
            next_tick: TokioInstant::now() + config.period + jitter,
            config,
            tick_count: 0,
            tick_start: None,
            paused: false,
        }
    }

    /// Wait until the next tick is due.
    ///
    /// While paused this future pends forever; `tokio::select!` keeps
    /// servicing the other branches.
    pub async fn wait_for_tick(&mut self) -> TickInfo {
        if self.paused {
            std::future::pending::<()>().await;
        }

        let next = self.next_tick;
        let period = self.config.period;
        time::sleep_until(next).await;

        let now = TokioInstant::now();
        self.tick_count += 1;
        self.tick_start = Some(Instant::now());

        let late_by = now.saturating_duration_since(next);
        let overrun = late_by > period / 10;
        let mut ticks_skipped = 0u64;

        self.next_tick = match self.config.policy {
            TickPolicy::Skip => {
                if overrun {
                    ticks_skipped = (late_by.as_nanos() / period.as_nanos()) as u64;
                }
                now + period
            }
            TickPolicy::Drop => next + period,
        };

        trace!(tick = self.tick_count, overrun, "tick fired");

        TickInfo {
            tick: self.tick_count,
            overrun,
            ticks_skipped,
        }
    }

    /// Record that the work for the current tick has finished. Logs a
    /// warning when it used more than the configured share of the period.
    pub fn record_tick_end(&mut self) {
        let Some(start) = self.tick_start.take() else {
            return;
        };
        let elapsed = start.elapsed();
        let utilization = elapsed.as_secs_f64() / self.config.period.as_secs_f64();

        if utilization >= self.config.budget_warn_threshold {
            warn!(
                tick = self.tick_count,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                utilization_pct = format!("{:.1}", utilization * 100.0),
                "state action approaching tick period"
            );
        }
    }

    /// Pause ticking. Idempotent.
    pub fn pause(&mut self) {
        if !self.paused {
            self.paused = true;
            debug!(tick = self.tick_count, "ticker paused");
        }
    }

    /// Resume ticking. The next tick is due one full period from now so the
    /// time spent paused doesn't produce a burst of ticks.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            self.next_tick = TokioInstant::now() + self.config.period;
            debug!(tick = self.tick_count, "ticker resumed");
        }
    }

    /// Number of ticks fired so far.
    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}
