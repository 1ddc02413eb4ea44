//! Simulation context implementing TacticalContext for deterministic runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tacview_env::{EnvError, TacticalContext};
use tracing::Instrument;

/// 2024-01-01 00:00:00 UTC
const SIM_EPOCH_SECS: u64 = 1_704_067_200;

/// Simulation context backed by a virtual clock.
///
/// - Time only moves when the runner advances it (or a task sleeps)
/// - `system_time` is the virtual clock offset from a fixed epoch, so
///   `stale_at` comparisons are reproducible across runs
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<AtomicU64>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(AtomicU64::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(SIM_EPOCH_SECS),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.virtual_time_ns.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Moves the virtual clock to an absolute time. It never goes backwards.
    pub fn set_time(&self, time_ns: u64) -> Result<(), EnvError> {
        self.virtual_time_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (time_ns >= current).then_some(time_ns)
            })
            .map(|_| ())
            .map_err(|current_ns| EnvError::ClockRegression {
                current_ns,
                requested_ns: time_ns,
            })
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.virtual_time_ns.load(Ordering::SeqCst)
    }

    /// Virtual wall-clock time as UTC.
    pub fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.system_time())
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl TacticalContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping advances virtual time instead of waiting
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name, seed = self.seed);
        tokio::spawn(future.instrument(span));
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
