//! Session expiration.
//!
//! Expired sessions are removed in one of two ways, chosen once at startup:
//!
//! - **Native**: the region's own entry idle timeout removes the entry and
//!   reports it with an expiration-origin event.
//! - **Proactive**: a background sweep periodically asks a [`Reaper`] to
//!   remove everything the [`ExpirationPolicy`] considers expired. Used when
//!   the topology does not allow native expiration, the region does not
//!   support it, or the policy needs more than an idle timeout.
//!
//! Independently of the mode, every read checks the policy and treats an
//! expired session as absent.

use std::fmt::Debug;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::Result;
use crate::record::SessionState;
use crate::region::{ExpirationAttributes, Region};
use crate::topology::is_expiration_allowed;

/// Decides whether a stored session is expired.
pub trait ExpirationPolicy: Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Whether `state` is expired as of `now`.
    fn is_expired(&self, state: &SessionState, now: DateTime<Utc>) -> bool;

    /// Whether a region's entry idle timeout alone enforces this policy.
    ///
    /// Anything else needs the proactive sweep.
    fn is_idle_timeout_only(&self) -> bool {
        false
    }
}

/// Expire after the session's own max inactive interval of idleness.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleTimeoutExpirationPolicy;

impl ExpirationPolicy for IdleTimeoutExpirationPolicy {
    fn name(&self) -> &'static str {
        "idle-timeout"
    }

    fn is_expired(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        state.is_expired_at(now)
    }

    fn is_idle_timeout_only(&self) -> bool {
        true
    }
}

/// Expire a fixed time after creation, in addition to the idle timeout.
#[derive(Debug, Clone, Copy)]
pub struct FixedDurationExpirationPolicy {
    duration: TimeDelta,
}

impl FixedDurationExpirationPolicy {
    /// Expire sessions `duration` after creation.
    pub fn new(duration: TimeDelta) -> Self {
        Self { duration }
    }

    /// The fixed lifetime.
    pub fn duration(&self) -> TimeDelta {
        self.duration
    }
}

impl ExpirationPolicy for FixedDurationExpirationPolicy {
    fn name(&self) -> &'static str {
        "fixed-duration"
    }

    fn is_expired(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        state.is_expired_at(now) || now - state.creation_time > self.duration
    }
}

/// Policy selected by `config`.
pub fn policy_from_config(config: &SessionConfig) -> Arc<dyn ExpirationPolicy> {
    match config.fixed_duration() {
        Some(duration) => Arc::new(FixedDurationExpirationPolicy::new(duration)),
        None => Arc::new(IdleTimeoutExpirationPolicy),
    }
}

/// How expired sessions get removed from the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationMode {
    /// The region expires entries itself.
    Native(ExpirationAttributes),
    /// A background sweep removes expired entries.
    Proactive { sweep_interval: Duration },
}

impl ExpirationMode {
    /// Pick the mode for `config` and `policy` against `region`.
    ///
    /// Native expiration needs the topology to allow it, the region to support
    /// it, a positive default idle timeout, and a policy the idle timeout can
    /// enforce on its own.
    pub fn resolve(
        config: &SessionConfig,
        policy: &dyn ExpirationPolicy,
        region: &dyn Region,
    ) -> Self {
        let allowed = is_expiration_allowed(
            config.topology,
            config.client_shortcut,
            config.server_shortcut,
        );
        let timeout = config.max_inactive_interval();

        if allowed
            && region.supports_native_expiration()
            && timeout > TimeDelta::zero()
            && policy.is_idle_timeout_only()
        {
            ExpirationMode::Native(ExpirationAttributes::new(timeout, config.expiration.action))
        } else {
            ExpirationMode::Proactive {
                sweep_interval: config.sweep_interval(),
            }
        }
    }

    /// Whether the region expires entries itself.
    pub fn is_native(&self) -> bool {
        matches!(self, ExpirationMode::Native(_))
    }
}

impl std::fmt::Display for ExpirationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpirationMode::Native(_) => write!(f, "native"),
            ExpirationMode::Proactive { .. } => write!(f, "proactive"),
        }
    }
}

/// Removes expired sessions on behalf of the sweep.
#[async_trait]
pub trait Reaper: Send + Sync {
    /// Remove every expired session. Returns how many were removed.
    async fn reap_expired(&self) -> Result<usize>;
}

/// Applies an [`ExpirationMode`] to a region and answers lazy checks.
#[derive(Debug)]
pub struct ExpirationEngine {
    policy: Arc<dyn ExpirationPolicy>,
    mode: ExpirationMode,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl ExpirationEngine {
    /// Engine applying `policy` in `mode`.
    pub fn new(policy: Arc<dyn ExpirationPolicy>, mode: ExpirationMode) -> Self {
        Self {
            policy,
            mode,
            sweeper: Mutex::new(None),
        }
    }

    /// The resolved mode.
    pub fn mode(&self) -> ExpirationMode {
        self.mode
    }

    /// The policy used for lazy checks and sweeps.
    pub fn policy(&self) -> &Arc<dyn ExpirationPolicy> {
        &self.policy
    }

    /// Lazy check of one stored session.
    pub fn is_expired(&self, state: &SessionState, now: DateTime<Utc>) -> bool {
        self.policy.is_expired(state, now)
    }

    /// Whether the proactive sweep is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper.lock().is_some()
    }

    /// Configure `region` for the mode, starting the sweep if proactive.
    ///
    /// The sweep holds only a weak reference to `reaper` and stops once it is gone.
    pub async fn install(&self, region: &dyn Region, reaper: Weak<dyn Reaper>) -> Result<()> {
        match self.mode {
            ExpirationMode::Native(attributes) => {
                region.configure_expiration(attributes).await?;
                info!(
                    region = %region.name(),
                    timeout_secs = attributes.timeout.num_seconds(),
                    action = %attributes.action,
                    "Using native session expiration"
                );
            }
            ExpirationMode::Proactive { sweep_interval } => {
                if region.supports_native_expiration() {
                    region
                        .configure_expiration(ExpirationAttributes::disabled())
                        .await?;
                }
                self.start_sweep(sweep_interval, reaper);
                let sweep_interval_ms =
                    u64::try_from(sweep_interval.as_millis()).unwrap_or(u64::MAX);
                info!(
                    region = %region.name(),
                    policy = self.policy.name(),
                    sweep_interval_ms,
                    "Using proactive session expiration"
                );
            }
        }
        Ok(())
    }

    fn start_sweep(&self, period: Duration, reaper: Weak<dyn Reaper>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }

        // tokio intervals panic on a zero period.
        let period = period.max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(live) = reaper.upgrade() else { break };
                        match live.reap_expired().await {
                            Ok(0) => {}
                            Ok(count) => debug!(count, "Expiration sweep removed sessions"),
                            Err(e) => warn!(error = %e, "Expiration sweep failed"),
                        }
                    }
                }
            }
            debug!("Expiration sweep stopped");
        });
        *sweeper = Some(token);
    }

    /// Stop the sweep. Returns whether one was running.
    pub fn stop(&self) -> bool {
        match self.sweeper.lock().take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for ExpirationEngine {
    fn drop(&mut self) {
        if let Some(token) = self.sweeper.get_mut().take() {
            token.cancel();
        }
    }
}
