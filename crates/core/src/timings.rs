//! Centralised timing configuration.
//!
//! The lease TTL, reservation TTL, stuck-claim threshold, and reconciler
//! period are coupled: the whole recovery story depends on
//! `period < t_stuck < lease_ttl <= t_res / 10`. Constructing a [`Timings`]
//! value validates the chain once at startup; the value is then threaded
//! into every component. No component reads timing from anywhere else.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimingsError {
    #[error("timing constraint violated: {0}")]
    ConstraintViolated(String),
}

/// Immutable timing configuration, validated on construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    reconcile_period: Duration,
    t_stuck: Duration,
    lease_ttl: Duration,
    t_res: Duration,
}

impl Timings {
    /// Build and validate a timing configuration.
    pub fn new(
        reconcile_period: Duration,
        t_stuck: Duration,
        lease_ttl: Duration,
        t_res: Duration,
    ) -> Result<Self, TimingsError> {
        if reconcile_period.is_zero() {
            return Err(TimingsError::ConstraintViolated(
                "reconcile period must be positive".to_string(),
            ));
        }
        if reconcile_period >= t_stuck {
            return Err(TimingsError::ConstraintViolated(format!(
                "reconcile period {reconcile_period:?} must be < stuck threshold {t_stuck:?}"
            )));
        }
        if t_stuck >= lease_ttl {
            return Err(TimingsError::ConstraintViolated(format!(
                "stuck threshold {t_stuck:?} must be < lease ttl {lease_ttl:?}"
            )));
        }
        if lease_ttl > t_res / 10 {
            return Err(TimingsError::ConstraintViolated(format!(
                "lease ttl {lease_ttl:?} must be <= reservation ttl {t_res:?} / 10"
            )));
        }
        Ok(Self {
            reconcile_period,
            t_stuck,
            lease_ttl,
            t_res,
        })
    }

    /// How often the reconciler sweeps.
    pub fn reconcile_period(&self) -> Duration {
        self.reconcile_period
    }

    /// Age after which a `CLAIMED` run is considered stuck.
    pub fn t_stuck(&self) -> Duration {
        self.t_stuck
    }

    /// Worker visibility lease duration.
    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Budget reservation TTL.
    pub fn t_res(&self) -> Duration {
        self.t_res
    }

    /// Upper bound for any single I/O call made while holding a lease.
    pub fn max_io_timeout(&self) -> Duration {
        self.lease_ttl / 3
    }

    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_ttl).unwrap_or(chrono::Duration::MAX)
    }

    pub fn t_stuck_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.t_stuck).unwrap_or(chrono::Duration::MAX)
    }

    pub fn t_res_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.t_res).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for Timings {
    /// Production defaults: sweep every 60 s, stuck after 5 min, lease 6 min,
    /// reservation 1 h.
    fn default() -> Self {
        Self {
            reconcile_period: Duration::from_secs(60),
            t_stuck: Duration::from_secs(300),
            lease_ttl: Duration::from_secs(360),
            t_res: Duration::from_secs(3600),
        }
    }
}
