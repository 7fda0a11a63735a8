use chrono::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TtlConfigError {
    #[error("sweep_period must be strictly less than t_stuck (got sweep_period={sweep_period_secs}s, t_stuck={t_stuck_secs}s)")]
    SweepPeriodNotLessThanTStuck {
        sweep_period_secs: i64,
        t_stuck_secs: i64,
    },
    #[error("t_stuck must be strictly less than lease_ttl (got t_stuck={t_stuck_secs}s, lease_ttl={lease_ttl_secs}s)")]
    TStuckNotLessThanLeaseTtl {
        t_stuck_secs: i64,
        lease_ttl_secs: i64,
    },
    #[error("lease_ttl must be at most t_res / 10 (got lease_ttl={lease_ttl_secs}s, t_res={t_res_secs}s)")]
    LeaseTtlExceedsTResBudget {
        lease_ttl_secs: i64,
        t_res_secs: i64,
    },
}

/// Centralised TTL constants threaded into every component that needs them
/// (spec.md §9: "Configuration ... is an immutable value constructed at
/// startup and threaded into all components; no hidden globals").
///
/// The ordering invariant `period < t_stuck < lease_ttl <= t_res / 10` is
/// the "known footgun" spec.md §9 calls out; [`Ttls::validate`] enforces it
/// once at startup rather than trusting every call site.
#[derive(Debug, Clone, Copy)]
pub struct Ttls {
    /// Reservation TTL in the Budget Engine. Must be far larger than
    /// `t_stuck` so Case B's safety check has room to distinguish "settled
    /// but not committed" from "reservation expired on its own".
    pub t_res: Duration,
    /// Age past which a `CLAIMED` run is considered stuck and eligible for
    /// Reconciler Sweep 2.
    pub t_stuck: Duration,
    /// Worker lease duration.
    pub lease_ttl: Duration,
    /// Reconciler scheduling period for both sweeps.
    pub sweep_period: Duration,
}

impl Ttls {
    pub fn validate(&self) -> Result<(), TtlConfigError> {
        if self.sweep_period >= self.t_stuck {
            return Err(TtlConfigError::SweepPeriodNotLessThanTStuck {
                sweep_period_secs: self.sweep_period.num_seconds(),
                t_stuck_secs: self.t_stuck.num_seconds(),
            });
        }
        if self.t_stuck >= self.lease_ttl {
            return Err(TtlConfigError::TStuckNotLessThanLeaseTtl {
                t_stuck_secs: self.t_stuck.num_seconds(),
                lease_ttl_secs: self.lease_ttl.num_seconds(),
            });
        }
        if self.lease_ttl > self.t_res / 10 {
            return Err(TtlConfigError::LeaseTtlExceedsTResBudget {
                lease_ttl_secs: self.lease_ttl.num_seconds(),
                t_res_secs: self.t_res.num_seconds(),
            });
        }
        Ok(())
    }
}

impl Default for Ttls {
    /// spec.md §4.4's own worked example: sweep every 60s, t_stuck = 5min,
    /// t_res = 1h.
    fn default() -> Self {
        Self {
            t_res: Duration::hours(1),
            t_stuck: Duration::minutes(5),
            lease_ttl: Duration::minutes(6),
            sweep_period: Duration::seconds(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ttls_satisfy_their_own_ordering_invariant() {
        Ttls::default().validate().expect("defaults must validate");
    }

    #[test]
    fn rejects_sweep_period_not_less_than_t_stuck() {
        let ttls = Ttls {
            sweep_period: Duration::minutes(5),
            ..Ttls::default()
        };
        assert!(matches!(
            ttls.validate(),
            Err(TtlConfigError::SweepPeriodNotLessThanTStuck { .. })
        ));
    }

    #[test]
    fn rejects_lease_ttl_exceeding_t_res_budget() {
        let ttls = Ttls {
            lease_ttl: Duration::minutes(10),
            t_res: Duration::minutes(30),
            ..Ttls::default()
        };
        assert!(matches!(
            ttls.validate(),
            Err(TtlConfigError::LeaseTtlExceedsTResBudget { .. })
        ));
    }
}
