//! Weight-raising controller (spec §4.6).

use crate::clock::{Duration, Instant};
use crate::config::{Config, SOFTRT_WEIGHT_FACTOR};

/// Inputs the controller needs about a stream transitioning empty → busy,
/// gathered by the caller from `Stream` fields so this module stays a pure
/// function of its inputs (easy to test in isolation).
pub struct ActivationContext {
    pub dispatched_count: u64,
    pub last_activity: Option<Instant>,
    pub in_large_burst: bool,
    pub service_from_backlogged: u32,
    pub last_idle_backlogged: Option<Instant>,
    pub arrived_with_no_in_flight: bool,
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrTrigger {
    Interactive,
    SoftRealtime,
}

/// Evaluates the interactive/soft-real-time predicates (spec §4.6).
pub fn classify_activation(ctx: &ActivationContext, cfg: &Config) -> Option<WrTrigger> {
    if ctx.in_large_burst {
        return None;
    }
    let interactive = ctx.dispatched_count == 0
        && ctx
            .last_activity
            .map(|t| ctx.now.saturating_sub(t) > cfg.wr_min_idle_time)
            .unwrap_or(true);
    if interactive {
        return Some(WrTrigger::Interactive);
    }

    let soft_rt = ctx.arrived_with_no_in_flight
        && ctx
            .last_idle_backlogged
            .map(|t0| {
                let elapsed = ctx.now.saturating_sub(t0);
                if elapsed.0 == 0 {
                    return true;
                }
                // service_from_backlogged / elapsed <= wr_max_softrt_rate
                // (sectors/sec), compared without floats:
                // service * 1e6 <= rate * elapsed_us
                (ctx.service_from_backlogged as u64) * 1_000_000
                    <= cfg.wr_max_softrt_rate * elapsed.as_micros()
            })
            .unwrap_or(false);
    if soft_rt {
        return Some(WrTrigger::SoftRealtime);
    }
    None
}

/// Outcome the caller should apply to the stream's `wr_coeff`/`wr_deadline`.
pub struct WrDecision {
    pub wr_coeff: u32,
    pub wr_deadline: Instant,
}

/// Computes the new weight-raise coefficient/deadline for a freshly
/// triggered or refreshed raise (spec §4.6 "Action").
pub fn start_or_refresh(trigger: WrTrigger, cfg: &Config, wr_duration: Duration, now: Instant) -> WrDecision {
    match trigger {
        WrTrigger::Interactive => WrDecision {
            wr_coeff: cfg.wr_coeff,
            wr_deadline: now + wr_duration,
        },
        WrTrigger::SoftRealtime => WrDecision {
            wr_coeff: cfg.wr_coeff * SOFTRT_WEIGHT_FACTOR,
            wr_deadline: now + cfg.wr_rt_max_time,
        },
    }
}

/// True once a raise should end: its deadline passed, or the stream just
/// joined a large burst (spec §4.6 "Terminate raising").
pub fn should_terminate(wr_deadline: Option<Instant>, now: Instant, in_large_burst: bool) -> bool {
    if in_large_burst {
        return true;
    }
    match wr_deadline {
        Some(deadline) => now > deadline,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(now: Instant) -> ActivationContext {
        ActivationContext {
            dispatched_count: 0,
            last_activity: Some(Instant::ZERO),
            in_large_burst: false,
            service_from_backlogged: 0,
            last_idle_backlogged: None,
            arrived_with_no_in_flight: false,
            now,
        }
    }

    #[test]
    fn interactive_requires_idle_gap_and_no_prior_dispatch() {
        let cfg = Config::default();
        let mut c = ctx(Instant(Duration::from_secs(3).0));
        assert_eq!(classify_activation(&c, &cfg), Some(WrTrigger::Interactive));
        c.dispatched_count = 1;
        assert_eq!(classify_activation(&c, &cfg), None);
    }

    #[test]
    fn large_burst_suppresses_raising() {
        let cfg = Config::default();
        let mut c = ctx(Instant(Duration::from_secs(3).0));
        c.in_large_burst = true;
        assert_eq!(classify_activation(&c, &cfg), None);
    }

    #[test]
    fn soft_realtime_rate_gate() {
        let cfg = Config::default();
        let mut c = ctx(Instant(Duration::from_secs(10).0));
        c.dispatched_count = 5; // not interactive
        c.last_activity = Some(Instant::ZERO);
        c.arrived_with_no_in_flight = true;
        c.last_idle_backlogged = Some(Instant::ZERO);
        c.service_from_backlogged = 1_000; // small service over 10s << 7000/s
        assert_eq!(classify_activation(&c, &cfg), Some(WrTrigger::SoftRealtime));
    }

    #[test]
    fn termination_on_deadline_or_burst() {
        assert!(should_terminate(Some(Instant(10)), Instant(11), false));
        assert!(!should_terminate(Some(Instant(10)), Instant(9), false));
        assert!(should_terminate(Some(Instant(10)), Instant(9), true));
    }
}
