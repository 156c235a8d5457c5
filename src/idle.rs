//! Idle-slice policy (spec §4.9): decides whether to arm the idle timer
//! after a stream's sort list drains, and for how long.

use crate::clock::Duration;
use crate::config::{Config, MIN_IDLE_TT};

/// Everything the policy needs about the candidate stream and the scenario
/// it's competing in (spec §4.9 "Decision inputs").
pub struct IdleContext {
    pub sync: bool,
    pub seeky: bool,
    pub idle_window_enabled: bool,
    pub is_weight_raised: bool,
    /// True when every other active stream in the same domain has the same
    /// weight (spec §4.9 "symmetric scenario", `WeightCounterTree::symmetric`).
    pub symmetric_scenario: bool,
    pub strict_guarantees: bool,
}

/// Whether the idle timer should be armed at all (spec §4.9). Idling costs
/// throughput, so it's only worth it when skipping it would let a less
/// deserving stream jump ahead: seeky streams and symmetric scenarios (where
/// every sibling would get its fair share anyway) skip idling unless
/// `strict_guarantees` or the stream is weight-raised.
pub fn should_idle(ctx: &IdleContext, cfg: &Config) -> bool {
    if cfg.slice_idle == Duration::ZERO {
        return false;
    }
    if !ctx.sync {
        return false;
    }
    if !ctx.idle_window_enabled {
        return false;
    }
    if ctx.strict_guarantees {
        return true;
    }
    if ctx.is_weight_raised {
        return true;
    }
    if ctx.seeky {
        return false;
    }
    if ctx.symmetric_scenario {
        return false;
    }
    true
}

/// Idle-wait duration once idling is decided (spec §4.9): seeky streams and
/// symmetric scenarios (the cases that only idle at all because of
/// `strict_guarantees`/weight-raise) get clamped to `MIN_IDLE_TT` rather than
/// the full `slice_idle`.
pub fn idle_timeout(ctx: &IdleContext, cfg: &Config) -> Duration {
    if ctx.seeky || ctx.symmetric_scenario {
        cfg.slice_idle.min(MIN_IDLE_TT)
    } else {
        cfg.slice_idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> IdleContext {
        IdleContext {
            sync: true,
            seeky: false,
            idle_window_enabled: true,
            is_weight_raised: false,
            symmetric_scenario: false,
            strict_guarantees: false,
        }
    }

    #[test]
    fn async_and_disabled_window_never_idle() {
        let cfg = Config::default();
        let mut c = base();
        c.sync = false;
        assert!(!should_idle(&c, &cfg));
        let mut c2 = base();
        c2.idle_window_enabled = false;
        assert!(!should_idle(&c2, &cfg));
    }

    #[test]
    fn symmetric_scenario_skips_idle_unless_raised_or_strict() {
        let cfg = Config::default();
        let mut c = base();
        c.symmetric_scenario = true;
        assert!(!should_idle(&c, &cfg));
        c.is_weight_raised = true;
        assert!(should_idle(&c, &cfg));
        c.is_weight_raised = false;
        c.strict_guarantees = true;
        assert!(should_idle(&c, &cfg));
    }

    #[test]
    fn seeky_clamps_to_min_idle_tt() {
        let cfg = Config::default();
        let mut c = base();
        c.seeky = true;
        c.strict_guarantees = true; // still idles, just briefly
        assert!(should_idle(&c, &cfg));
        assert_eq!(idle_timeout(&c, &cfg), cfg.slice_idle.min(MIN_IDLE_TT));
    }

    #[test]
    fn zero_slice_idle_disables_idling() {
        let mut cfg = Config::default();
        cfg.slice_idle = Duration::ZERO;
        assert!(!should_idle(&base(), &cfg));
    }
}
