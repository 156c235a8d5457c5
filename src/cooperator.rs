//! Cooperator detector and queue merger (spec §4.7).
//!
//! The position tree itself lives per-group (`Group::positions`, spec §3
//! "Position tree (per group)"); this module holds the pure acceptance
//! predicate and the merge/split bookkeeping helpers the scheduler applies
//! once a candidate is found.

use crate::clock::{Duration, Instant};
use crate::priority::IoprioClass;

/// Everything the acceptance predicate needs about one side of a candidate
/// pair (spec §4.7 step 3).
pub struct CandidateInfo {
    pub sync: bool,
    pub seeky: bool,
    pub class: IoprioClass,
    pub parent: crate::group::GroupId,
    pub wr_started_at: Option<Instant>,
    pub is_oom_fallback: bool,
}

/// True if `a` and `b` may be merged (spec §4.7 step 3): both sync, neither
/// seeky, same priority class and parent group, neither weight-raised for
/// more than 100ms, neither the OOM fallback stream.
pub fn may_merge(a: &CandidateInfo, b: &CandidateInfo, now: Instant) -> bool {
    if a.is_oom_fallback || b.is_oom_fallback {
        return false;
    }
    if !a.sync || !b.sync {
        return false;
    }
    if a.seeky || b.seeky {
        return false;
    }
    if a.class != b.class || a.parent != b.parent {
        return false;
    }
    let raised_too_long = |started: Option<Instant>| {
        started
            .map(|t| now.saturating_sub(t) > Duration::from_millis(100))
            .unwrap_or(false)
    };
    if raised_too_long(a.wr_started_at) || raised_too_long(b.wr_started_at) {
        return false;
    }
    true
}

/// `close_thr`-distance test (spec §4.7 step 1/2): true if `a` and `b` are
/// within `within` sectors of each other.
pub fn is_close(a: u64, b: u64, within: u64) -> bool {
    a.abs_diff(b) <= within
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupId;

    fn candidate() -> CandidateInfo {
        CandidateInfo {
            sync: true,
            seeky: false,
            class: IoprioClass::BestEffort,
            parent: GroupId(0),
            wr_started_at: None,
            is_oom_fallback: false,
        }
    }

    #[test]
    fn rejects_seeky_or_async_or_cross_class() {
        let a = candidate();
        let mut b = candidate();
        assert!(may_merge(&a, &b, Instant::ZERO));
        b.seeky = true;
        assert!(!may_merge(&a, &b, Instant::ZERO));
        let mut c = candidate();
        c.sync = false;
        assert!(!may_merge(&a, &c, Instant::ZERO));
        let mut d = candidate();
        d.class = IoprioClass::Realtime;
        assert!(!may_merge(&a, &d, Instant::ZERO));
    }

    #[test]
    fn rejects_long_raised_or_oom_fallback() {
        let a = candidate();
        let mut b = candidate();
        b.wr_started_at = Some(Instant::ZERO);
        assert!(may_merge(&a, &b, Instant::ZERO + Duration::from_millis(50)));
        assert!(!may_merge(&a, &b, Instant::ZERO + Duration::from_millis(200)));

        let mut e = candidate();
        e.is_oom_fallback = true;
        assert!(!may_merge(&a, &e, Instant::ZERO));
    }

    #[test]
    fn close_threshold() {
        assert!(is_close(100, 100 + 16_384, 16_384));
        assert!(!is_close(100, 100 + 16_385, 16_384));
    }
}
