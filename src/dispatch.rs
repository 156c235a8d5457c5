//! Pure dispatch-decision helpers (spec §4.3 "Dispatch", §4.2 "Preemption
//! rule"). The orchestration that actually walks the group/stream arenas
//! lives in `scheduler.rs`; this module holds the parts of that logic that
//! don't need arena access, so they can be tested in isolation.

use crate::clock::Instant;
use crate::priority::IoprioClass;

/// True once the in-service stream's budget is exhausted (spec §4.2
/// `BUDGET_EXHAUSTED`).
pub fn budget_exhausted(service: u32, budget: u32) -> bool {
    service >= budget
}

/// True once the in-service stream's slice has run past its timeout (spec
/// §4.2 `BUDGET_TIMEOUT`).
pub fn budget_timed_out(budget_timeout: Option<Instant>, now: Instant) -> bool {
    budget_timeout.map(|t| now >= t).unwrap_or(false)
}

/// Whether a stream arriving in `arriving_class` should preempt whatever is
/// currently in service (spec §4.2 "Preemption rule"): a strictly more
/// urgent class preempts, unless the in-service stream is itself
/// weight-raised, in which case its slot runs to completion.
pub fn should_preempt(in_service_class: IoprioClass, in_service_is_weight_raised: bool, arriving_class: IoprioClass) -> bool {
    arriving_class < in_service_class && !in_service_is_weight_raised
}

/// Class scan order for selecting the next domain to dispatch from (spec
/// §4.3 step 1): real-time first, then best-effort, then idle. `IoprioClass`
/// is already declared in this order, so this just documents the contract
/// callers rely on.
pub const CLASS_SCAN_ORDER: [IoprioClass; 3] = [IoprioClass::Realtime, IoprioClass::BestEffort, IoprioClass::Idle];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Duration;

    #[test]
    fn budget_exhausted_at_or_past_limit() {
        assert!(!budget_exhausted(5, 10));
        assert!(budget_exhausted(10, 10));
        assert!(budget_exhausted(11, 10));
    }

    #[test]
    fn timeout_only_once_deadline_passed() {
        assert!(!budget_timed_out(None, Instant::ZERO));
        let deadline = Instant::ZERO + Duration::from_millis(100);
        assert!(!budget_timed_out(Some(deadline), Instant::ZERO));
        assert!(budget_timed_out(Some(deadline), deadline));
    }

    #[test]
    fn realtime_preempts_best_effort_unless_raised() {
        assert!(should_preempt(IoprioClass::BestEffort, false, IoprioClass::Realtime));
        assert!(!should_preempt(IoprioClass::BestEffort, true, IoprioClass::Realtime));
        assert!(!should_preempt(IoprioClass::Realtime, false, IoprioClass::BestEffort));
    }
}
