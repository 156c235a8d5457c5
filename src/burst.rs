//! Burst detector (spec §4.8): suppresses weight raising and idling for
//! cohorts of sibling streams spawned together.

use alloc::collections::BTreeSet;

use crate::clock::{Duration, Instant};
use crate::group::GroupId;
use crate::stream::StreamId;

pub struct BurstDetector {
    members: BTreeSet<StreamId>,
    parent: Option<GroupId>,
    last_ins_in_burst: Option<Instant>,
    large_burst: bool,
    threshold: usize,
    interval: Duration,
}

/// What the caller should do with the streams named in [`Outcome::newly_large`]
/// (mark every one `in_large_burst`) and/or [`Outcome::joined`] (mark just
/// the activating stream).
#[derive(Debug, Default)]
pub struct Outcome {
    pub joined_as_large: bool,
    /// Populated only the activation that tips the cohort over the
    /// threshold: every member (including the current stream) must be
    /// marked `in_large_burst` (spec §4.8 "mark every member in-large-burst,
    /// clear the list").
    pub newly_large_members: alloc::vec::Vec<StreamId>,
}

impl BurstDetector {
    pub fn new(threshold: usize, interval: Duration) -> Self {
        BurstDetector {
            members: BTreeSet::new(),
            parent: None,
            last_ins_in_burst: None,
            large_burst: false,
            threshold,
            interval,
        }
    }

    pub fn is_large_burst(&self) -> bool {
        self.large_burst
    }

    /// Handles a stream's first activation (spec §4.8). Callers must only
    /// invoke this for streams that are "not already on list, not already
    /// in-large-burst, not just split" — the spec's own precondition — so
    /// activating the same stream twice inside `burst_interval` is
    /// idempotent by construction (spec §8 property 9), since the caller
    /// won't call this twice for a stream still tracked.
    pub fn on_first_activation(&mut self, stream: StreamId, parent: GroupId, now: Instant) -> Outcome {
        let mut outcome = Outcome::default();

        let reset = match self.last_ins_in_burst {
            Some(last) => now.saturating_sub(last) > self.interval || self.parent != Some(parent),
            None => true,
        };

        if reset {
            self.members.clear();
            self.members.insert(stream);
            self.parent = Some(parent);
            self.large_burst = false;
        } else if self.large_burst {
            outcome.joined_as_large = true;
        } else {
            self.members.insert(stream);
            if self.members.len() >= self.threshold {
                self.large_burst = true;
                outcome.newly_large_members = self.members.iter().copied().collect();
                self.members.clear();
            }
        }

        self.last_ins_in_burst = Some(now);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eighth_activation_triggers_large_burst() {
        let mut d = BurstDetector::new(8, Duration::from_millis(300));
        let group = GroupId(0);
        let mut now = Instant::ZERO;
        let mut large_at = None;
        for i in 0..10u32 {
            now = now + Duration::from_millis(10);
            let out = d.on_first_activation(StreamId(i), group, now);
            if !out.newly_large_members.is_empty() {
                large_at = Some(i);
                assert_eq!(out.newly_large_members.len(), 8);
            }
        }
        assert_eq!(large_at, Some(7));
        assert!(d.is_large_burst());
    }

    #[test]
    fn stale_interval_resets_cohort() {
        let mut d = BurstDetector::new(8, Duration::from_millis(300));
        let group = GroupId(0);
        d.on_first_activation(StreamId(1), group, Instant::ZERO);
        let out = d.on_first_activation(StreamId(2), group, Instant::ZERO + Duration::from_millis(500));
        assert!(out.newly_large_members.is_empty());
        assert!(!d.is_large_burst());
    }
}
