//! The virtual-time service tree (spec §4.1, "B-WF2Q+ core").
//!
//! Spec §9 suggests "a generic augmented-RB-tree abstraction or a
//! slab-friendly intrusive variant" for the `min_start`-augmented tree. Once
//! the tree is split into the `active` (S ≤ V) and `idle` (S > V) subtrees
//! the spec itself defines, the augmentation collapses to something simpler:
//! `select()` only ever needs the minimum `F` among *already-eligible*
//! entries, which membership in `active` already guarantees, and
//! `advance_vtime()` only needs the minimum `S` among idle entries to decide
//! what becomes eligible next. Both are exactly what an ordered map's
//! `first_key_value` gives for free. So, following the teacher's own habit
//! of reaching for `BTreeMap` instead of a hand-rolled tree everywhere it
//! needs an ordered structure (`kernel/src/block/scheduler.rs`'s
//! `DeadlineScheduler` and `CfqScheduler`), this uses two `BTreeMap`s and no
//! bespoke red-black tree or rotation code at all.

use alloc::collections::BTreeMap;

use crate::entity::{EntityRef, VTime};

/// Where an entity currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Active,
    Idle,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    loc: Location,
    s: VTime,
    f: VTime,
    seq: u64,
}

/// One scheduling domain's service tree: the active/idle split plus virtual
/// time state (spec §3 "Service tree").
#[derive(Debug, Default)]
pub struct ServiceTree {
    v: VTime,
    next_seq: u64,
    /// Ordered by `(F, S, insertion order)` — spec §4.1's tie-break rule
    /// ("lower S, then stable by insertion order").
    active: BTreeMap<(VTime, VTime, u64), EntityRef>,
    /// Ordered by `(S, insertion order)`, used only to find what becomes
    /// eligible as `V` advances.
    idle: BTreeMap<(VTime, u64), EntityRef>,
    positions: BTreeMap<EntityRef, Position>,
    /// Cached minimum `F` last seen in the active tree; frozen at its last
    /// value once the active tree empties (spec §3 "min_active_F cache").
    min_active_f: Option<VTime>,
}

impl ServiceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn v(&self) -> VTime {
        self.v
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.idle.is_empty()
    }

    pub fn contains(&self, e: EntityRef) -> bool {
        self.positions.contains_key(&e)
    }

    pub fn s_of(&self, e: EntityRef) -> Option<VTime> {
        self.positions.get(&e).map(|p| p.s)
    }

    pub fn f_of(&self, e: EntityRef) -> Option<VTime> {
        self.positions.get(&e).map(|p| p.f)
    }

    fn alloc_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Inserts `e` with the given timestamps, placing it in the active
    /// subtree if `s <= V` and the idle subtree otherwise (spec §4.1
    /// `insert`).
    pub fn insert(&mut self, e: EntityRef, s: VTime, f: VTime) {
        debug_assert!(!self.positions.contains_key(&e), "entity already on tree");
        let seq = self.alloc_seq();
        if s <= self.v {
            self.active.insert((f, s, seq), e);
            self.positions.insert(
                e,
                Position {
                    loc: Location::Active,
                    s,
                    f,
                    seq,
                },
            );
            self.update_min_active_f();
        } else {
            self.idle.insert((s, seq), e);
            self.positions.insert(
                e,
                Position {
                    loc: Location::Idle,
                    s,
                    f,
                    seq,
                },
            );
        }
    }

    /// Removes `e` from whichever subtree holds it. No-op if absent.
    pub fn remove(&mut self, e: EntityRef) -> Option<(VTime, VTime)> {
        let pos = self.positions.remove(&e)?;
        match pos.loc {
            Location::Active => {
                self.active.remove(&(pos.f, pos.s, pos.seq));
                self.update_min_active_f();
            }
            Location::Idle => {
                self.idle.remove(&(pos.s, pos.seq));
            }
        }
        Some((pos.s, pos.f))
    }

    fn update_min_active_f(&mut self) {
        if let Some((&(f, _, _), _)) = self.active.iter().next() {
            self.min_active_f = Some(f);
        }
        // else: keep the last known value, per the "cache" semantics.
    }

    /// Returns the entity with the smallest virtual finish time among those
    /// currently eligible, without removing it (spec §4.1 `select`).
    pub fn select(&self) -> Option<EntityRef> {
        self.active.values().next().copied()
    }

    /// `select()` + remove: used when the scheduler actually activates the
    /// chosen entity.
    pub fn select_and_remove(&mut self) -> Option<(EntityRef, VTime, VTime)> {
        let e = self.select()?;
        let (s, f) = self.remove(e)?;
        Some((e, s, f))
    }

    /// Advances `V` to `max(V, min_active_F)` and migrates any idle entries
    /// whose `S <= V` into the active subtree (spec §4.1 `advance_vtime`).
    /// Spec: only called "when the active subtree becomes empty".
    pub fn advance_vtime(&mut self) {
        if !self.active.is_empty() {
            return;
        }
        if let Some(f) = self.min_active_f {
            if f > self.v {
                self.v = f;
            }
        }
        self.migrate_eligible();
    }

    /// Forces `V` forward regardless of whether the active tree is empty —
    /// used by `force_dispatch` (spec §6) to drain every stream in one pass
    /// without waiting for natural eligibility.
    pub fn force_advance_to(&mut self, v: VTime) {
        if v > self.v {
            self.v = v;
        }
        self.migrate_eligible();
    }

    fn migrate_eligible(&mut self) {
        loop {
            let Some((&(s, seq), &e)) = self.idle.iter().next() else {
                break;
            };
            if s > self.v {
                break;
            }
            self.idle.remove(&(s, seq));
            let pos = self.positions.get_mut(&e).expect("idle position missing");
            let f = pos.f;
            pos.loc = Location::Active;
            self.active.insert((f, s, seq), e);
            self.update_min_active_f();
        }
    }

    /// Total number of entities tracked (active + idle), for diagnostics.
    pub fn len(&self) -> usize {
        self.active.len() + self.idle.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamId;

    fn s(n: u32) -> EntityRef {
        EntityRef::Stream(StreamId(n))
    }

    #[test]
    fn select_picks_smallest_finish_among_eligible() {
        let mut t = ServiceTree::new();
        t.insert(s(1), VTime(0), VTime(100));
        t.insert(s(2), VTime(0), VTime(50));
        t.insert(s(3), VTime(0), VTime(75));
        assert_eq!(t.select(), Some(s(2)));
    }

    #[test]
    fn idle_entries_excluded_until_eligible() {
        let mut t = ServiceTree::new();
        t.insert(s(1), VTime(0), VTime(10)); // active, v starts at 0
        t.insert(s(2), VTime(5), VTime(1)); // s > v=0 -> idle despite tiny F
        assert_eq!(t.select(), Some(s(1)));
        let (e, _, _) = t.select_and_remove().unwrap();
        assert_eq!(e, s(1));
        t.advance_vtime();
        // V should have advanced to at least 5 and pulled s(2) into active
        assert_eq!(t.select(), Some(s(2)));
    }

    #[test]
    fn tie_break_prefers_lower_start_then_insertion_order() {
        let mut t = ServiceTree::new();
        t.insert(s(1), VTime(5), VTime(10));
        t.insert(s(2), VTime(2), VTime(10));
        assert_eq!(t.select(), Some(s(2)));
    }

    #[test]
    fn exclusivity_remove_then_reinsert() {
        let mut t = ServiceTree::new();
        t.insert(s(1), VTime(0), VTime(10));
        assert!(t.contains(s(1)));
        t.remove(s(1));
        assert!(!t.contains(s(1)));
        t.insert(s(1), VTime(0), VTime(20));
        assert!(t.contains(s(1)));
    }
}
