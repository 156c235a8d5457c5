//! Entity hierarchy: groups (spec §3 "Group", §2 component 2 "Entity
//! hierarchy").
//!
//! Control-group *policy attachment* — deciding which process lands under
//! which group — is explicitly an external collaborator (spec §1); this
//! module only provides the scheduling-domain tree a policy layer would
//! attach streams to. Everything in this crate's own tests attaches
//! directly to the root group, which is all the spec's scenarios (S1–S6)
//! exercise.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::entity::{EntityHeader, EntityRef, WeightCounterTree};
use crate::priority::IoprioClass;
use crate::service_tree::ServiceTree;
use crate::stream::StreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(pub u32);

/// An internal node of the entity hierarchy. Owns one scheduling domain per
/// I/O-priority class (spec §3: "each parent owns a scheduling domain that
/// is itself a service tree per I/O-priority class").
pub struct Group {
    pub header: EntityHeader,
    /// One service tree per priority class, indexed by `IoprioClass::index`.
    pub domains: [ServiceTree; IoprioClass::COUNT],
    /// Weight-counter tree over this group's direct active children, used
    /// for the symmetric-scenario test (spec §4.9).
    pub weight_counts: WeightCounterTree,
    /// Position tree: each active child stream's next-request sector,
    /// scoped to this group (spec §3 "Position tree (per group)").
    pub positions: BTreeMap<u64, StreamId>,
    /// Reverse lookup so a stream can be removed from `positions` without a
    /// linear scan.
    pub position_of: BTreeMap<StreamId, u64>,
    children: Vec<EntityRef>,
}

impl Group {
    pub fn new(parent: Option<GroupId>) -> Self {
        Group {
            header: EntityHeader::new(0, parent),
            domains: [ServiceTree::new(), ServiceTree::new(), ServiceTree::new()],
            weight_counts: WeightCounterTree::new(),
            positions: BTreeMap::new(),
            position_of: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn domain(&self, class: IoprioClass) -> &ServiceTree {
        &self.domains[class.index()]
    }

    pub fn domain_mut(&mut self, class: IoprioClass) -> &mut ServiceTree {
        &mut self.domains[class.index()]
    }

    pub fn add_child(&mut self, child: EntityRef) {
        self.children.push(child);
    }

    pub fn remove_child(&mut self, child: EntityRef) {
        self.children.retain(|c| *c != child);
    }

    pub fn children(&self) -> &[EntityRef] {
        &self.children
    }

    /// Records (or updates) a stream's next-request sector in this group's
    /// position tree (spec §4.7 step 1).
    pub fn track_position(&mut self, stream: StreamId, sector: u64) {
        if let Some(old) = self.position_of.remove(&stream) {
            self.positions.remove(&old);
        }
        self.positions.insert(sector, stream);
        self.position_of.insert(stream, sector);
    }

    pub fn untrack_position(&mut self, stream: StreamId) {
        if let Some(old) = self.position_of.remove(&stream) {
            self.positions.remove(&old);
        }
    }

    /// The nearest tracked stream to `sector`, other than `stream` itself,
    /// within `within` sectors — the cooperator lookup (spec §4.7 step 1).
    pub fn nearest_within(
        &self,
        stream: StreamId,
        sector: u64,
        within: u64,
    ) -> Option<StreamId> {
        let mut best: Option<(u64, StreamId)> = None;
        for (&pos, &cand) in self.positions.range(sector.saturating_sub(within)..=sector.saturating_add(within)) {
            if cand == stream {
                continue;
            }
            let dist = pos.abs_diff(sector);
            if best.map(|(d, _)| dist < d).unwrap_or(true) {
                best = Some((dist, cand));
            }
        }
        best.map(|(_, cand)| cand)
    }
}

/// Storage for every group, keyed by [`GroupId`]. A plain growable arena —
/// groups are created rarely (policy attachment, not per-request), so no
/// free-list reuse is needed.
#[derive(Default)]
pub struct GroupArena {
    groups: Vec<Group>,
}

impl GroupArena {
    pub fn new() -> Self {
        Self { groups: Vec::new() }
    }

    pub fn insert(&mut self, group: Group) -> GroupId {
        let id = GroupId(self.groups.len() as u32);
        self.groups.push(group);
        id
    }

    pub fn get(&self, id: GroupId) -> &Group {
        &self.groups[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.0 as usize]
    }
}
