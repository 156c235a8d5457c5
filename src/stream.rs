//! Streams (request queues) and their lifecycle state machine (spec §3
//! "Stream (queue)", §4.2 "Stream state machine").

use alloc::collections::{BTreeMap, VecDeque};

use crate::clock::Instant;
use crate::entity::EntityHeader;
use crate::group::GroupId;
use crate::priority::IoprioClass;
use crate::request::RequestHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

/// The I/O-context owner a stream was created for (one process, or one
/// process group — the distinction is the producer's to make; the core
/// just needs a stable identifier to key weight-raising/burst state on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OwnerId(pub u64);

/// Stream lifecycle states (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No pending requests, not on any tree.
    Empty,
    /// Pending requests, on the parent's active/idle tree, not in service.
    BusyWaiting,
    /// Currently the one stream being drained.
    InService,
    /// In service, sort list empty, idle timer armed.
    Idling,
    /// Transient: in-service ended, not yet reinserted.
    Expired,
}

/// Why a stream's in-service slot ended (spec §4.2 expiration reasons
/// table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    /// Idle timer fired with no new request.
    TooIdle,
    /// The in-service budget timeout elapsed.
    BudgetTimeout,
    /// The stream's budget was fully consumed.
    BudgetExhausted,
    /// The stream ran out of requests entirely.
    NoMoreRequests,
    /// A higher-priority arrival preempted this stream (spec §4.2
    /// "Preemption rule").
    Preempted,
}

/// Tracks whether each of the last 32 requests made a large (> threshold)
/// jump from the prior end sector (spec glossary "Seeky stream"; `hweight32`
/// equivalent via `count_ones`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SeekHistory(u32);

impl SeekHistory {
    pub fn record(&mut self, seeky: bool) {
        self.0 = (self.0 << 1) | (seeky as u32);
    }

    /// True once ≥ 5 of the trailing 32 requests were seeky.
    pub fn is_seeky(&self) -> bool {
        self.0.count_ones() > 32 / 8
    }
}

/// Weight-raise and idle-window state saved across a cooperator merge so a
/// later split can restore it exactly (spec §4.7 "Split", spec §8 property
/// 8 "merge reversibility").
#[derive(Debug, Clone, Copy)]
pub struct SavedCoopState {
    pub idle_window_enabled: bool,
    pub wr_coeff: u32,
    pub wr_deadline: Option<Instant>,
}

/// A FIFO-expiry entry: the sector a request sits at, and the absolute time
/// by which it must be dispatched (spec §4.3 step 2).
#[derive(Debug, Clone, Copy)]
struct FifoEntry {
    sector: u64,
    deadline: Instant,
}

/// Per-stream lifecycle and scheduling state (spec §3 "Stream (queue)").
pub struct Stream<R> {
    pub id: StreamId,
    pub header: EntityHeader,
    pub owner: OwnerId,
    pub class: IoprioClass,
    pub level: u8,
    pub sync: bool,

    pub original_weight: u32,
    pub wr_coeff: u32,
    pub wr_deadline: Option<Instant>,

    pub max_budget: u32,
    pub seek_history: SeekHistory,

    sort_list: BTreeMap<u64, R>,
    fifo: VecDeque<FifoEntry>,

    pub process_refs: u32,
    pub in_flight: u32,

    /// Set when this stream has been redirected to a cooperator (spec
    /// §4.7 "redirect"): future requests from this stream's I/O-context go
    /// to `new_bfqq` instead.
    pub new_bfqq: Option<StreamId>,
    /// True once another stream has redirected into this one (spec §4.7:
    /// "the candidate becomes shared").
    pub shared: bool,
    /// Marked on expiration if the merged stream turned out seeky (spec
    /// §4.7 "Split").
    pub split_coop: bool,
    pub saved_coop_state: Option<SavedCoopState>,

    pub burst_member: bool,
    pub in_large_burst: bool,
    pub just_created: bool,

    pub soft_rt_next_start: Option<Instant>,
    pub budget_timeout: Option<Instant>,

    pub dispatched_count: u64,
    /// Dispatches since this stream last went empty→busy (spec §4.6
    /// "dispatched-count 0" interactive predicate); reset on activation,
    /// unlike `dispatched_count` which accumulates for the stream's whole
    /// lifetime.
    pub dispatched_since_activation: u64,
    pub last_activity: Option<Instant>,
    pub last_idle_backlogged: Option<Instant>,
    pub service_from_backlogged: u32,

    pub io_bound: bool,
    pub idle_window_enabled: bool,
    pub wait_for_request: bool,

    pub last_dispatch_end_sector: Option<u64>,

    pub state: StreamState,

    /// `true` for the single pre-allocated out-of-memory fallback stream
    /// (spec §7): excluded from merge and burst detection.
    pub is_oom_fallback: bool,
}

impl<R: RequestHandle> Stream<R> {
    pub fn new(id: StreamId, owner: OwnerId, class: IoprioClass, level: u8, sync: bool, weight: u32, parent: GroupId) -> Self {
        Stream {
            id,
            header: EntityHeader::new(weight, Some(parent)),
            owner,
            class,
            level,
            sync,
            original_weight: weight,
            wr_coeff: 1,
            wr_deadline: None,
            max_budget: 0,
            seek_history: SeekHistory::default(),
            sort_list: BTreeMap::new(),
            fifo: VecDeque::new(),
            process_refs: 1,
            in_flight: 0,
            new_bfqq: None,
            shared: false,
            split_coop: false,
            saved_coop_state: None,
            burst_member: false,
            in_large_burst: false,
            just_created: true,
            soft_rt_next_start: None,
            budget_timeout: None,
            dispatched_count: 0,
            dispatched_since_activation: 0,
            last_activity: None,
            last_idle_backlogged: None,
            service_from_backlogged: 0,
            io_bound: false,
            idle_window_enabled: class != IoprioClass::Idle,
            wait_for_request: false,
            last_dispatch_end_sector: None,
            state: StreamState::Empty,
            is_oom_fallback: false,
        }
    }

    /// Current effective weight: `original_weight * wr_coeff` (spec §3
    /// invariant, §4.6 "The emitted weight ... is what drives service-tree
    /// insertion").
    pub fn effective_weight(&self) -> u32 {
        self.original_weight.saturating_mul(self.wr_coeff)
    }

    pub fn is_weight_raised(&self) -> bool {
        self.wr_coeff > 1
    }

    pub fn is_empty(&self) -> bool {
        self.sort_list.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sort_list.len()
    }

    /// Inserts a request into the sort list and its FIFO-expiry queue (spec
    /// §4.3; also used by `on_requeue`, "identical to enqueue at the sort
    /// position").
    pub fn insert_request(&mut self, request: R, fifo_expire: crate::clock::Duration, now: Instant) {
        let sector = request.sector();
        self.fifo.push_back(FifoEntry {
            sector,
            deadline: now + fifo_expire,
        });
        self.sort_list.insert(sector, request);
    }

    /// The in-stream request a dispatch would pick next: the older of the
    /// FIFO head (if its deadline has passed) or the position-ordered head
    /// from `last` (spec §4.3 step 2, elevator policy).
    pub fn next_request_sector(&self, last: u64, back_seek_max: u64, back_penalty: u32, now: Instant) -> Option<u64> {
        if let Some(front) = self.fifo.front() {
            if front.deadline <= now && self.sort_list.contains_key(&front.sector) {
                return Some(front.sector);
            }
        }
        self.elevator_pick(last, back_seek_max, back_penalty)
    }

    /// Forward-preferred elevator with short-backward-seek penalty (spec
    /// §4.3 step 2 "Reorder policy"). Among the nearest forward and nearest
    /// backward candidates from `last`, forward wins unless the backward
    /// candidate is within `back_seek_max` and its *penalized* distance is
    /// smaller.
    fn elevator_pick(&self, last: u64, back_seek_max: u64, back_penalty: u32) -> Option<u64> {
        let forward = self.sort_list.range(last..).next().map(|(&s, _)| s);
        let backward = self
            .sort_list
            .range(..last)
            .next_back()
            .map(|(&s, _)| s)
            .filter(|&s| last.saturating_sub(s) <= back_seek_max);

        match (forward, backward) {
            (Some(f), Some(b)) => {
                let fwd_dist = f.saturating_sub(last);
                let back_dist = (last.saturating_sub(b)).saturating_mul(back_penalty as u64);
                if back_dist < fwd_dist {
                    Some(b)
                } else {
                    Some(f)
                }
            }
            (Some(f), None) => Some(f),
            (None, Some(b)) => Some(b),
            (None, None) => self.sort_list.keys().next().copied(),
        }
    }

    /// Among two candidates at the same elevator position (a meta/non-meta
    /// or sync/async tie), prefer sync over async, then meta over
    /// non-meta (spec §4.3 step 2).
    pub fn prefer(a: &R, b: &R) -> bool {
        if a.is_sync() != b.is_sync() {
            return a.is_sync();
        }
        if a.is_meta() != b.is_meta() {
            return a.is_meta();
        }
        false
    }

    pub fn peek(&self, sector: u64) -> Option<&R> {
        self.sort_list.get(&sector)
    }

    /// Removes and returns the request at `sector`, updating FIFO and seek
    /// history (spec §4.3 step 4). This is the true dispatch-to-device path:
    /// it also bumps the in-flight/dispatched counters. A request absorbed
    /// by a merge never reaches the device and should go through
    /// `remove_request` instead.
    pub fn take_request(&mut self, sector: u64, seek_threshold: u64) -> Option<R> {
        let request = self.remove_request(sector)?;
        let seeky = self
            .last_dispatch_end_sector
            .map(|end| sector.abs_diff(end) > seek_threshold)
            .unwrap_or(false);
        self.seek_history.record(seeky);
        self.last_dispatch_end_sector = Some(sector + request.sectors() as u64);
        self.dispatched_count += 1;
        self.dispatched_since_activation += 1;
        self.in_flight += 1;
        Some(request)
    }

    /// Removes the request at `sector` from the sort list and FIFO without
    /// any dispatch bookkeeping (spec §4.7 "merge"): the request is being
    /// absorbed into a neighbor, not sent to the device.
    pub fn remove_request(&mut self, sector: u64) -> Option<R> {
        let request = self.sort_list.remove(&sector)?;
        self.fifo.retain(|e| e.sector != sector);
        Some(request)
    }

    pub fn next_fifo_sector(&self) -> Option<u64> {
        self.fifo.front().map(|e| e.sector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeRequest {
        sector: u64,
        len: u32,
        sync: bool,
        meta: bool,
        arrival: Instant,
    }

    impl RequestHandle for FakeRequest {
        fn sector(&self) -> u64 {
            self.sector
        }
        fn sectors(&self) -> u32 {
            self.len
        }
        fn is_sync(&self) -> bool {
            self.sync
        }
        fn is_meta(&self) -> bool {
            self.meta
        }
        fn arrival(&self) -> Instant {
            self.arrival
        }
    }

    fn req(sector: u64) -> FakeRequest {
        FakeRequest {
            sector,
            len: 8,
            sync: true,
            meta: false,
            arrival: Instant::ZERO,
        }
    }

    fn stream() -> Stream<FakeRequest> {
        Stream::new(
            StreamId(1),
            OwnerId(1),
            IoprioClass::BestEffort,
            4,
            true,
            40,
            GroupId(0),
        )
    }

    #[test]
    fn elevator_prefers_nearest_forward() {
        let mut s = stream();
        s.insert_request(req(100), crate::clock::Duration::from_millis(250), Instant::ZERO);
        s.insert_request(req(200), crate::clock::Duration::from_millis(250), Instant::ZERO);
        let next = s.next_request_sector(150, 16384 * 2, 2, Instant::ZERO);
        assert_eq!(next, Some(200));
    }

    #[test]
    fn elevator_allows_cheap_backward_seek() {
        let mut s = stream();
        s.insert_request(req(90), crate::clock::Duration::from_millis(250), Instant::ZERO);
        s.insert_request(req(1000), crate::clock::Duration::from_millis(250), Instant::ZERO);
        // last=100: backward candidate at 90 costs 10*penalty=20, forward at 1000 costs 900
        let next = s.next_request_sector(100, 16384 * 2, 2, Instant::ZERO);
        assert_eq!(next, Some(90));
    }

    #[test]
    fn seek_history_flags_after_five_jumps() {
        let mut s = stream();
        let now = Instant::ZERO;
        let mut sector = 0u64;
        s.insert_request(req(sector), crate::clock::Duration::from_millis(250), now);
        s.take_request(sector, 800); // baseline, not seeky (no prior end sector)
        for _ in 0..4 {
            sector += 10_000; // far jump -> seeky
            s.insert_request(req(sector), crate::clock::Duration::from_millis(250), now);
            s.take_request(sector, 800);
        }
        // 4 seeky jumps recorded so far -> not yet flagged
        assert!(!s.seek_history.is_seeky());
        sector += 10_000;
        s.insert_request(req(sector), crate::clock::Duration::from_millis(250), now);
        s.take_request(sector, 800);
        // 5th seeky jump -> flagged
        assert!(s.seek_history.is_seeky());
    }
}
