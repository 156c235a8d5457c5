//! Top-level scheduler: the `Scheduler<C>` struct that owns every arena and
//! implements [`BlockScheduler`], the producer-facing surface (spec §6).
//!
//! Matches the teacher's "one orchestrating struct plus small free
//! functions" habit (`kernel/src/block/scheduler.rs`'s `IoScheduler`
//! implementors call out to free helpers like `SchedRequest::sector`); all
//! the actual policy math lives in `budget.rs`, `dispatch.rs`,
//! `weight_raise.rs`, `idle.rs` and `cooperator.rs`, and this module only
//! sequences them against the arenas.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::budget;
use crate::burst::BurstDetector;
use crate::clock::{Clock, Duration, Instant, Timer, TimerId};
use crate::config::Config;
use crate::cooperator::{self, CandidateInfo};
use crate::dispatch;
use crate::entity::EntityRef;
use crate::error::{invariant, Result, SchedError};
use crate::group::{Group, GroupArena, GroupId};
use crate::idle::{self, IdleContext};
use crate::peak_rate::{DeviceKind, PeakRateEstimator};
use crate::priority::{ioprio_to_weight, IoprioClass};
use crate::request::{Dispatched, MergeKind, QueueAdmission, RequestHandle, RequestToken};
use crate::stream::{ExpireReason, OwnerId, SavedCoopState, Stream, StreamId, StreamState};

/// Producer-facing surface (spec §6). Implemented by [`Scheduler`].
pub trait BlockScheduler<R: RequestHandle> {
    fn on_enqueue(&mut self, icq: StreamSetId, request: R, now: Instant) -> Result<RequestToken>;
    fn on_dispatch(&mut self, now: Instant) -> Option<Dispatched<R>>;
    fn on_completion(&mut self, token: RequestToken, completed_at: Instant);
    fn on_requeue(&mut self, icq: StreamSetId, request: R, token: RequestToken, now: Instant);
    fn allow_merge(&self, token: RequestToken, candidate_sector: u64) -> bool;
    fn merged(&mut self, token: RequestToken, kind: MergeKind);
    fn merge_requests(&mut self, rq: RequestToken, next: RequestToken);
    fn may_queue(&self, icq: StreamSetId) -> QueueAdmission;
    fn init_icq(&mut self, owner: OwnerId, class: IoprioClass, level: u8, sync: bool) -> StreamSetId;
    fn exit_icq(&mut self, icq: StreamSetId, now: Instant);
    fn check_ioprio_change(&mut self, icq: StreamSetId, class: IoprioClass, level: u8);
    fn force_dispatch(&mut self, now: Instant) -> Vec<Dispatched<R>>;
}

/// Handle to one producer I/O-context binding (spec §3 "I/O context"): ties
/// an `OwnerId` to the stream(s) created on its behalf. An icq may own up to
/// two streams, one sync and one async, mirroring how `init_icq` is called
/// once per device per process but a process issues both kinds of I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamSetId(pub u64);

struct IcqEntry {
    owner: OwnerId,
    refs: u32,
    stream: StreamId,
}

struct InService {
    stream: StreamId,
    class: IoprioClass,
    timer: Option<TimerId>,
}

/// The scheduler core (spec §2). Generic over the embedder's monotonic
/// clock and timer facility; both are stored so the idle-slice policy (spec
/// §4.9) can arm/cancel timers from inside the normal dispatch path instead
/// of requiring the embedder to thread a timer handle through every call
/// (matches `kernel/src/block/scheduler.rs`'s `IoScheduler` implementors
/// owning their own dispatch queue handle rather than taking one per call).
pub struct Scheduler<C, T, R> {
    clock: C,
    timer: T,
    config: Config,
    groups: GroupArena,
    root: GroupId,
    streams: Vec<Option<Stream<R>>>,
    free_stream_slots: Vec<StreamId>,
    icqs: BTreeMap<StreamSetId, IcqEntry>,
    next_icq: u64,
    peak_rate: PeakRateEstimator,
    burst: BurstDetector,
    in_service: Option<InService>,
    oom_stream: StreamId,
    last_dispatch_sector: u64,
    idle_timer_id: TimerId,
    peak_rate_update_count: u32,
}

impl<C: Clock, T: Timer, R: RequestHandle> Scheduler<C, T, R> {
    pub fn new(config: Config, clock: C, timer: T, device_kind: DeviceKind) -> Self {
        let mut groups = GroupArena::new();
        let root = groups.insert(Group::new(None));
        let burst = BurstDetector::new(config.large_burst_threshold, config.burst_interval);
        let mut sched = Scheduler {
            clock,
            timer,
            config,
            groups,
            root,
            streams: Vec::new(),
            free_stream_slots: Vec::new(),
            icqs: BTreeMap::new(),
            next_icq: 0,
            peak_rate: PeakRateEstimator::new(device_kind),
            burst,
            in_service: None,
            oom_stream: StreamId(0),
            last_dispatch_sector: 0,
            idle_timer_id: TimerId(0),
            peak_rate_update_count: 0,
        };
        let oom = sched.alloc_stream(OwnerId(0), IoprioClass::BestEffort, 0, true, sched.root);
        sched.stream_mut(oom).is_oom_fallback = true;
        sched.oom_stream = oom;
        sched
    }

    /// Reads the embedder's clock. Every `BlockScheduler` method still takes
    /// an explicit `now: Instant` rather than calling this internally,
    /// matching `kernel/src/block/scheduler.rs`'s `SchedRequest::new(request,
    /// priority, now)` — the producer snapshots time once per request rather
    /// than the scheduler re-reading it mid-decision, so the same `now` used
    /// for clock-ordering decisions is reproducible in tests against a
    /// `MockClock`.
    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn tunables(&self) -> &Config {
        &self.config
    }

    pub fn set_tunable(&mut self, name: &str, value: i64) -> core::result::Result<(), &'static str> {
        self.config.set_named(name, value)
    }

    /// Read-only introspection: every distinct weight currently active in
    /// the root domain and how many streams carry it (spec §6 `weights`).
    pub fn weights(&self) -> Vec<(u32, usize)> {
        let root = self.groups.get(self.root);
        root.weight_counts
            .distinct_weights_with_counts()
            .collect()
    }

    /// The owner an icq handle was bound to at `init_icq` time, for
    /// diagnostics.
    pub fn owner_of(&self, icq: StreamSetId) -> Option<OwnerId> {
        self.icqs.get(&icq).map(|e| e.owner)
    }

    /// Whether the stream bound to `icq` was swept into a large burst cohort
    /// (spec §4.8) and is therefore barred from weight-raising.
    pub fn in_large_burst(&self, icq: StreamSetId) -> bool {
        self.icqs.get(&icq).is_some_and(|e| self.stream(e.stream).in_large_burst)
    }

    /// The device peak-rate estimator's current filtered rate, sectors/sec
    /// (spec §4.5), for introspection.
    pub fn peak_rate_sectors_per_sec(&self) -> u64 {
        self.peak_rate.sectors_per_sec()
    }

    /// How many times the peak-rate filter has actually advanced (spec
    /// §4.5), for introspection and tests.
    pub fn peak_rate_update_count(&self) -> u32 {
        self.peak_rate_update_count
    }

    fn effective_max_budget(&self) -> u32 {
        if self.config.max_budget != 0 {
            self.config.max_budget
        } else {
            self.peak_rate.calc_max_budget(self.config.timeout_sync)
        }
    }

    fn stream_mut(&mut self, id: StreamId) -> &mut Stream<R> {
        self.streams[id.0 as usize].as_mut().expect("dangling stream id")
    }

    fn stream(&self, id: StreamId) -> &Stream<R> {
        self.streams[id.0 as usize].as_ref().expect("dangling stream id")
    }

    fn alloc_stream(&mut self, owner: OwnerId, class: IoprioClass, level: u8, sync: bool, parent: GroupId) -> StreamId {
        let weight = ioprio_to_weight(class, level);
        if self.streams.len() >= self.config.max_streams {
            if self.streams[self.oom_stream.0 as usize].is_some() {
                log::warn!("stream capacity exhausted, routing to oom fallback stream");
                return self.oom_stream;
            }
        }
        let id = if let Some(id) = self.free_stream_slots.pop() {
            self.streams[id.0 as usize] = Some(Stream::new(id, owner, class, level, sync, weight, parent));
            id
        } else {
            let id = StreamId(self.streams.len() as u32);
            self.streams.push(Some(Stream::new(id, owner, class, level, sync, weight, parent)));
            id
        };
        id
    }

    fn free_stream(&mut self, id: StreamId) {
        if id == self.oom_stream {
            return;
        }
        self.groups.get_mut(self.root).untrack_position(id);
        self.streams[id.0 as usize] = None;
        self.free_stream_slots.push(id);
    }

    /// Inserts `stream` into its parent domain's service tree with a fresh
    /// `(S, F)` pair (spec §4.1 `insert`): `S = max(V, stream.F)` if it was
    /// only just expired, else `V`.
    fn activate(&mut self, id: StreamId, now: Instant) {
        let max_budget = self.effective_max_budget();
        let parent = {
            let s = self.stream(id);
            s.header.parent.expect("stream without parent")
        };
        let class = self.stream(id).class;
        let v = self.groups.get(parent).domain(class).v();

        let s = self.stream_mut(id);
        let budget = budget::activation_budget(
            budget::effective_max_budget(max_budget, s.is_weight_raised()),
            s.peek(s.next_fifo_sector().unwrap_or(0)).map(|r| r.sectors()).unwrap_or(max_budget),
        );
        s.header.budget = budget;
        s.header.service = 0;
        let start = if s.header.prio_changed { v } else { core::cmp::max(v, s.header.s) };
        s.header.s = start;
        s.header.f = start + crate::entity::VTime::delta(budget, s.effective_weight());
        s.header.weight = s.effective_weight();
        s.header.prio_changed = false;
        s.state = StreamState::BusyWaiting;

        let weight = self.stream(id).header.weight;
        let f = self.stream(id).header.f;
        self.groups.get_mut(parent).weight_counts.inc(weight);
        self.groups
            .get_mut(parent)
            .domain_mut(class)
            .insert(EntityRef::Stream(id), start, f);
    }

    fn symmetric_scenario(&self, parent: GroupId) -> bool {
        self.groups.get(parent).weight_counts.symmetric()
    }

    /// Handles a stream transitioning from empty to non-empty (spec §4.2
    /// activation, §4.6 weight-raise classification, §4.8 burst gating).
    fn on_activation(&mut self, id: StreamId, now: Instant) {
        let parent = self.stream(id).header.parent.expect("parent");
        if !self.stream(id).burst_member && !self.stream(id).in_large_burst {
            let outcome = self.burst.on_first_activation(id, parent, now);
            if outcome.joined_as_large {
                self.stream_mut(id).in_large_burst = true;
            }
            for member in outcome.newly_large_members {
                if self.streams.get(member.0 as usize).and_then(|s| s.as_ref()).is_some() {
                    self.stream_mut(member).in_large_burst = true;
                }
            }
            self.stream_mut(id).burst_member = true;
        }

        if self.config.low_latency && !self.stream(id).in_large_burst {
            let ctx = crate::weight_raise::ActivationContext {
                dispatched_count: self.stream(id).dispatched_since_activation,
                last_activity: self.stream(id).last_activity,
                in_large_burst: self.stream(id).in_large_burst,
                service_from_backlogged: self.stream(id).service_from_backlogged,
                last_idle_backlogged: self.stream(id).last_idle_backlogged,
                arrived_with_no_in_flight: self.stream(id).in_flight == 0,
                now,
            };
            if let Some(trigger) = crate::weight_raise::classify_activation(&ctx, &self.config) {
                let duration = if self.config.wr_max_time != Duration::ZERO {
                    self.config.wr_max_time
                } else {
                    self.peak_rate.wr_duration()
                };
                let decision = crate::weight_raise::start_or_refresh(trigger, &self.config, duration, now);
                let s = self.stream_mut(id);
                s.wr_coeff = decision.wr_coeff;
                s.wr_deadline = Some(decision.wr_deadline);
                s.header.prio_changed = true;
            }
        }

        self.stream_mut(id).dispatched_since_activation = 0;
        self.activate(id, now);
        self.maybe_preempt(id, now);
    }

    /// Force-expires the in-service stream if `arriving` just activated with
    /// a strictly more urgent class (spec §4.2 "Preemption rule").
    fn maybe_preempt(&mut self, arriving: StreamId, now: Instant) {
        let arriving_class = self.stream(arriving).class;
        let (in_service_stream, in_service_class) = match &self.in_service {
            Some(s) if s.stream != arriving => (s.stream, s.class),
            _ => return,
        };
        let is_wr = self.stream(in_service_stream).is_weight_raised();
        if dispatch::should_preempt(in_service_class, is_wr, arriving_class) {
            self.expire_in_service(ExpireReason::Preempted, now);
        }
    }

    /// Applies a weight-raise/burst termination check before activation,
    /// matching spec §4.6 "Terminate raising".
    fn maybe_terminate_wr(&mut self, id: StreamId, now: Instant) {
        let s = self.stream(id);
        if s.wr_coeff == 1 {
            return;
        }
        if crate::weight_raise::should_terminate(s.wr_deadline, now, s.in_large_burst) {
            let s = self.stream_mut(id);
            s.wr_coeff = 1;
            s.wr_deadline = None;
            s.header.prio_changed = true;
        }
    }

    /// Looks up (or creates) the cooperator candidate context for `id` and
    /// attempts a merge (spec §4.7).
    fn try_merge(&mut self, id: StreamId, sector: u64, now: Instant) {
        if self.stream(id).is_oom_fallback || self.stream(id).class == IoprioClass::Idle {
            return;
        }
        let parent = self.stream(id).header.parent.expect("parent");
        let candidate = self
            .groups
            .get(parent)
            .nearest_within(id, sector, self.config.close_thr_sectors);
        let Some(cand) = candidate else {
            self.groups.get_mut(parent).track_position(id, sector);
            return;
        };
        if self.stream(cand).new_bfqq.is_some() {
            self.groups.get_mut(parent).track_position(id, sector);
            return;
        }

        let info = |s: &Stream<R>| CandidateInfo {
            sync: s.sync,
            seeky: s.seek_history.is_seeky(),
            class: s.class,
            parent: s.header.parent.expect("parent"),
            wr_started_at: if s.is_weight_raised() { s.last_activity } else { None },
            is_oom_fallback: s.is_oom_fallback,
        };
        let a = info(self.stream(id));
        let b = info(self.stream(cand));
        if cooperator::may_merge(&a, &b, now) {
            self.redirect(id, cand);
        } else {
            self.groups.get_mut(parent).track_position(id, sector);
        }
    }

    /// Redirects `from` onto `into` (spec §4.7 "redirect"): future requests
    /// for `from`'s owner should be enqueued against `into` instead, and
    /// `into` inherits `from`'s weight-raise state if it's the stronger one.
    fn redirect(&mut self, from: StreamId, into: StreamId) {
        let saved = {
            let f = self.stream(from);
            SavedCoopState {
                idle_window_enabled: f.idle_window_enabled,
                wr_coeff: f.wr_coeff,
                wr_deadline: f.wr_deadline,
            }
        };
        self.stream_mut(from).saved_coop_state = Some(saved);
        self.stream_mut(from).new_bfqq = Some(into);

        let (from_wr, from_deadline) = {
            let f = self.stream(from);
            (f.wr_coeff, f.wr_deadline)
        };
        let into_s = self.stream_mut(into);
        into_s.shared = true;
        if from_wr > into_s.wr_coeff {
            into_s.wr_coeff = from_wr;
            into_s.wr_deadline = from_deadline;
        }
        log::debug!("stream {:?} merged into {:?}", from, into);
    }

    /// Reverses a merge once the shared stream turns out seeky on expiration
    /// (spec §4.7 "Split").
    fn maybe_split(&mut self, id: StreamId) {
        if !self.stream(id).shared {
            return;
        }
        if !self.stream(id).seek_history.is_seeky() {
            return;
        }
        if let Some(saved) = self.stream(id).saved_coop_state {
            let s = self.stream_mut(id);
            s.idle_window_enabled = saved.idle_window_enabled;
            s.split_coop = true;
        }
        log::debug!("split cooperator {:?}: merged stream turned seeky", id);
    }

    fn idle_context(&self, id: StreamId) -> IdleContext {
        let s = self.stream(id);
        let parent = s.header.parent.expect("parent");
        IdleContext {
            sync: s.sync,
            seeky: s.seek_history.is_seeky(),
            idle_window_enabled: s.idle_window_enabled,
            is_weight_raised: s.is_weight_raised(),
            symmetric_scenario: self.symmetric_scenario(parent),
            strict_guarantees: self.config.strict_guarantees,
        }
    }

    /// Selects the next stream to place in service by scanning classes in
    /// priority order and picking the tree's eligible minimum (spec §4.3
    /// step 1).
    fn select_next(&mut self) -> Option<StreamId> {
        for class in dispatch::CLASS_SCAN_ORDER {
            let domain = self.groups.get_mut(self.root).domain_mut(class);
            domain.advance_vtime();
            if let Some((EntityRef::Stream(id), _, _)) = domain.select_and_remove() {
                return Some(id);
            }
        }
        None
    }

    /// Ends the current in-service slot, recomputes its budget per the
    /// expiry-reason table, and reinserts it if it still has requests (spec
    /// §4.2).
    fn expire_in_service(&mut self, reason: ExpireReason, now: Instant) {
        let Some(in_service) = self.in_service.take() else { return };
        let id = in_service.stream;
        self.maybe_split(id);

        let (service, budget, max_budget, is_sync, is_wr) = {
            let s = self.stream(id);
            (s.header.service, s.header.budget, self.effective_max_budget(), s.sync, s.is_weight_raised())
        };
        let new_budget = budget::recalc_budget(reason, is_sync, is_wr, service, budget, budget::effective_max_budget(max_budget, is_wr));
        self.stream_mut(id).header.budget = new_budget;
        self.stream_mut(id).header.service = 0;
        self.stream_mut(id).budget_timeout = None;
        self.maybe_terminate_wr(id, now);

        if self.stream(id).is_empty() {
            self.stream_mut(id).state = StreamState::Empty;
            let parent = self.stream(id).header.parent.expect("parent");
            let weight = self.stream(id).header.weight;
            self.groups.get_mut(parent).weight_counts.dec(weight);
            if !self.stream(id).shared {
                self.groups.get_mut(parent).untrack_position(id);
            }
        } else {
            self.on_activation(id, now);
        }
    }

    /// Whether some stream other than `except` is both weight-raised and
    /// currently busy (spec §4.4 async-charge doubling condition).
    fn any_other_weight_raised_busy(&self, except: StreamId) -> bool {
        self.streams.iter().enumerate().any(|(i, slot)| {
            slot.as_ref().is_some_and(|s| {
                StreamId(i as u32) != except && s.is_weight_raised() && !s.is_empty()
            })
        })
    }

    fn charge_request(&mut self, id: StreamId, sectors: u32) {
        let any_other_wr_busy = self.any_other_weight_raised_busy(id);
        let async_charge_factor = self.config.async_charge_factor;
        let s = self.stream_mut(id);
        let charge = budget::charge_sectors(sectors, s.sync, s.is_weight_raised(), async_charge_factor, any_other_wr_busy);
        s.header.service = s.header.service.saturating_add(charge);
    }

    /// Sum of in-flight requests across every live stream, used as the
    /// peak-rate estimator's "any other request already outstanding" signal
    /// (spec §4.5), taken before the just-dispatched request's own increment.
    fn total_in_flight(&self) -> u32 {
        self.streams.iter().flatten().map(|s| s.in_flight).sum()
    }

    /// Feeds the peak-rate filter's window gate (spec §4.5); returns whether
    /// the filter actually advanced this call.
    fn maybe_update_peak_rate(&mut self) -> bool {
        let updated = self.peak_rate.maybe_update(&self.config);
        if updated {
            self.peak_rate_update_count += 1;
        }
        updated
    }
}

impl<C: Clock, T: Timer, R: RequestHandle> BlockScheduler<R> for Scheduler<C, T, R> {
    fn on_enqueue(&mut self, icq: StreamSetId, request: R, now: Instant) -> Result<RequestToken> {
        let entry = self.icqs.get(&icq).ok_or(SchedError::UnknownHandle)?;
        let id = entry.stream;
        let sector = request.sector();
        let was_empty = self.stream(id).is_empty();
        let fifo_expire = self.config.fifo_expire_sync;
        self.stream_mut(id).insert_request(request, fifo_expire, now);
        self.stream_mut(id).last_activity = Some(now);

        self.try_merge(id, sector, now);

        if was_empty && self.stream(id).state == StreamState::Empty {
            self.on_activation(id, now);
        }
        invariant!(!self.stream(id).is_empty(), "stream empty right after enqueue");
        Ok(RequestToken { stream: id, sector })
    }

    fn on_dispatch(&mut self, now: Instant) -> Option<Dispatched<R>> {
        if self.in_service.is_none() {
            let id = self.select_next()?;
            let class = self.stream(id).class;
            self.stream_mut(id).state = StreamState::InService;
            self.stream_mut(id).budget_timeout = Some(now + self.config.timeout_sync);
            self.in_service = Some(InService { stream: id, class, timer: None });
        }
        let id = self.in_service.as_ref()?.stream;

        if dispatch::budget_timed_out(self.stream(id).budget_timeout, now) {
            self.expire_in_service(ExpireReason::BudgetTimeout, now);
            return self.on_dispatch(now);
        }

        let last = self.last_dispatch_sector;
        let sector = self.stream(id).next_request_sector(last, self.config.back_seek_max, self.config.back_seek_penalty, now)?;
        let seek_threshold = self.config.seek_threshold_sectors;
        let any_in_flight_before = self.total_in_flight() > 0;
        let request = self.stream_mut(id).take_request(sector, seek_threshold)?;
        let sectors = request.sectors();
        self.last_dispatch_sector = sector + sectors as u64;
        self.charge_request(id, sectors);
        self.peak_rate.on_dispatch(now, sector, sectors, any_in_flight_before, self.config.min_think_time, self.config.seek_threshold_sectors);

        if self.stream(id).is_empty() {
            if dispatch::budget_exhausted(self.stream(id).header.service, self.stream(id).header.budget) {
                self.expire_in_service(ExpireReason::BudgetExhausted, now);
            } else {
                let ctx = self.idle_context(id);
                if idle::should_idle(&ctx, &self.config) {
                    self.arm_idle_if_warranted(now);
                } else {
                    self.expire_in_service(ExpireReason::NoMoreRequests, now);
                }
            }
        } else if dispatch::budget_exhausted(self.stream(id).header.service, self.stream(id).header.budget) {
            self.expire_in_service(ExpireReason::BudgetExhausted, now);
        }

        if self.maybe_update_peak_rate() {
            log::trace!("peak rate estimator converged to {} sectors/us<<shift", self.peak_rate.peak_rate());
        }

        Some(Dispatched { request, token: RequestToken { stream: id, sector } })
    }

    fn on_completion(&mut self, token: RequestToken, completed_at: Instant) {
        if let Some(s) = self.streams.get_mut(token.stream.0 as usize).and_then(|s| s.as_mut()) {
            s.in_flight = s.in_flight.saturating_sub(1);
        }
        self.peak_rate.on_completion(completed_at);
    }

    fn on_requeue(&mut self, icq: StreamSetId, request: R, token: RequestToken, now: Instant) {
        let _ = icq;
        let fifo_expire = self.config.fifo_expire_sync;
        self.stream_mut(token.stream).insert_request(request, fifo_expire, now);
    }

    fn allow_merge(&self, token: RequestToken, candidate_sector: u64) -> bool {
        let Some(s) = self.streams.get(token.stream.0 as usize).and_then(|s| s.as_ref()) else {
            return false;
        };
        s.peek(candidate_sector).is_none() && candidate_sector.abs_diff(token.sector) <= self.config.close_thr_sectors
    }

    fn merged(&mut self, token: RequestToken, kind: MergeKind) {
        log::trace!("request at stream {:?} sector {} merged ({:?})", token.stream, token.sector, kind);
    }

    fn merge_requests(&mut self, rq: RequestToken, next: RequestToken) {
        if rq.stream != next.stream {
            return;
        }
        if let Some(s) = self.streams.get_mut(rq.stream.0 as usize).and_then(|s| s.as_mut()) {
            let _ = s.remove_request(next.sector);
        }
    }

    fn may_queue(&self, icq: StreamSetId) -> QueueAdmission {
        match self.icqs.get(&icq) {
            Some(entry) if entry.stream == self.oom_stream => QueueAdmission::Must,
            Some(_) => QueueAdmission::May,
            None => QueueAdmission::Must,
        }
    }

    fn init_icq(&mut self, owner: OwnerId, class: IoprioClass, level: u8, sync: bool) -> StreamSetId {
        let id = StreamSetId(self.next_icq);
        self.next_icq += 1;
        let stream = self.alloc_stream(owner, class, level, sync, self.root);
        log::debug!("icq {:?} bound owner {:?} to stream {:?}", id, owner, stream);
        self.icqs.insert(id, IcqEntry { owner, refs: 1, stream });
        id
    }

    fn exit_icq(&mut self, icq: StreamSetId, now: Instant) {
        let Some(entry) = self.icqs.get_mut(&icq) else { return };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return;
        }
        let stream = entry.stream;
        self.icqs.remove(&icq);

        // spec §7 "stuck-wait-for-request": a reference count dropping to
        // zero while the bound stream is idling must not leave it waiting
        // forever for a request that will now never arrive.
        if self.stream(stream).state == StreamState::Idling {
            self.expire_in_service(ExpireReason::NoMoreRequests, now);
        }
        if self.stream(stream).is_empty() {
            self.free_stream(stream);
        }
    }

    fn check_ioprio_change(&mut self, icq: StreamSetId, class: IoprioClass, level: u8) {
        let Some(entry) = self.icqs.get(&icq) else { return };
        let id = entry.stream;
        let weight = ioprio_to_weight(class, level);
        let s = self.stream_mut(id);
        if s.class != class || s.original_weight != weight {
            s.class = class;
            s.level = level;
            s.original_weight = weight;
            s.header.prio_changed = true;
        }
    }

    fn force_dispatch(&mut self, now: Instant) -> Vec<Dispatched<R>> {
        let mut out = Vec::new();
        for class in dispatch::CLASS_SCAN_ORDER {
            loop {
                let v = self.groups.get(self.root).domain(class).v();
                self.groups.get_mut(self.root).domain_mut(class).force_advance_to(v);
                let Some((EntityRef::Stream(id), _, _)) = self.groups.get_mut(self.root).domain_mut(class).select_and_remove() else {
                    break;
                };
                while !self.stream(id).is_empty() {
                    let last = self.last_dispatch_sector;
                    let Some(sector) = self.stream(id).next_request_sector(last, self.config.back_seek_max, self.config.back_seek_penalty, now) else {
                        break;
                    };
                    let seek_threshold = self.config.seek_threshold_sectors;
                    if let Some(request) = self.stream_mut(id).take_request(sector, seek_threshold) {
                        self.last_dispatch_sector = sector + request.sectors() as u64;
                        out.push(Dispatched { request, token: RequestToken { stream: id, sector } });
                    } else {
                        break;
                    }
                }
                self.stream_mut(id).state = StreamState::Empty;
                let parent = self.stream(id).header.parent.expect("parent");
                let weight = self.stream(id).header.weight;
                self.groups.get_mut(parent).weight_counts.dec(weight);
            }
        }
        out
    }
}

/// Invoked by the embedder's timer facility when an armed idle timer fires
/// (spec §5, §7 "timer-race"). Not part of [`BlockScheduler`] since it's
/// driven by the `Timer`/`Clock` side channel rather than the producer.
impl<C: Clock, T: Timer, R: RequestHandle> Scheduler<C, T, R> {
    pub fn on_timer_fire(&mut self, fired: TimerId, now: Instant) {
        match &self.in_service {
            Some(in_service) if in_service.timer == Some(fired) => {}
            _ => {
                log::trace!("idle timer {:?} fired after state moved on, ignoring", fired);
                return;
            }
        }
        self.expire_in_service(ExpireReason::TooIdle, now);
    }

    /// Arms (or re-arms) the idle timer for the currently in-service stream
    /// once its sort list drains, per the idle-slice policy (spec §4.9).
    pub fn arm_idle_if_warranted(&mut self, now: Instant) {
        let Some(in_service) = &self.in_service else { return };
        let id = in_service.stream;
        if !self.stream(id).is_empty() {
            return;
        }
        let ctx = self.idle_context(id);
        if !idle::should_idle(&ctx, &self.config) {
            return;
        }
        let dur = idle::idle_timeout(&ctx, &self.config);
        self.idle_timer_id = TimerId(self.idle_timer_id.0 + 1);
        let tid = self.idle_timer_id;
        self.timer.arm(dur, tid);
        if let Some(in_service) = &mut self.in_service {
            in_service.timer = Some(tid);
        }
        self.stream_mut(id).state = StreamState::Idling;
        let _ = now;
    }

    /// Cancels an in-flight idle wait immediately, used by `exit_icq`'s
    /// stuck-wait guard and by a fresh arrival that makes idling moot.
    pub fn cancel_idle(&mut self, stream: StreamId) {
        if let Some(in_service) = &mut self.in_service {
            if in_service.stream == stream {
                if let Some(tid) = in_service.timer.take() {
                    self.timer.cancel(tid);
                }
            }
        }
    }
}
