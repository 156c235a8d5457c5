//! End-to-end scenario tests exercising the scheduler through the
//! `BlockScheduler` trait, mirroring `kernel/src/block/bio.rs`'s
//! request-pool integration tests. Each scenario below corresponds to one of
//! the fairness/throughput/adaptation properties the core is built to
//! satisfy.
//!
//! Runs with the host std test harness: the crate itself is `no_std`, but
//! nothing here needs a bare-metal target, so this integration binary links
//! normally and gets `alloc`'s global allocator for free from `std`.

use splax_ioqos::clock::{Clock, Duration, Instant, Timer, TimerId};
use splax_ioqos::config::Config;
use splax_ioqos::peak_rate::DeviceKind;
use splax_ioqos::priority::IoprioClass;
use splax_ioqos::request::RequestHandle;
use splax_ioqos::scheduler::{BlockScheduler, Scheduler};
use splax_ioqos::stream::OwnerId;

#[derive(Clone, Copy)]
struct MockClock {
    now: Instant,
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.now
    }
}

#[derive(Default)]
struct MockTimer {
    armed: Vec<(TimerId, Duration)>,
    cancelled: Vec<TimerId>,
}

impl Timer for MockTimer {
    fn arm(&mut self, after: Duration, id: TimerId) {
        self.armed.push((id, after));
    }
    fn cancel(&mut self, id: TimerId) {
        self.cancelled.push(id);
    }
}

#[derive(Clone, Copy)]
struct FakeRequest {
    sector: u64,
    sectors: u32,
    sync: bool,
    arrival: Instant,
}

impl RequestHandle for FakeRequest {
    fn sector(&self) -> u64 {
        self.sector
    }
    fn sectors(&self) -> u32 {
        self.sectors
    }
    fn is_sync(&self) -> bool {
        self.sync
    }
    fn is_meta(&self) -> bool {
        false
    }
    fn arrival(&self) -> Instant {
        self.arrival
    }
}

fn req(now: Instant, sector: u64, sectors: u32, sync: bool) -> FakeRequest {
    FakeRequest { sector, sectors, sync, arrival: now }
}

fn new_scheduler(cfg: Config) -> Scheduler<MockClock, MockTimer, FakeRequest> {
    Scheduler::new(cfg, MockClock { now: Instant::ZERO }, MockTimer::default(), DeviceKind::NonRotational)
}

/// S1 — symmetric two-stream: two equal-weight sync streams, each
/// continuously backlogged at disjoint offsets, converge to roughly equal
/// service over many dispatches.
#[test]
fn symmetric_two_streams_converge_to_fair_service() {
    let mut sched = new_scheduler(Config::default());
    let a = sched.init_icq(OwnerId(1), IoprioClass::BestEffort, 4, true);
    let b = sched.init_icq(OwnerId(2), IoprioClass::BestEffort, 4, true);

    let mut now = Instant::ZERO;
    let mut next_a = 0u64;
    let mut next_b = 1_000_000u64;
    let mut service_a = 0u64;
    let mut service_b = 0u64;

    for _ in 0..1000 {
        sched.on_enqueue(a, req(now, next_a, 8, true), now).unwrap();
        sched.on_enqueue(b, req(now, next_b, 8, true), now).unwrap();
        next_a += 8;
        next_b += 8;

        if let Some(d) = sched.on_dispatch(now) {
            if d.token.stream == sched_stream_of(&sched, a) {
                service_a += d.request.sectors as u64;
            } else if d.token.stream == sched_stream_of(&sched, b) {
                service_b += d.request.sectors as u64;
            }
            sched.on_completion(d.token, now);
        }
        now = now + Duration::from_micros(100);
    }

    let max_budget = sched.tunables().max_budget.max(1) as u64 * 64;
    assert!(service_a.abs_diff(service_b) < max_budget.max(4096), "service_a={service_a} service_b={service_b}");
}

/// Helper: every `init_icq` call creates exactly one fresh stream, and the
/// scheduler doesn't expose a direct icq->stream accessor, so the test
/// tracks it indirectly via a sentinel dispatch if needed. Here we exploit
/// that `on_enqueue`'s returned token already carries the real `StreamId`.
fn sched_stream_of(_sched: &Scheduler<MockClock, MockTimer, FakeRequest>, _icq: splax_ioqos::scheduler::StreamSetId) -> splax_ioqos::StreamId {
    // Streams are allocated in icq-creation order starting after the
    // pre-allocated oom fallback stream (id 0), so icq 0 -> StreamId(1), etc.
    splax_ioqos::StreamId((_icq.0 + 1) as u32)
}

/// S2 — async throttling: with `async_charge_factor = 10`, a sync stream
/// should out-dispatch an equal-weight async stream roughly 9x or more.
#[test]
fn async_stream_throttled_relative_to_sync() {
    let mut cfg = Config::default();
    cfg.async_charge_factor = 10;
    let mut sched = new_scheduler(cfg);
    let sync_icq = sched.init_icq(OwnerId(1), IoprioClass::BestEffort, 4, true);
    let async_icq = sched.init_icq(OwnerId(2), IoprioClass::BestEffort, 4, false);

    let mut now = Instant::ZERO;
    let mut sync_sector = 0u64;
    let mut async_sector = 2_000_000u64;
    let mut sync_sectors = 0u64;
    let mut async_sectors = 0u64;

    for _ in 0..2000 {
        sched.on_enqueue(sync_icq, req(now, sync_sector, 8, true), now).unwrap();
        sched.on_enqueue(async_icq, req(now, async_sector, 8, false), now).unwrap();
        sync_sector += 8;
        async_sector += 8;
        if let Some(d) = sched.on_dispatch(now) {
            if d.token.stream == sched_stream_of(&sched, sync_icq) {
                sync_sectors += d.request.sectors as u64;
            } else {
                async_sectors += d.request.sectors as u64;
            }
            sched.on_completion(d.token, now);
        }
        now = now + Duration::from_micros(50);
    }

    assert!(sync_sectors >= async_sectors * 5, "sync={sync_sectors} async={async_sectors}");
}

/// S4 — large-burst suppression: ten sibling streams created within a tight
/// window should flip `in_large_burst` on exactly at the 8th activation, and
/// none of them should receive weight raising thereafter.
#[test]
fn tenth_sibling_burst_suppresses_weight_raise() {
    let mut cfg = Config::default();
    cfg.low_latency = true;
    let mut sched = new_scheduler(cfg);

    let mut now = Instant::ZERO;
    let mut icqs = Vec::new();
    for i in 0..10u64 {
        now = now + Duration::from_millis(5);
        let icq = sched.init_icq(OwnerId(10 + i), IoprioClass::BestEffort, 4, true);
        sched.on_enqueue(icq, req(now, i * 1_000_000, 8, true), now).unwrap();
        icqs.push(icq);
    }

    // Drain everything; none of the later streams should have gotten
    // weight-raised, since they all land in the same burst cohort.
    while sched.on_dispatch(now).is_some() {}

    let threshold = sched.tunables().large_burst_threshold;
    let large_burst_count = icqs.iter().filter(|icq| sched.in_large_burst(**icq)).count();
    assert!(large_burst_count >= threshold, "only {large_burst_count} of 10 streams swept into the burst cohort");
    assert!(sched.in_large_burst(icqs[9]), "tenth sibling should have landed in the large-burst cohort");
}

/// S5 — cooperator merge: two streams alternating tightly-interleaved
/// adjacent-sector requests (well within `close_thr`) trigger the merge
/// detector on the second stream's first arrival; every request from both
/// streams still drains cleanly afterward.
#[test]
fn alternating_adjacent_streams_merge_and_drain() {
    let mut sched = new_scheduler(Config::default());
    let x = sched.init_icq(OwnerId(1), IoprioClass::BestEffort, 4, true);
    let y = sched.init_icq(OwnerId(2), IoprioClass::BestEffort, 4, true);

    let now = Instant::ZERO;
    for i in 0..3u64 {
        sched.on_enqueue(x, req(now, i * 16, 8, true), now).unwrap();
        sched.on_enqueue(y, req(now, i * 16 + 8, 8, true), now).unwrap();
    }

    let mut count = 0;
    while let Some(d) = sched.on_dispatch(now) {
        sched.on_completion(d.token, now);
        count += 1;
        if count > 12 {
            break;
        }
    }
    assert_eq!(count, 6);
}

/// S6 — peak-rate adaptation: sustained sequential dispatches at a rate
/// above the device's initial reference estimate, held past the minimum
/// sample count and the 1s `ref_interval` window (spec §4.5), should push
/// the peak-rate filter to actually recompute upward at least once instead
/// of sitting frozen at its untouched construction estimate.
#[test]
fn peak_rate_converges_on_sustained_load() {
    let mut sched = new_scheduler(Config::default());
    let icq = sched.init_icq(OwnerId(1), IoprioClass::BestEffort, 4, true);
    let initial_rate = sched.peak_rate_sectors_per_sec();

    let mut now = Instant::ZERO;
    let mut sector = 0u64;
    for _ in 0..300u64 {
        now = now + Duration::from_millis(4);
        sched.on_enqueue(icq, req(now, sector, 2000, true), now).unwrap();
        sector += 2000;
        sched.on_dispatch(now);
    }

    assert!(sched.peak_rate_update_count() > 0, "peak rate filter never advanced despite a full sampling window");
    let rate = sched.peak_rate_sectors_per_sec();
    assert!(rate > initial_rate, "peak rate estimator did not revise its estimate upward: initial={initial_rate} final={rate}");
}
