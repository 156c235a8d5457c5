//! Request-facing types (spec §3: "Request: external opaque handle ... The
//! core does not own requests.").

use crate::clock::Instant;
use crate::stream::StreamId;

/// What the embedder's real request type must expose so the core can sort,
/// charge, and merge it without owning or interpreting its payload.
pub trait RequestHandle {
    /// Starting sector.
    fn sector(&self) -> u64;
    /// Length in sectors.
    fn sectors(&self) -> u32;
    /// True for synchronous (e.g. O_DIRECT read) requests.
    fn is_sync(&self) -> bool;
    /// True for filesystem metadata I/O, preferred over data I/O at equal
    /// seek distance (spec §4.3 "prefer meta over non-meta").
    fn is_meta(&self) -> bool;
    /// Monotonically assigned arrival time.
    fn arrival(&self) -> Instant;
}

/// Identifies a request the scheduler is currently tracking (queued or
/// in-flight), without requiring a separate ID allocator: a stream never
/// holds two pending requests at the same start sector, so `(stream,
/// sector)` is already unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestToken {
    pub stream: StreamId,
    pub sector: u64,
}

/// A request handed back to the producer by [`on_dispatch`](crate::scheduler::BlockScheduler::on_dispatch).
#[derive(Debug)]
pub struct Dispatched<R> {
    pub request: R,
    pub token: RequestToken,
}

/// How a request was merged into an existing one (spec §6 `merged`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// The new request extends an existing one forward.
    Front,
    /// The new request extends an existing one backward.
    Back,
}

/// Admission hint returned by `may_queue` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAdmission {
    /// The producer's pool must allow this allocation (e.g. to avoid
    /// deadlocking on the out-of-memory stream).
    Must,
    /// The producer's pool may apply normal backpressure.
    May,
}
