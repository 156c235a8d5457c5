//! Error types for the scheduler core.
//!
//! Follows the workspace convention (see `kernel/src/net/cluster.rs`,
//! `kernel/src/process/exec.rs`): a plain `Debug + Clone + Copy` enum with a
//! hand-written `Display` impl, no dependency on `std::error::Error`.

use core::fmt;

/// Errors the scheduler can report to its embedder.
///
/// Per spec, almost nothing is surfaced here: allocation failure is absorbed
/// by the out-of-memory stream, and timer races/stuck-waits are silent
/// no-ops. This enum only covers the handful of cases where the embedder
/// genuinely needs to know something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// A state mutation would have violated a core invariant (budget ≤
    /// service, exclusive tree membership, non-negative refcount). In a
    /// `panic = "abort"` build this is raised as a panic instead; this
    /// variant exists for embedders built with unwinding enabled.
    InvariantViolation(&'static str),
    /// The referenced stream, group, or request token is not known to the
    /// scheduler (already freed, or never existed).
    UnknownHandle,
    /// The scheduler has reached its configured maximum number of streams
    /// and the out-of-memory stream itself is being torn down (should not
    /// happen in practice; surfaced rather than silently dropping I/O).
    Exhausted,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::InvariantViolation(what) => {
                write!(f, "scheduler invariant violated: {}", what)
            }
            SchedError::UnknownHandle => write!(f, "unknown stream/group/request handle"),
            SchedError::Exhausted => write!(f, "scheduler out of stream slots"),
        }
    }
}

pub type Result<T> = core::result::Result<T, SchedError>;

/// Panics in debug profile (matching the workspace's `panic = "abort"`
/// default), returns `Err` otherwise. Mirrors the `BUG_ON` macros the
/// original scheduler is built on.
macro_rules! invariant {
    ($cond:expr, $msg:literal) => {
        if !$cond {
            log::error!("invariant violated: {}", $msg);
            #[cfg(debug_assertions)]
            {
                panic!("ioqos invariant violated: {}", $msg);
            }
            #[cfg(not(debug_assertions))]
            {
                return Err($crate::error::SchedError::InvariantViolation($msg));
            }
        }
    };
}

pub(crate) use invariant;
