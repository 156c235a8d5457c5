//! A proportional-share block I/O scheduler core: H-WF2Q+ virtual-time fair
//! queueing over sector-budgeted streams, with weight raising for
//! interactive/soft-real-time workloads, burst suppression, cooperator
//! detection, and device peak-rate auto-tuning.
//!
//! The crate is `no_std` and owns no locking or threading of its own (spec
//! §1, §2): an embedder wraps a `Scheduler` in whatever mutex fits their
//! runtime (kernel block layer, userspace I/O scheduler, simulator) and
//! drives it through the [`scheduler::BlockScheduler`] trait under that
//! lock, exactly as `kernel/src/block/scheduler.rs` wraps its
//! `Box<dyn IoScheduler>` implementors in a `Mutex`.

#![no_std]

extern crate alloc;

pub mod budget;
pub mod burst;
pub mod clock;
pub mod config;
pub mod cooperator;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod group;
pub mod idle;
pub mod peak_rate;
pub mod priority;
pub mod request;
pub mod scheduler;
pub mod stream;
pub mod weight_raise;

pub use clock::{Clock, Duration, Instant, Timer, TimerId};
pub use config::Config;
pub use error::{SchedError, Result};
pub use peak_rate::DeviceKind;
pub use priority::IoprioClass;
pub use request::{Dispatched, MergeKind, QueueAdmission, RequestHandle, RequestToken};
pub use scheduler::{BlockScheduler, Scheduler, StreamSetId};
pub use stream::{OwnerId, StreamId};
