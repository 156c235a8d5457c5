//! Tunable configuration (spec §6 "Tunables").
//!
//! Rather than a process-wide singleton (spec §9, Design Notes: "fold these
//! into a per-instance configuration constructed during initialization"),
//! every tunable lives on a `Config` value the embedder constructs once and
//! hands to [`crate::scheduler::Scheduler::new`]. Setters clamp to the same
//! ranges the original scheduler's sysfs `STORE_FUNCTION` macros enforced.

use crate::clock::Duration;

/// Every tunable named in spec §6, plus the derived reference tables used by
/// the peak-rate estimator (spec §4.5, §9) to auto-tune budgets and
/// weight-raise durations.
#[derive(Debug, Clone)]
pub struct Config {
    pub fifo_expire_sync: Duration,
    pub fifo_expire_async: Duration,
    /// Maximum backward seek distance allowed at `back_seek_penalty` cost,
    /// in sectors (converted from the KiB tunable at construction).
    pub back_seek_max: u64,
    pub back_seek_penalty: u32,
    pub slice_idle: Duration,
    /// 0 ⇒ auto-computed from the peak-rate estimator.
    pub max_budget: u32,
    pub timeout_sync: Duration,
    pub strict_guarantees: bool,
    pub low_latency: bool,
    pub wr_coeff: u32,
    /// 0 ⇒ auto from peak rate (spec §4.5's `wr_duration`).
    pub wr_max_time: Duration,
    pub wr_rt_max_time: Duration,
    pub wr_min_idle_time: Duration,
    pub wr_min_inter_arr_async: Duration,
    /// Sectors/sec.
    pub wr_max_softrt_rate: u64,
    pub async_charge_factor: u32,

    /// `close_thr`, sectors (spec §4.7: 8 MiB).
    pub close_thr_sectors: u64,
    /// `burst_interval` (spec §4.8): window within which sibling stream
    /// activations count toward the same burst.
    pub burst_interval: Duration,
    /// `large_burst_thresh` (spec §4.8, default 8).
    pub large_burst_threshold: usize,
    /// `min_think_time` used by the peak-rate estimator's sequential-sample
    /// test (spec §4.5).
    pub min_think_time: Duration,
    pub seek_threshold_sectors: u64,
    /// Whether the device exposes a hardware tag queue (NCQ-capable, spec
    /// §4.9). Affects idle-slice policy.
    pub hw_tag: bool,
    /// Maximum number of streams the scheduler will create before routing
    /// further creations to the out-of-memory stream (spec §7).
    pub max_streams: usize,
}

/// `IOPRIO_BE_NR` reference interval, 1 second (spec §4.5 `ref_interval`).
pub const REF_INTERVAL: Duration = Duration::from_secs(1);
/// Fixed-point shift applied to peak-rate arithmetic (`BFQ_RATE_SHIFT`).
pub const RATE_SHIFT: u32 = 16;
/// Minimum number of samples before a rate update is considered (spec §4.5).
pub const RATE_MIN_SAMPLES: u32 = 32;
/// Internal floor below `REF_INTERVAL`, kept for parity with the reference
/// implementation's sampling constants; `maybe_update`'s window gate is
/// `REF_INTERVAL`, not this.
pub const RATE_MIN_INTERVAL: Duration = Duration::from_micros(300_000); // 300ms
/// Implausible-sample ceiling: 20 sectors/µs, in `<<RATE_SHIFT` units
/// (matches the original's bare `20<<BFQ_RATE_SHIFT`, not a sectors/sec
/// figure).
pub const RATE_MAX_PLAUSIBLE: u64 = 20 << RATE_SHIFT;
/// `MIN_TT`: clamp used for seeky/symmetric idle waits (spec §4.9).
pub const MIN_IDLE_TT: Duration = Duration::from_millis(2);

/// Reference peak-rate table, sectors/µs already left-shifted by
/// `RATE_SHIFT` (the literal values are the reference constants as given,
/// not a raw sectors/sec figure to be shifted again), indexed
/// `[rotational=0, non_rotational=1]` (`R_slow`/`R_fast` in the original).
pub const R_SLOW: [u64; 2] = [1000, 10700];
pub const R_FAST: [u64; 2] = [14000, 33000];
/// Reference timeout table, matching `T_slow`/`T_fast`: how long a slice
/// would take to drain `R_{slow,fast}` sectors at `base_timeout`.
pub const T_SLOW: [Duration; 2] = [Duration::from_millis(3500), Duration::from_millis(2000)];
pub const T_FAST: [Duration; 2] = [Duration::from_millis(500), Duration::from_millis(250)];
/// Device-speed reclassification threshold: `4/3 * R_slow`, matching the
/// original's `device_speed_thresh[i] = (4 * R_slow[i]) / 3`.
pub const DEVICE_SPEED_THRESH: [u64; 2] = [(4 * R_SLOW[0]) / 3, (4 * R_SLOW[1]) / 3];

pub const WR_COEFF_DEFAULT: u32 = 30;
pub const SOFTRT_WEIGHT_FACTOR: u32 = 3;

impl Default for Config {
    fn default() -> Self {
        Config {
            fifo_expire_sync: Duration::from_millis(250),
            fifo_expire_async: Duration::from_millis(125),
            back_seek_max: 16384 * 2, // KiB -> 512B sectors
            back_seek_penalty: 2,
            slice_idle: Duration::from_millis(8),
            max_budget: 0,
            timeout_sync: Duration::from_millis(125), // HZ/8 @ HZ=1000
            strict_guarantees: false,
            low_latency: true,
            wr_coeff: WR_COEFF_DEFAULT,
            wr_max_time: Duration::ZERO,
            wr_rt_max_time: Duration::from_millis(300),
            wr_min_idle_time: Duration::from_millis(2000),
            wr_min_inter_arr_async: Duration::from_millis(500),
            wr_max_softrt_rate: 7000,
            async_charge_factor: 10,
            close_thr_sectors: 8 * 1024 * 2, // 8 MiB -> 512B sectors
            burst_interval: Duration::from_millis(300),
            large_burst_threshold: 8,
            min_think_time: Duration::from_millis(2),
            seek_threshold_sectors: 800,
            hw_tag: false,
            max_streams: 8192,
        }
    }
}

impl Config {
    /// `min_budget = max_budget / 32` (spec §4.4).
    pub fn min_budget(&self, effective_max_budget: u32) -> u32 {
        core::cmp::max(1, effective_max_budget / 32)
    }

    /// Clamps a raw `back_seek_max` KiB value to sectors, matching the
    /// original's `STORE_FUNCTION` range clamp (non-negative, no upper
    /// bound beyond `u32::MAX` sectors).
    pub fn set_back_seek_max_kib(&mut self, kib: u32) {
        self.back_seek_max = (kib as u64) * 2;
    }

    /// Applies a named tunable update (spec §6's "human-readable name/value
    /// pairs; no binary format mandated"), for sysfs-style control planes.
    pub fn set_named(&mut self, name: &str, value: i64) -> Result<(), &'static str> {
        match name {
            "fifo_expire_sync" => self.fifo_expire_sync = Duration(value.max(0) as u64),
            "fifo_expire_async" => self.fifo_expire_async = Duration(value.max(0) as u64),
            "back_seek_max" => self.back_seek_max = value.max(0) as u64 * 2,
            "back_seek_penalty" => self.back_seek_penalty = value.max(1) as u32,
            "slice_idle" => self.slice_idle = Duration(value.max(0) as u64),
            "slice_idle_us" => self.slice_idle = Duration::from_micros(value.max(0) as u64),
            "max_budget" => self.max_budget = value.max(0) as u32,
            "timeout_sync" => self.timeout_sync = Duration::from_millis(value.max(1) as u64),
            "strict_guarantees" => self.strict_guarantees = value != 0,
            "low_latency" => self.low_latency = value != 0,
            "wr_coeff" => self.wr_coeff = value.max(1) as u32,
            "wr_max_time" => self.wr_max_time = Duration::from_millis(value.max(0) as u64),
            "wr_rt_max_time" => self.wr_rt_max_time = Duration::from_millis(value.max(0) as u64),
            "wr_min_idle_time" => self.wr_min_idle_time = Duration::from_millis(value.max(0) as u64),
            "wr_min_inter_arr_async" => {
                self.wr_min_inter_arr_async = Duration::from_millis(value.max(0) as u64)
            }
            "wr_max_softrt_rate" => self.wr_max_softrt_rate = value.max(0) as u64,
            _ => return Err("unknown tunable"),
        }
        Ok(())
    }
}
