//! Device peak-rate estimator (spec §4.5), ported from the reference
//! implementation's low-pass filter (`bfq_update_rate_reset` in
//! `original_source/block/bfq-iosched.c`).

use crate::clock::{Duration, Instant};
use crate::config::{
    Config, DEVICE_SPEED_THRESH, RATE_MAX_PLAUSIBLE, RATE_MIN_SAMPLES, RATE_SHIFT, REF_INTERVAL,
    R_FAST, R_SLOW, T_FAST, T_SLOW,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Slow,
    Fast,
}

/// `dev_type` index: 0 = rotational, 1 = non-rotational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Rotational,
    NonRotational,
}

impl DeviceKind {
    fn idx(self) -> usize {
        match self {
            DeviceKind::Rotational => 0,
            DeviceKind::NonRotational => 1,
        }
    }
}

pub struct PeakRateEstimator {
    device_kind: DeviceKind,
    /// Current filtered peak rate, sectors/µs in `<<RATE_SHIFT` fixed
    /// point.
    peak_rate: u64,
    speed: DeviceSpeed,
    /// `R_{slow,fast}[dev_type] * T_{slow,fast}[dev_type]`, feeds
    /// `wr_duration`.
    rt_prod: u64,

    window_open: bool,
    first_dispatch: Instant,
    last_dispatch: Instant,
    last_completion: Instant,
    total_sectors: u64,
    samples: u32,
    sequential_samples: u32,
    last_rq_end_sector: Option<u64>,
    any_in_flight: bool,
}

impl PeakRateEstimator {
    pub fn new(device_kind: DeviceKind) -> Self {
        let idx = device_kind.idx();
        let peak_rate = R_FAST[idx] * 2 / 3;
        PeakRateEstimator {
            device_kind,
            peak_rate,
            speed: DeviceSpeed::Fast,
            rt_prod: R_FAST[idx] * T_FAST[idx].0,
            window_open: false,
            first_dispatch: Instant::ZERO,
            last_dispatch: Instant::ZERO,
            last_completion: Instant::ZERO,
            total_sectors: 0,
            samples: 0,
            sequential_samples: 0,
            last_rq_end_sector: None,
            any_in_flight: false,
        }
    }

    pub fn peak_rate(&self) -> u64 {
        self.peak_rate
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    pub fn rt_prod(&self) -> u64 {
        self.rt_prod
    }

    /// Sectors/sec the filtered rate corresponds to (unshifted), for
    /// introspection and tests.
    pub fn sectors_per_sec(&self) -> u64 {
        (self.peak_rate * 1_000_000) >> RATE_SHIFT
    }

    /// `max_budget = peak_rate * base_timeout` (spec §4.4/§4.5).
    pub fn calc_max_budget(&self, base_timeout: Duration) -> u32 {
        crate::budget::calc_max_budget(self.peak_rate, base_timeout)
    }

    /// `wr_duration`, clamped to `[3s, 13s]` (spec §4.5).
    pub fn wr_duration(&self) -> Duration {
        if self.peak_rate == 0 {
            return Duration::from_secs(3);
        }
        let dur = Duration(self.rt_prod / (self.peak_rate >> RATE_SHIFT).max(1));
        dur.max(Duration::from_secs(3)).min(Duration::from_secs(13))
    }

    /// Called on every dispatch (spec §4.5). `start_sector` is the just
    /// dispatched request's start sector, `sectors` its length, `any_in_flight`
    /// whether any other request was already outstanding on the device.
    pub fn on_dispatch(&mut self, now: Instant, start_sector: u64, sectors: u32, any_in_flight: bool, min_think_time: Duration, seek_threshold: u64) {
        let idle_too_long = now.saturating_sub(self.last_dispatch) > Duration::from_millis(100) && !self.any_in_flight;
        if !self.window_open || idle_too_long {
            self.reset_window(now, start_sector, sectors);
            self.any_in_flight = any_in_flight;
            return;
        }

        let gap = now.saturating_sub(self.last_dispatch);
        let close = self
            .last_rq_end_sector
            .map(|end| start_sector.abs_diff(end) <= seek_threshold)
            .unwrap_or(false);
        let sequential = (any_in_flight || gap <= min_think_time) && close;

        self.samples += 1;
        if sequential {
            self.sequential_samples += 1;
        }
        self.total_sectors += sectors as u64;
        self.last_dispatch = now;
        self.last_rq_end_sector = Some(start_sector + sectors as u64);
        self.any_in_flight = any_in_flight;
    }

    pub fn on_completion(&mut self, now: Instant) {
        self.last_completion = now;
    }

    fn reset_window(&mut self, now: Instant, start_sector: u64, sectors: u32) {
        self.window_open = true;
        self.first_dispatch = now;
        self.last_dispatch = now;
        self.last_completion = now;
        self.samples = 1;
        self.sequential_samples = 0;
        self.total_sectors = sectors as u64;
        self.last_rq_end_sector = Some(start_sector + sectors as u64);
    }

    /// Attempts a rate update if enough samples/time have accumulated (spec
    /// §4.5). Returns `true` if the filter actually advanced.
    pub fn maybe_update(&mut self, cfg: &Config) -> bool {
        let mut window = self.last_dispatch.saturating_sub(self.first_dispatch);
        let since_completion = self.last_completion.saturating_sub(self.first_dispatch);
        if since_completion > window {
            window = since_completion;
        }

        if self.samples < RATE_MIN_SAMPLES || window < REF_INTERVAL {
            return false;
        }
        let window_us = window.as_micros().max(1);
        let raw = (self.total_sectors << RATE_SHIFT) / window_us;

        let mostly_sequential = self.samples as u64 > (3 * self.sequential_samples as u64) / 4;
        let reject = (mostly_sequential && raw <= self.peak_rate) || raw > RATE_MAX_PLAUSIBLE;
        if reject {
            return false;
        }

        let weight = (9 * self.sequential_samples as u64) / self.samples as u64;
        let weight = core::cmp::min(8, (weight * window_us) / crate::config::REF_INTERVAL.as_micros());
        let divisor = 10 - weight;

        self.peak_rate = self.peak_rate * (divisor - 1) / divisor + raw / divisor;
        self.peak_rate = self.peak_rate.min(RATE_MAX_PLAUSIBLE);

        self.reclassify(cfg);
        true
    }

    fn reclassify(&mut self, _cfg: &Config) {
        let idx = self.device_kind.idx();
        if self.speed == DeviceSpeed::Fast && self.peak_rate < DEVICE_SPEED_THRESH[idx] {
            self.speed = DeviceSpeed::Slow;
            self.rt_prod = R_SLOW[idx] * T_SLOW[idx].0;
        } else if self.speed == DeviceSpeed::Slow && self.peak_rate > DEVICE_SPEED_THRESH[idx] {
            self.speed = DeviceSpeed::Fast;
            self.rt_prod = R_FAST[idx] * T_FAST[idx].0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_plausible_bounds_after_update() {
        let mut est = PeakRateEstimator::new(DeviceKind::NonRotational);
        let cfg = Config::default();
        let mut now = Instant::ZERO;
        // Feed 40 sequential dispatches of 4096 sectors each, 25ms apart:
        // ~1s window, 40*4096/1 ~= 163840 sectors/s well within bounds.
        let mut sector = 0u64;
        for _ in 0..40 {
            now = now + Duration::from_millis(25);
            est.on_dispatch(now, sector, 4096, true, Duration::from_millis(2), 800);
            sector += 4096;
        }
        est.maybe_update(&cfg);
        assert!(est.peak_rate() <= RATE_MAX_PLAUSIBLE);
        assert!(est.peak_rate() > 0);
    }

    #[test]
    fn rejects_implausibly_high_raw_sample() {
        let mut est = PeakRateEstimator::new(DeviceKind::NonRotational);
        let cfg = Config::default();
        let before = est.peak_rate();
        // One dispatch of an enormous size in a tiny window => absurd bw.
        est.on_dispatch(Instant::ZERO, 0, u32::MAX, false, Duration::from_millis(2), 800);
        for i in 1..40u64 {
            est.on_dispatch(Instant(i), i * 8, 8, false, Duration::from_millis(2), 800);
        }
        let updated = est.maybe_update(&cfg);
        if updated {
            assert!(est.peak_rate() <= RATE_MAX_PLAUSIBLE);
        } else {
            assert_eq!(est.peak_rate(), before);
        }
    }
}
