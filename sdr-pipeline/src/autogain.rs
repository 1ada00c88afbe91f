//! Supervisory tuner-autogain (§4.6.1): a slow-moving state machine that nudges the tuner's
//! manual gain index up or down based on 40-block evaluation windows of channel power and
//! spectral occupancy.
//!
//! Runs inside the Controller thread's own loop body (§5), not on a separate thread; `tick` is
//! called once per Controller iteration and is a no-op unless a full evaluation window has
//! elapsed. The clock is injectable (`now_ms: impl Fn() -> u64`) per §8's testability note, so
//! unit tests can drive the state machine without real sleeps.

use std::time::Duration;

use crate::{
    config::AutogainConfig,
    metrics::Metrics,
};

const WINDOW_BLOCKS: u32 = 40;
/// §4.6.1 "high ≥ 3 in a window" — an absolute count, not a fraction.
const HIGH_POWER_COUNT_THRESHOLD: u32 = 3;
/// §4.6.1 "low ≥ 75% of blocks".
const LOW_POWER_FRACTION_THRESHOLD: f32 = 0.75;
/// §4.6.1 "max|I|,|Q| > 0.9" / "mean|I|,|Q| < 0.06" per-block thresholds.
const HIGH_IQ_THRESHOLD: f32 = 0.9;
const LOW_IQ_THRESHOLD: f32 = 0.06;
/// §4.6.1 "min 1500 ms between changes".
const THROTTLE_MS: u64 = 1_500;
/// §4.6.1 "Hold 1200 ms after any retune".
const RETUNE_HOLD_MS: u64 = 1_200;
/// §4.6.1 up-step spectral gate's "peak − max(neighbor) ≤ 12 dB if exactly center bin" DC-spur
/// guard, shared with the Auto-PPM trainer's identical check.
const DC_SPUR_GUARD_DB: f32 = 12.0;

/// What the autogain state machine wants the Controller to do this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutogainAction {
    None,
    SetGainDb(f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Probing,
    Bootstrapped,
    Holding,
}

/// One evaluation window's rolling accumulators, observed directly on the raw-input `|I|,|Q|`
/// magnitudes (§4.6.1), not on post-filter channel power.
#[derive(Debug, Default, Clone, Copy)]
struct Window {
    blocks: u32,
    high_power_blocks: u32,
    low_power_blocks: u32,
}

impl Window {
    fn observe(&mut self, peak_iq: f32, mean_iq: f32) {
        self.blocks += 1;
        if peak_iq > HIGH_IQ_THRESHOLD {
            self.high_power_blocks += 1;
        }
        if mean_iq < LOW_IQ_THRESHOLD {
            self.low_power_blocks += 1;
        }
    }

    fn low_fraction(&self) -> f32 {
        if self.blocks == 0 { 0.0 } else { self.low_power_blocks as f32 / self.blocks as f32 }
    }
}

/// The supervisory tuner-autogain state machine (§4.6.1).
pub struct Autogain {
    config: AutogainConfig,
    phase: Phase,
    /// Whether the tuner is still under the driver's own AGC (true until the probe-bootstrap or
    /// the low-power bootstrap first seeds a manual gain value), gating the low-power bootstrap
    /// rule ("Device in auto AND low ≥ 75%").
    in_auto: bool,
    current_gain_db: f32,
    window: Window,
    probe_started: bool,
    probe_deadline_ms: u64,
    up_persist_count: u32,
    throttle_until_ms: u64,
    retune_hold_until_ms: u64,
}

impl Autogain {
    pub fn new(config: AutogainConfig) -> Self {
        let current_gain_db = config.seed_db;
        Self {
            config,
            phase: Phase::Probing,
            in_auto: true,
            current_gain_db,
            window: Window::default(),
            probe_started: false,
            probe_deadline_ms: 0,
            up_persist_count: 0,
            throttle_until_ms: 0,
            retune_hold_until_ms: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if enabled {
            self.phase = Phase::Probing;
            self.window = Window::default();
            self.probe_started = false;
        }
    }

    pub fn current_gain_db(&self) -> f32 {
        self.current_gain_db
    }

    /// Re-arms the post-retune hold (§4.6.1 "Hold 1200 ms after any retune"); called by the
    /// Controller from `do_retune`.
    pub fn on_retune(&mut self, now_ms: u64) {
        self.retune_hold_until_ms = now_ms + RETUNE_HOLD_MS;
        self.window = Window::default();
    }

    /// Called once per Controller loop iteration with the most recent block's observations.
    /// `squelch_open` reflects the DSP worker's current squelch state (§4.6.1 up-step's
    /// "requires channel squelch open" gate). Returns `AutogainAction::SetGainDb` at most once
    /// per evaluation window.
    pub fn tick(&mut self, metrics: &Metrics, squelch_open: bool, now_ms: u64) -> AutogainAction {
        if !self.config.enabled || now_ms < self.retune_hold_until_ms {
            return AutogainAction::None;
        }

        match self.phase {
            Phase::Probing => self.tick_probing(now_ms),
            Phase::Bootstrapped | Phase::Holding => self.tick_steady(metrics, squelch_open, now_ms),
        }
    }

    fn tick_probing(&mut self, now_ms: u64) -> AutogainAction {
        if !self.probe_started {
            self.probe_started = true;
            self.probe_deadline_ms = now_ms + self.config.probe.as_millis() as u64;
            return AutogainAction::None;
        }
        if now_ms < self.probe_deadline_ms {
            return AutogainAction::None;
        }
        self.phase = Phase::Bootstrapped;
        AutogainAction::None
    }

    fn tick_steady(&mut self, metrics: &Metrics, squelch_open: bool, now_ms: u64) -> AutogainAction {
        self.window.observe(metrics.peak_iq(), metrics.mean_iq());

        if self.window.blocks < WINDOW_BLOCKS {
            return AutogainAction::None;
        }

        let high_count = self.window.high_power_blocks;
        let low_fraction = self.window.low_fraction();
        self.window = Window::default();

        if now_ms < self.throttle_until_ms {
            return AutogainAction::None;
        }

        // Step down applies regardless of the driver's auto-gain state (§4.6.1).
        if high_count >= HIGH_POWER_COUNT_THRESHOLD {
            self.up_persist_count = 0;
            self.current_gain_db = (self.current_gain_db - self.config.down_step_db).clamp(0.0, 49.0);
            self.in_auto = false;
            self.phase = Phase::Holding;
            self.throttle_until_ms = now_ms + THROTTLE_MS;
            return AutogainAction::SetGainDb(self.current_gain_db);
        }

        // Bootstrap out of auto on sustained low power, only while still under driver auto-gain.
        if self.in_auto && low_fraction >= LOW_POWER_FRACTION_THRESHOLD {
            self.current_gain_db = self.config.seed_db;
            self.in_auto = false;
            self.phase = Phase::Holding;
            self.throttle_until_ms = now_ms + THROTTLE_MS;
            return AutogainAction::SetGainDb(self.current_gain_db);
        }

        if squelch_open && self.up_step_gate_open(metrics) {
            self.up_persist_count += 1;
            if self.up_persist_count >= self.config.up_persist {
                self.up_persist_count = 0;
                self.current_gain_db = (self.current_gain_db + self.config.up_step_db).clamp(0.0, 49.0);
                self.in_auto = false;
                self.phase = Phase::Holding;
                self.throttle_until_ms = now_ms + THROTTLE_MS;
                return AutogainAction::SetGainDb(self.current_gain_db);
            }
            return AutogainAction::None;
        }

        self.up_persist_count = 0;
        AutogainAction::None
    }

    /// §4.6.1 up-step spectral gate: peak-in-center without a DC spur, spectral SNR above
    /// threshold, and sufficient central-band power ratio.
    fn up_step_gate_open(&self, metrics: &Metrics) -> bool {
        let Some((peak_bin, peak_db)) = metrics.spectrum.peak_near_center(metrics.spectrum.len() / 4) else {
            return false;
        };
        let center = metrics.spectrum.len() / 2;
        if peak_bin == center {
            let left = metrics.spectrum.bin_db(center.saturating_sub(1));
            let right = metrics.spectrum.bin_db(center + 1);
            if peak_db - left.max(right) > DC_SPUR_GUARD_DB {
                return false;
            }
        }

        let noise_floor_db = metrics.spectrum.median_db();
        let spectral_snr_db = peak_db - noise_floor_db;
        if spectral_snr_db < self.config.spectral_snr_db {
            return false;
        }

        metrics.spectrum.central_band_power_ratio(8) >= self.config.inband_ratio
    }
}

/// Models the probe deadline as a `Duration` rather than an absolute timestamp for callers that
/// only want to know how long the initial probe window is (§4.6.1 step 1).
pub fn probe_window(config: &AutogainConfig) -> Duration {
    config.probe
}

#[cfg(test)]
mod tests {
    use super::{
        Autogain,
        AutogainAction,
    };
    use crate::{
        config::AutogainConfig,
        demod::channel_lpf::ChannelLpfProfile,
        metrics::Metrics,
    };

    #[test]
    fn disabled_autogain_never_acts() {
        let mut autogain = Autogain::new(AutogainConfig {
            enabled: false,
            ..AutogainConfig::default()
        });
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);
        assert_eq!(autogain.tick(&metrics, true, 0), AutogainAction::None);
        assert_eq!(autogain.tick(&metrics, true, 100_000), AutogainAction::None);
    }

    #[test]
    fn probe_window_elapses_without_acting() {
        let config = AutogainConfig {
            enabled: true,
            probe: std::time::Duration::from_millis(100),
            seed_db: 25.0,
            ..AutogainConfig::default()
        };
        let mut autogain = Autogain::new(config);
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);

        assert_eq!(autogain.tick(&metrics, true, 0), AutogainAction::None);
        assert_eq!(autogain.tick(&metrics, true, 50), AutogainAction::None);
        // The probe only advances the phase to `Bootstrapped`; the device stays under its own
        // auto gain until a high/low window condition fires (§4.6.1).
        assert_eq!(autogain.tick(&metrics, true, 150), AutogainAction::None);
    }

    #[test]
    fn sustained_high_peak_iq_steps_gain_down_by_an_absolute_count() {
        let config = AutogainConfig {
            enabled: true,
            probe: std::time::Duration::from_millis(0),
            seed_db: 25.0,
            down_step_db: 5.0,
            ..AutogainConfig::default()
        };
        let mut autogain = Autogain::new(config);
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);
        // Two calls are enough to clear the zero-length probe and reach `Bootstrapped` without
        // touching the evaluation window.
        autogain.tick(&metrics, true, 0);
        autogain.tick(&metrics, true, 1);

        // Exactly 3 high-peak observations out of the 40-observation window should trip the
        // down-step, per the literal "high >= 3 in a window" threshold rather than a fraction.
        let mut action = AutogainAction::None;
        for i in 0..40 {
            let (peak_iq, mean_iq) = if i < 3 { (0.95, 0.5) } else { (0.3, 0.5) };
            metrics.observe_block(&[], &[], &[], 4.0, 48_000, 0.0, peak_iq, mean_iq, 10);
            action = autogain.tick(&metrics, true, 100);
        }
        assert_eq!(action, AutogainAction::SetGainDb(20.0));
    }

    #[test]
    fn retune_hold_suppresses_ticks_for_1200ms() {
        let config = AutogainConfig {
            enabled: true,
            probe: std::time::Duration::from_millis(0),
            ..AutogainConfig::default()
        };
        let mut autogain = Autogain::new(config);
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);
        autogain.tick(&metrics, true, 0);
        autogain.on_retune(1_000);

        assert_eq!(autogain.tick(&metrics, true, 1_100), AutogainAction::None);
        assert_eq!(autogain.tick(&metrics, true, 2_199), AutogainAction::None);
    }
}
