//! Auto-PPM trainer (§4.6.2): a slow frequency-correction trainer that watches the spectrum
//! snapshot's peak bin drift relative to center and nudges `ppm` to zero it out.
//!
//! Like [`crate::autogain::Autogain`], this ticks once per Controller loop iteration rather than
//! owning a thread of its own, and takes an explicit `now_ms` so tests can drive it without real
//! sleeps (§8).

use crate::{
    config::AutoPpmConfig,
    metrics::Metrics,
};

const GATE_DEBOUNCE_MS: u64 = 2_000;
const SNR_RECENCY_MS: u64 = 800;
const DIRECTION_CONFIRM_MS: u64 = 1_000;
const THROTTLE_MS: u64 = 1_000;
const TRAIN_MAX_STEPS: u32 = 8;
const TRAIN_MAX_MS: u64 = 15_000;
const STABILITY_WINDOW_MS: u64 = 3_000;
const STABILITY_DF_HZ: f32 = 120.0;
const ZEROLOCK_DF_HZ_DEFAULT: f32 = 60.0;
const ZEROLOCK_PPM_DEFAULT: f32 = 0.6;
const DEADBAND_PPM: f32 = 0.8;
const PPM_CLAMP: i32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn sign(self) -> i32 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }

    fn flipped(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

/// Published lock result (§6 `auto_ppm_get_status`).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoPpmStatus {
    pub locked: bool,
    pub lock_ppm: i32,
    pub lock_snr_db: f32,
    pub lock_df_hz: f32,
    pub steps_applied: u32,
    pub training_active: bool,
}

struct PendingDirection {
    direction: Direction,
    step: i32,
    applied_at_ms: u64,
    snr_before_db: f32,
}

/// The Auto-PPM trainer (§4.6.2).
pub struct AutoPpm {
    config: AutoPpmConfig,
    current_ppm: i32,
    gate_since_ms: Option<u64>,
    last_change_ms: u64,
    started_at_ms: Option<u64>,
    steps_applied: u32,
    pending_direction: Option<PendingDirection>,
    same_direction_count: u32,
    last_direction: Option<Direction>,
    stable_since_ms: Option<u64>,
    status: AutoPpmStatus,
}

impl AutoPpm {
    pub fn new(config: AutoPpmConfig, initial_ppm: i32) -> Self {
        Self {
            config,
            current_ppm: initial_ppm,
            gate_since_ms: None,
            last_change_ms: 0,
            started_at_ms: None,
            steps_applied: 0,
            pending_direction: None,
            same_direction_count: 0,
            last_direction: None,
            stable_since_ms: None,
            status: AutoPpmStatus::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.config.enabled = enabled;
        if !enabled {
            self.reset_training();
        }
    }

    pub fn status(&self) -> AutoPpmStatus {
        self.status
    }

    fn reset_training(&mut self) {
        self.gate_since_ms = None;
        self.started_at_ms = None;
        self.steps_applied = 0;
        self.pending_direction = None;
        self.same_direction_count = 0;
        self.last_direction = None;
        self.stable_since_ms = None;
        self.status = AutoPpmStatus::default();
    }

    fn step_size(est_ppm: f32) -> i32 {
        let magnitude = est_ppm.abs();
        if magnitude >= 50.0 {
            8
        }
        else if magnitude >= 25.0 {
            4
        }
        else if magnitude >= 12.0 {
            2
        }
        else {
            1
        }
    }

    fn recent_direct_snr_db(metrics: &Metrics, now_ms: u64) -> Option<f32> {
        [&metrics.c4fm, &metrics.gfsk, &metrics.qpsk]
            .iter()
            .filter_map(|channel| {
                let status = channel.status();
                if status.is_direct() && now_ms.saturating_sub(status.last_update_ms()) <= SNR_RECENCY_MS {
                    Some(status.db() as f32)
                }
                else {
                    None
                }
            })
            .fold(None, |best: Option<f32>, db| Some(best.map_or(db, |b| b.max(db))))
    }

    /// Runs one evaluation, returning `Some(new_ppm)` when the trainer wants the frequency
    /// correction applied. The caller (`Stream`, which also holds the `Backend` handle) is
    /// responsible for programming the device — ppm is a device parameter change, not a retune,
    /// so it does not go through `ControllerHandle`'s mailbox.
    pub fn tick(&mut self, metrics: &Metrics, center_freq_hz: u32, rate_hz: u32, now_ms: u64) -> Option<i32> {
        if !self.config.enabled || self.status.locked {
            return None;
        }

        let (peak_bin, peak_db) = metrics.spectrum.peak_near_center(metrics.spectrum.len() / 4)?;
        if peak_db < self.config.power_threshold_db {
            self.gate_since_ms = None;
            return None;
        }
        let gate_start = *self.gate_since_ms.get_or_insert(now_ms);
        if now_ms.saturating_sub(gate_start) < GATE_DEBOUNCE_MS {
            return None;
        }

        let center = metrics.spectrum.len() / 2;
        if peak_bin == center {
            let left = metrics.spectrum.bin_db(center.saturating_sub(1));
            let right = metrics.spectrum.bin_db(center + 1);
            if peak_db - left.max(right) > 12.0 {
                return None;
            }
        }

        let snr_db = Self::recent_direct_snr_db(metrics, now_ms)?;
        if snr_db < self.config.snr_threshold_db {
            return None;
        }

        let fft_len = metrics.spectrum.len().max(1) as f32;
        let k_hat = parabolic_interpolate(metrics, peak_bin);
        let df_hz = (k_hat - fft_len / 2.0) * rate_hz as f32 / fft_len;
        let est_ppm = df_hz * 1_000_000.0 / center_freq_hz.max(1) as f32;

        self.status.training_active = true;
        self.started_at_ms.get_or_insert(now_ms);

        if let Some(pending) = &self.pending_direction {
            if now_ms.saturating_sub(pending.applied_at_ms) >= DIRECTION_CONFIRM_MS {
                let worse = snr_db < pending.snr_before_db - 0.5;
                let direction = if worse { pending.direction.flipped() } else { pending.direction };
                let step = if worse { pending.step * 2 } else { pending.step };
                self.pending_direction = None;
                return self.maybe_apply(direction, step, df_hz, now_ms);
            }
            return None;
        }

        if est_ppm.abs() <= DEADBAND_PPM {
            self.check_lock(df_hz, est_ppm, snr_db, now_ms);
            return None;
        }

        let direction = if est_ppm > 0.0 { Direction::Up } else { Direction::Down };
        let step = Self::step_size(est_ppm);
        self.evaluate_direction(direction, step, snr_db, now_ms)
    }

    fn evaluate_direction(&mut self, direction: Direction, step: i32, snr_db: f32, now_ms: u64) -> Option<i32> {
        if now_ms.saturating_sub(self.last_change_ms) < THROTTLE_MS {
            return None;
        }

        if self.last_direction == Some(direction) {
            self.same_direction_count += 1;
        }
        else {
            self.last_direction = Some(direction);
            self.same_direction_count = 1;
        }

        let required = if step > 1 { 2 } else { 4 };
        if self.same_direction_count < required {
            return None;
        }

        self.same_direction_count = 0;
        self.pending_direction = Some(PendingDirection {
            direction,
            step,
            applied_at_ms: now_ms,
            snr_before_db: snr_db,
        });
        self.apply_step(direction, step, now_ms)
    }

    fn maybe_apply(&mut self, direction: Direction, step: i32, df_hz: f32, now_ms: u64) -> Option<i32> {
        self.stable_since_ms = None;
        let applied = self.apply_step(direction, step, now_ms);
        let _ = df_hz;
        applied
    }

    fn apply_step(&mut self, direction: Direction, step: i32, now_ms: u64) -> Option<i32> {
        let new_ppm = (self.current_ppm + direction.sign() * step).clamp(-PPM_CLAMP, PPM_CLAMP);
        if new_ppm == self.current_ppm {
            return None;
        }
        self.current_ppm = new_ppm;
        self.last_change_ms = now_ms;
        self.steps_applied += 1;
        self.status.steps_applied = self.steps_applied;
        Some(new_ppm)
    }

    fn check_lock(&mut self, df_hz: f32, est_ppm: f32, snr_db: f32, now_ms: u64) {
        let zero_step_lock =
            self.steps_applied == 0 && df_hz.abs() <= ZEROLOCK_DF_HZ_DEFAULT && est_ppm.abs() <= ZEROLOCK_PPM_DEFAULT;

        let stability_lock = if self.steps_applied >= 1 && df_hz.abs() <= STABILITY_DF_HZ {
            let start = *self.stable_since_ms.get_or_insert(now_ms);
            now_ms.saturating_sub(start) >= STABILITY_WINDOW_MS
        }
        else {
            self.stable_since_ms = None;
            false
        };

        let max_steps_lock = self.steps_applied >= TRAIN_MAX_STEPS;
        let max_time_lock = self
            .started_at_ms
            .is_some_and(|start| self.steps_applied >= 1 && now_ms.saturating_sub(start) >= TRAIN_MAX_MS);

        if zero_step_lock || stability_lock || max_steps_lock || max_time_lock {
            self.status.locked = true;
            self.status.training_active = false;
            self.status.lock_ppm = self.current_ppm;
            self.status.lock_snr_db = snr_db;
            self.status.lock_df_hz = df_hz;
        }
    }
}

/// Parabolic (log-power) interpolation of the true peak bin around an integer peak index.
fn parabolic_interpolate(metrics: &Metrics, peak_bin: usize) -> f32 {
    if peak_bin == 0 || peak_bin + 1 >= metrics.spectrum.len() {
        return peak_bin as f32;
    }
    let left = metrics.spectrum.bin_db(peak_bin - 1);
    let center = metrics.spectrum.bin_db(peak_bin);
    let right = metrics.spectrum.bin_db(peak_bin + 1);
    let denom = left - 2.0 * center + right;
    if denom.abs() <= f32::EPSILON {
        return peak_bin as f32;
    }
    let delta = 0.5 * (left - right) / denom;
    peak_bin as f32 + delta.clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::{
        AutoPpm,
        Direction,
    };
    use crate::{
        config::AutoPpmConfig,
        demod::channel_lpf::ChannelLpfProfile,
        metrics::Metrics,
    };

    #[test]
    fn disabled_trainer_never_suggests_an_adjustment() {
        let mut trainer = AutoPpm::new(
            AutoPpmConfig {
                enabled: false,
                ..AutoPpmConfig::default()
            },
            0,
        );
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);
        assert_eq!(trainer.tick(&metrics, 100_000_000, 48_000, 0), None);
    }

    #[test]
    fn direction_sign_matches_offset() {
        assert_eq!(Direction::Up.sign(), 1);
        assert_eq!(Direction::Down.sign(), -1);
        assert_eq!(Direction::Up.flipped(), Direction::Down);
    }

    #[test]
    fn gate_never_opens_without_a_recent_direct_snr_update() {
        let mut trainer = AutoPpm::new(AutoPpmConfig::default(), 0);
        let metrics = Metrics::new(ChannelLpfProfile::WideAnalog, 48_000.0, 4.0, 256);
        let tone: Vec<num_complex::Complex32> = (0..256).map(|_| num_complex::Complex32::new(0.9, 0.0)).collect();
        metrics.spectrum.update(&tone, 48_000);
        // no SNR estimator has ever been fed a block, so the gate's direct-path SNR requirement
        // (step 4) can never be satisfied regardless of how long the power gate is held open.
        for ms in (0..5_000).step_by(100) {
            assert_eq!(trainer.tick(&metrics, 100_000_000, 48_000, ms), None);
        }
        assert!(!trainer.status().locked);
    }
}
