//! Per-modulation SNR estimators (§4.3 "SNR estimation").
//!
//! Each estimator produces a raw variance-ratio or EVM-based dB figure, which is then corrected
//! for the noise-equivalent bandwidth of the active channel filter before being smoothed and
//! published.

use num_complex::Complex32;

use crate::demod::channel_lpf::ChannelLpfProfile;

/// How the most recent SNR figure was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnrSource {
    /// Computed directly from this block's symbol/sample stream.
    Direct,
    /// Stale window: blended from the constellation/eye-ring fallback estimate.
    Fallback,
}

fn bias_correction(profile: ChannelLpfProfile, estimator_bias_db: f32, rate_out_hz: f32, sps: f32) -> f32 {
    let b_n = profile.reference_noise_bandwidth_hz() * (rate_out_hz / 24_000.0);
    let r_s = rate_out_hz / sps;
    estimator_bias_db + 10.0 * (b_n / r_s).log10()
}

/// Modulation class selecting which raw estimator formula applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    C4fm,
    Gfsk,
    Qpsk,
}

impl Modulation {
    fn estimator_bias_db(self) -> f32 {
        match self {
            Modulation::C4fm => 5.73,
            Modulation::Gfsk | Modulation::Qpsk => 1.92,
        }
    }

    fn stale_after_missed_updates(self) -> u32 {
        match self {
            Modulation::C4fm | Modulation::Gfsk => 50,
            Modulation::Qpsk => 10,
        }
    }
}

/// Variance-ratio estimate over a set of quartile-clustered symbol-center samples, shared by the
/// C4FM (4-level) and GFSK (2-level) estimators.
fn quartile_variance_ratio_db(mut samples: Vec<f32>, levels: usize) -> Option<f32> {
    if samples.len() < levels * 2 {
        return None;
    }
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let bin_size = samples.len() / levels;
    let mut signal_var = 0.0f32;
    let mut noise_var = 0.0f32;
    for bin in 0..levels {
        let start = bin * bin_size;
        let end = if bin + 1 == levels { samples.len() } else { start + bin_size };
        let chunk = &samples[start..end];
        let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
        let var = chunk.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / chunk.len() as f32;
        noise_var += var;
    }
    noise_var /= levels as f32;

    // signal variance: spread of the per-bin means around the global mean
    let global_mean = samples.iter().sum::<f32>() / samples.len() as f32;
    for bin in 0..levels {
        let start = bin * bin_size;
        let end = if bin + 1 == levels { samples.len() } else { start + bin_size };
        let chunk = &samples[start..end];
        let mean = chunk.iter().sum::<f32>() / chunk.len() as f32;
        signal_var += (mean - global_mean).powi(2);
    }
    signal_var /= levels as f32;

    if noise_var <= f32::EPSILON {
        return Some(60.0);
    }
    Some(10.0 * (signal_var / noise_var).log10())
}

/// Samples a demodulated FM-path block near symbol centers: indices within `±sps/10` of each
/// `sps`-spaced mid-sample.
fn symbol_center_samples(block: &[f32], sps: f32) -> Vec<f32> {
    let sps = sps.max(1.0);
    let window = (sps / 10.0).max(1.0) as i64;
    let mut out = Vec::new();
    let mut center = sps / 2.0;
    while (center as usize) < block.len() {
        let idx = center as i64;
        let lo = (idx - window).max(0);
        let hi = (idx + window).min(block.len() as i64 - 1);
        for i in lo..=hi {
            out.push(block[i as usize]);
        }
        center += sps;
    }
    out
}

/// EVM-based estimate for a QPSK constellation snapshot: evaluates both axis-aligned and
/// 45°-rotated unit targets and keeps whichever gives the better (larger) signal/noise ratio.
fn qpsk_evm_ratio_db(symbols: &[Complex32]) -> Option<f32> {
    if symbols.is_empty() {
        return None;
    }
    let axis_err = evm_against_targets(symbols, 0.0);
    let diag_err = evm_against_targets(symbols, std::f32::consts::FRAC_PI_4);
    let (signal_power, noise_power) = if axis_err.1 >= diag_err.1 { axis_err } else { diag_err };
    if noise_power <= f32::EPSILON {
        return Some(60.0);
    }
    Some(10.0 * (signal_power / noise_power).log10())
}

/// Returns `(signal_power, noise_power)` for a given constellation rotation. `signal_power` is
/// the mean squared target magnitude; `noise_power` is the mean squared error against the
/// nearest of the four unit-magnitude targets rotated by `rotation`.
fn evm_against_targets(symbols: &[Complex32], rotation: f32) -> (f32, f32) {
    let rot = Complex32::new(rotation.cos(), rotation.sin());
    let targets = [
        Complex32::new(1.0, 1.0) * rot,
        Complex32::new(1.0, -1.0) * rot,
        Complex32::new(-1.0, 1.0) * rot,
        Complex32::new(-1.0, -1.0) * rot,
    ];
    let mut signal_power = 0.0f32;
    let mut noise_power = 0.0f32;
    for &sym in symbols {
        let nearest = targets
            .iter()
            .min_by(|a, b| (sym - **a).norm_sqr().partial_cmp(&(sym - **b).norm_sqr()).unwrap())
            .unwrap();
        signal_power += nearest.norm_sqr();
        noise_power += (sym - *nearest).norm_sqr();
    }
    let n = symbols.len() as f32;
    (signal_power / n, noise_power / n)
}

/// A single modulation-class SNR channel: raw estimate, bias correction, EMA smoothing, and
/// stale-window fallback blending (§4.3).
#[derive(Debug, Clone)]
pub struct SnrEstimator {
    modulation: Modulation,
    profile: ChannelLpfProfile,
    rate_out_hz: f32,
    sps: f32,
    smoothed_db: f32,
    missed_updates: u32,
    source: SnrSource,
    last_update_ms: u64,
}

impl SnrEstimator {
    pub fn new(modulation: Modulation, profile: ChannelLpfProfile, rate_out_hz: f32, sps: f32) -> Self {
        Self {
            modulation,
            profile,
            rate_out_hz,
            sps,
            smoothed_db: 0.0,
            missed_updates: 0,
            source: SnrSource::Direct,
            last_update_ms: 0,
        }
    }

    pub fn set_profile(&mut self, profile: ChannelLpfProfile) {
        self.profile = profile;
    }

    pub fn set_sps(&mut self, sps: f32) {
        self.sps = sps;
    }

    pub fn smoothed_db(&self) -> f32 {
        self.smoothed_db
    }

    pub fn source(&self) -> SnrSource {
        self.source
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms
    }

    fn apply(&mut self, raw_db: f32, now_ms: u64) {
        let corrected = raw_db - bias_correction(self.profile, self.modulation.estimator_bias_db(), self.rate_out_hz, self.sps);
        self.smoothed_db += 0.4 * (corrected - self.smoothed_db);
        self.missed_updates = 0;
        self.source = SnrSource::Direct;
        self.last_update_ms = now_ms;
    }

    /// Feeds a stale-window fallback estimate (constellation/eye-ring derived), blending it in
    /// at the reduced weight specified by §4.3 once the missed-update threshold is crossed.
    pub fn tick_without_direct_update(&mut self, fallback_db: Option<f32>, now_ms: u64) {
        self.missed_updates += 1;
        if self.missed_updates < self.modulation.stale_after_missed_updates() {
            return;
        }
        if let Some(fallback_db) = fallback_db {
            self.smoothed_db += 0.2 * (fallback_db - self.smoothed_db);
            self.source = SnrSource::Fallback;
            self.last_update_ms = now_ms;
        }
    }

    /// Updates from an FM-path demodulated block (C4FM: 4-level, GFSK: 2-level).
    pub fn update_fm(&mut self, block: &[f32], now_ms: u64) {
        let levels = match self.modulation {
            Modulation::C4fm => 4,
            Modulation::Gfsk => 2,
            Modulation::Qpsk => return,
        };
        let samples = symbol_center_samples(block, self.sps);
        if let Some(raw_db) = quartile_variance_ratio_db(samples, levels) {
            self.apply(raw_db, now_ms);
        }
        else {
            self.tick_without_direct_update(None, now_ms);
        }
    }

    /// Updates from a CQPSK constellation snapshot.
    pub fn update_qpsk(&mut self, symbols: &[Complex32], now_ms: u64) {
        if !matches!(self.modulation, Modulation::Qpsk) {
            return;
        }
        if let Some(raw_db) = qpsk_evm_ratio_db(symbols) {
            self.apply(raw_db, now_ms);
        }
        else {
            self.tick_without_direct_update(None, now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::{
        Modulation,
        SnrEstimator,
        SnrSource,
    };
    use crate::demod::channel_lpf::ChannelLpfProfile;

    #[test]
    fn clean_c4fm_block_reports_high_snr() {
        let mut est = SnrEstimator::new(Modulation::C4fm, ChannelLpfProfile::DigitalNarrow, 24_000.0, 5.0);
        // four well-separated, essentially noiseless clusters
        let mut block = Vec::new();
        for _ in 0..40 {
            block.extend_from_slice(&[0.0, 0.0, 0.0, 0.0, -0.9]);
        }
        for _ in 0..40 {
            block.extend_from_slice(&[0.0, 0.0, 0.0, 0.0, -0.3]);
        }
        for _ in 0..40 {
            block.extend_from_slice(&[0.0, 0.0, 0.0, 0.0, 0.3]);
        }
        for _ in 0..40 {
            block.extend_from_slice(&[0.0, 0.0, 0.0, 0.0, 0.9]);
        }
        est.update_fm(&block, 1000);
        assert_eq!(est.source(), SnrSource::Direct);
        assert!(est.smoothed_db() > 10.0);
    }

    #[test]
    fn stale_window_falls_back_after_threshold_misses() {
        let mut est = SnrEstimator::new(Modulation::Qpsk, ChannelLpfProfile::Op25Tdma, 48_000.0, 4.0);
        for _ in 0..9 {
            est.tick_without_direct_update(Some(5.0), 0);
        }
        assert_eq!(est.source(), SnrSource::Direct);
        est.tick_without_direct_update(Some(5.0), 1234);
        assert_eq!(est.source(), SnrSource::Fallback);
        assert_eq!(est.last_update_ms(), 1234);
    }

    #[test]
    fn qpsk_evm_prefers_better_fitting_rotation() {
        let mut est = SnrEstimator::new(Modulation::Qpsk, ChannelLpfProfile::Op25Fdma, 48_000.0, 4.0);
        let symbols: Vec<Complex32> = (0..64)
            .map(|i| {
                let base = match i % 4 {
                    0 => Complex32::new(1.0, 1.0),
                    1 => Complex32::new(1.0, -1.0),
                    2 => Complex32::new(-1.0, 1.0),
                    _ => Complex32::new(-1.0, -1.0),
                };
                base + Complex32::new(0.01, -0.01)
            })
            .collect();
        est.update_qpsk(&symbols, 500);
        assert_eq!(est.source(), SnrSource::Direct);
        assert!(est.smoothed_db() > 0.0);
    }
}
