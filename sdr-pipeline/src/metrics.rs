//! Metrics & Estimators (C6, §4.5): constellation/eye snapshot rings, the spectrum
//! power-spectral-density snapshot, and the atomic SNR/status surface read by the consumer API
//! and the Auto Controllers.
//!
//! These are one-writer-many-reader structures (the DSP worker is the sole writer during its own
//! block), so per §9's "Atomic SNR publication" note, numeric fields are plain relaxed atomics
//! rather than anything lock-based; the ring snapshots below use a `parking_lot::Mutex` around a
//! fixed-size `Vec` because a snapshot read copies a whole window at once, which a lock-free
//! design buys little for.

use std::sync::atomic::{
    AtomicBool,
    AtomicU32,
    AtomicU64,
    Ordering,
};

use num_complex::Complex32;
use parking_lot::Mutex;
use rustfft::{
    FftPlanner,
    num_complex::Complex as RustFftComplex,
};

use crate::snr::{
    Modulation,
    SnrEstimator,
    SnrSource,
};

/// A relaxed-ordering `f64` published by a single writer and read by many (§9 "Atomic SNR
/// publication"), stored bit-cast in an `AtomicU64`.
#[derive(Debug, Default)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub const fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Last-reported SNR figure for one modulation class, plus the bookkeeping the consumer API and
/// Auto Controllers need (§3 "Global atomics").
#[derive(Debug, Default)]
pub struct SnrStatus {
    db: AtomicF64,
    last_update_ms: AtomicU64,
    source_is_direct: AtomicBool,
}

impl SnrStatus {
    fn publish(&self, estimator: &SnrEstimator) {
        self.db.store(estimator.smoothed_db() as f64);
        self.last_update_ms.store(estimator.last_update_ms(), Ordering::Relaxed);
        self.source_is_direct
            .store(estimator.source() == SnrSource::Direct, Ordering::Relaxed);
    }

    pub fn db(&self) -> f64 {
        self.db.load()
    }

    pub fn last_update_ms(&self) -> u64 {
        self.last_update_ms.load(Ordering::Relaxed)
    }

    pub fn is_direct(&self) -> bool {
        self.source_is_direct.load(Ordering::Relaxed)
    }
}

/// One modulation class's full estimator plus its published atomic status.
pub struct SnrChannel {
    estimator: Mutex<SnrEstimator>,
    status: SnrStatus,
}

impl SnrChannel {
    fn new(modulation: Modulation, profile: crate::demod::channel_lpf::ChannelLpfProfile, rate_out_hz: f32, sps: f32) -> Self {
        Self {
            estimator: Mutex::new(SnrEstimator::new(modulation, profile, rate_out_hz, sps)),
            status: SnrStatus::default(),
        }
    }

    pub fn status(&self) -> &SnrStatus {
        &self.status
    }

    fn update_fm(&self, block: &[f32], now_ms: u64) {
        let mut est = self.estimator.lock();
        est.update_fm(block, now_ms);
        self.status.publish(&est);
    }

    fn update_qpsk(&self, symbols: &[Complex32], now_ms: u64) {
        let mut est = self.estimator.lock();
        est.update_qpsk(symbols, now_ms);
        self.status.publish(&est);
    }

    pub fn set_profile(&self, profile: crate::demod::channel_lpf::ChannelLpfProfile) {
        self.estimator.lock().set_profile(profile);
    }

    pub fn set_sps(&self, sps: f32) {
        self.estimator.lock().set_sps(sps);
    }
}

/// A fixed-capacity snapshot ring: each write overwrites the oldest entry once full; reads copy
/// the whole current window. Used for the constellation and eye rings (§4.5).
pub struct SnapshotRing<T> {
    buf: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T: Clone + Copy> SnapshotRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, item: T) {
        let mut buf = self.buf.lock();
        if buf.len() == self.capacity {
            buf.remove(0);
        }
        buf.push(item);
    }

    pub fn push_slice(&self, items: &[T]) {
        let mut buf = self.buf.lock();
        for &item in items {
            if buf.len() == self.capacity {
                buf.remove(0);
            }
            buf.push(item);
        }
    }

    /// Copies up to `max` of the most recent entries into `out`, returning the count copied.
    pub fn snapshot_into(&self, out: &mut Vec<T>, max: usize) -> usize {
        let buf = self.buf.lock();
        let n = buf.len().min(max);
        out.clear();
        out.extend_from_slice(&buf[buf.len() - n..]);
        n
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Power-spectral-density snapshot over the post-filter complex baseband (§4.5), recomputed once
/// per DSP block from a Hann-windowed FFT of the most recent `fft_len` samples.
pub struct SpectrumSnapshot {
    fft_len: usize,
    window: Vec<f32>,
    planner: Mutex<FftPlanner<f32>>,
    bins_db: Mutex<Vec<f32>>,
    rate_hz: AtomicU32,
}

impl SpectrumSnapshot {
    pub fn new(fft_len: usize) -> Self {
        let window: Vec<f32> = (0..fft_len)
            .map(|n| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * n as f32 / (fft_len.max(2) - 1) as f32).cos()
            })
            .collect();
        Self {
            fft_len,
            window,
            planner: Mutex::new(FftPlanner::new()),
            bins_db: Mutex::new(vec![-120.0; fft_len]),
            rate_hz: AtomicU32::new(0),
        }
    }

    pub fn fft_len(&self) -> usize {
        self.fft_len
    }

    /// Recomputes the PSD from `samples` (the most recent post-filter block) at `rate_hz`. If
    /// `samples` is shorter than `fft_len` it is zero-padded; if longer, only the trailing
    /// `fft_len` samples are used.
    pub fn update(&self, samples: &[Complex32], rate_hz: u32) {
        if self.fft_len == 0 {
            return;
        }
        self.rate_hz.store(rate_hz, Ordering::Relaxed);

        let mut buf = vec![RustFftComplex::new(0.0f32, 0.0f32); self.fft_len];
        let start = samples.len().saturating_sub(self.fft_len);
        for (i, &sample) in samples[start..].iter().enumerate() {
            let window_idx = i + (self.fft_len - (samples.len() - start));
            let w = self.window.get(window_idx).copied().unwrap_or(1.0);
            buf[i] = RustFftComplex::new(sample.re * w, sample.im * w);
        }

        let fft = self.planner.lock().plan_fft_forward(self.fft_len);
        fft.process(&mut buf);

        let mut bins = self.bins_db.lock();
        bins.clear();
        // fftshift so index 0 is the most negative frequency and the center bin is DC.
        let half = self.fft_len / 2;
        for bin in buf[half..].iter().chain(buf[..half].iter()) {
            let power = bin.norm_sqr() / (self.fft_len as f32).powi(2);
            bins.push(10.0 * (power.max(1e-20)).log10());
        }
    }

    /// Copies up to `max_bins` dB values into `out`, returning `(count, rate_hz)` (§6
    /// `spectrum_get`).
    pub fn get(&self, out: &mut Vec<f32>, max_bins: usize) -> (usize, u32) {
        let bins = self.bins_db.lock();
        let n = bins.len().min(max_bins);
        out.clear();
        out.extend_from_slice(&bins[..n]);
        (n, self.rate_hz.load(Ordering::Relaxed))
    }

    /// Finds the bin with the largest magnitude within `±window` bins of the center, returning
    /// `(bin_index, db)`. Used by the Auto-PPM trainer (§4.6.2 step 2).
    pub fn peak_near_center(&self, window: usize) -> Option<(usize, f32)> {
        let bins = self.bins_db.lock();
        if bins.is_empty() {
            return None;
        }
        let center = bins.len() / 2;
        let lo = center.saturating_sub(window);
        let hi = (center + window).min(bins.len() - 1);
        bins[lo..=hi]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, &db)| (lo + i, db))
    }

    /// dB value of one bin, or `f32::NEG_INFINITY` if out of range.
    pub fn bin_db(&self, index: usize) -> f32 {
        self.bins_db.lock().get(index).copied().unwrap_or(f32::NEG_INFINITY)
    }

    pub fn len(&self) -> usize {
        self.bins_db.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Median bin power in dB, used as a noise-floor estimate for spectral-SNR gates (§4.6.1
    /// up-step gate, §4.6.2 step 2) since it is robust to a single strong in-band carrier.
    pub fn median_db(&self) -> f32 {
        let mut bins = self.bins_db.lock().clone();
        if bins.is_empty() {
            return f32::NEG_INFINITY;
        }
        bins.sort_by(|a, b| a.partial_cmp(b).unwrap());
        bins[bins.len() / 2]
    }

    /// Total in-band power ratio within `±N/fraction` bins of center vs. the whole window, in
    /// linear (not dB) terms (§4.6.1 up-step spectral gate's "central-band power ratio").
    pub fn central_band_power_ratio(&self, fraction: usize) -> f32 {
        let bins = self.bins_db.lock();
        if bins.is_empty() || fraction == 0 {
            return 0.0;
        }
        let center = bins.len() / 2;
        let half_band = (bins.len() / fraction).max(1);
        let lo = center.saturating_sub(half_band);
        let hi = (center + half_band).min(bins.len() - 1);
        let to_linear = |db: f32| 10f32.powf(db / 10.0);
        let band: f32 = bins[lo..=hi].iter().copied().map(to_linear).sum();
        let total: f32 = bins.iter().copied().map(to_linear).sum();
        if total <= 0.0 { 0.0 } else { band / total }
    }
}

/// All metrics state for one open stream (§4.5). Owned by the `Stream`, written by the DSP
/// worker during `full_demod`, read by the consumer API and the Auto Controllers.
pub struct Metrics {
    pub constellation: SnapshotRing<(f32, f32)>,
    pub eye: SnapshotRing<f32>,
    pub spectrum: SpectrumSnapshot,
    pub c4fm: SnrChannel,
    pub gfsk: SnrChannel,
    pub qpsk: SnrChannel,
    channel_power: AtomicF64,
    peak_iq: AtomicF64,
    mean_iq: AtomicF64,
}

impl Metrics {
    pub const CONSTELLATION_CAPACITY: usize = 8192;
    pub const EYE_CAPACITY: usize = 16384;

    pub fn new(profile: crate::demod::channel_lpf::ChannelLpfProfile, rate_out_hz: f32, sps: f32, fft_len: usize) -> Self {
        Self {
            constellation: SnapshotRing::new(Self::CONSTELLATION_CAPACITY),
            eye: SnapshotRing::new(Self::EYE_CAPACITY),
            spectrum: SpectrumSnapshot::new(fft_len),
            c4fm: SnrChannel::new(Modulation::C4fm, profile, rate_out_hz, sps),
            gfsk: SnrChannel::new(Modulation::Gfsk, profile, rate_out_hz, sps),
            qpsk: SnrChannel::new(Modulation::Qpsk, profile, rate_out_hz, sps),
            channel_power: AtomicF64::default(),
            peak_iq: AtomicF64::default(),
            mean_iq: AtomicF64::default(),
        }
    }

    /// Raw-input peak `max(|I|,|Q|)` from the most recently observed block (§4.6.1).
    pub fn peak_iq(&self) -> f32 {
        self.peak_iq.load() as f32
    }

    /// Raw-input mean `|I|,|Q|` from the most recently observed block (§4.6.1).
    pub fn mean_iq(&self) -> f32 {
        self.mean_iq.load() as f32
    }

    pub fn set_profile(&self, profile: crate::demod::channel_lpf::ChannelLpfProfile) {
        self.c4fm.set_profile(profile);
        self.gfsk.set_profile(profile);
        self.qpsk.set_profile(profile);
    }

    pub fn set_sps(&self, sps: f32) {
        self.c4fm.set_sps(sps);
        self.gfsk.set_sps(sps);
        self.qpsk.set_sps(sps);
    }

    pub fn return_pwr(&self) -> f64 {
        self.channel_power.load()
    }

    /// Folds one block's post-`full_demod` observations into the constellation/eye rings, the
    /// spectrum snapshot, and the per-modulation SNR estimators (§4.3 DSP-worker loop's "update
    /// estimators" step).
    #[allow(clippy::too_many_arguments)]
    pub fn observe_block(
        &self,
        channel_samples: &[Complex32],
        symbols: &[Complex32],
        fm_audio: &[f32],
        sps: f32,
        rate_hz: u32,
        channel_power: f32,
        peak_iq: f32,
        mean_iq: f32,
        now_ms: u64,
    ) {
        self.channel_power.store(channel_power as f64);
        self.peak_iq.store(peak_iq as f64);
        self.mean_iq.store(mean_iq as f64);
        self.spectrum.update(channel_samples, rate_hz);

        if !symbols.is_empty() {
            let stride = sps.max(1.0) as usize;
            for (i, sym) in symbols.iter().enumerate() {
                if i % stride.max(1) == 0 {
                    self.constellation.push((sym.re, sym.im));
                }
            }
            for sym in channel_samples.iter().step_by(stride.max(1)) {
                self.eye.push(sym.re);
            }
            self.qpsk.update_qpsk(symbols, now_ms);
            self.c4fm.estimator.lock().tick_without_direct_update(None, now_ms);
            self.gfsk.estimator.lock().tick_without_direct_update(None, now_ms);
        }
        else if !fm_audio.is_empty() {
            for &sample in channel_samples.iter().step_by((sps.max(1.0) as usize).max(1)) {
                self.eye.push(sample.re);
            }
            self.c4fm.update_fm(fm_audio, now_ms);
            self.gfsk.update_fm(fm_audio, now_ms);
            self.qpsk.estimator.lock().tick_without_direct_update(None, now_ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AtomicF64,
        SnapshotRing,
        SpectrumSnapshot,
    };

    #[test]
    fn atomic_f64_round_trips() {
        let a = AtomicF64::new(12.5);
        assert_eq!(a.load(), 12.5);
        a.store(-3.0);
        assert_eq!(a.load(), -3.0);
    }

    #[test]
    fn snapshot_ring_drops_oldest_past_capacity() {
        let ring: SnapshotRing<i32> = SnapshotRing::new(4);
        for i in 0..6 {
            ring.push(i);
        }
        let mut out = Vec::new();
        let n = ring.snapshot_into(&mut out, 10);
        assert_eq!(n, 4);
        assert_eq!(out, vec![2, 3, 4, 5]);
    }

    #[test]
    fn spectrum_tone_peaks_off_center() {
        use num_complex::Complex32;
        let spectrum = SpectrumSnapshot::new(256);
        let tone: Vec<Complex32> = (0..256)
            .map(|n| {
                let theta = 2.0 * std::f32::consts::PI * 0.2 * n as f32;
                Complex32::new(theta.cos(), theta.sin())
            })
            .collect();
        spectrum.update(&tone, 48_000);
        let (bin, _db) = spectrum.peak_near_center(128).unwrap();
        // a tone at +0.2*fs should land away from the DC/center bin
        assert_ne!(bin, 128);
    }
}
