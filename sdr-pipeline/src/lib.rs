//! `sdr-pipeline`: the streaming/demodulation engine that sits behind an `rtlsdr_async::Backend`
//! (§1 OVERVIEW). [`Stream::open`] wires together the Input/Output Rings (C2/C4), the DSP
//! Pipeline worker (C3), the Controller (C5), Metrics & Estimators (C6), the supervisory Auto
//! Controllers (C7), and the optional UDP External Control Surface (C8) behind the single
//! consumer read API described in §6, following the "single `Stream` owner" design note in §9.

pub mod config;
pub mod demod;
pub mod metrics;
pub mod snr;

mod auto_ppm;
mod autogain;
mod control_surface;
mod controller;
mod ingest;
mod ring;
mod worker;

use std::{
    sync::Arc,
    thread,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::Mutex;
use rtlsdr_async::Backend;
use tokio_util::sync::CancellationToken;

pub use auto_ppm::AutoPpmStatus;
pub use controller::{
    ControllerState,
    TuneResult,
};

use config::StreamConfig;
use controller::{
    Controller,
    ControllerHandle,
    Gates,
};
use demod::{
    DemodConfig,
    DemodState,
    resampler::Resampler,
};
use ingest::IngestStats;
use metrics::Metrics;
use ring::{
    InputRing,
    OutputRing,
};

/// Errors that can prevent a stream from opening at all (§7 error kinds 1-3). Once a stream is
/// open, everything else is surfaced as a `tracing` event plus a counter (§7 kinds 4-7) rather
/// than an `Err` — see [`Stream::diagnostics`].
#[derive(Debug, thiserror::Error)]
pub enum Error<E: std::error::Error + 'static> {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("resource error: {0}")]
    Resource(String),
    #[error(transparent)]
    Device(#[from] E),
}

/// Open-time configuration checks (§7 error kind 1): an empty or oversized channel list, or
/// scanning across multiple channels with squelch disabled (hopping would never stop).
fn validate_config(config: &StreamConfig) -> Result<(), String> {
    if config.frequencies_hz.is_empty() {
        return Err("no frequencies configured".to_string());
    }
    if config.frequencies_hz.len() > 1000 {
        return Err(format!(
            "too many channels configured ({}, max 1000)",
            config.frequencies_hz.len()
        ));
    }
    if config.frequencies_hz.len() > 1 && config.squelch_threshold <= 0.0 {
        return Err("scanning across multiple channels requires a channel squelch threshold".to_string());
    }
    if config.input_ring_capacity == 0 || config.output_ring_capacity == 0 {
        return Err("ring capacities must be non-zero".to_string());
    }
    Ok(())
}

/// Snapshot of the transient-failure counters described in §7 kinds 4-7: driver read errors,
/// producer-side ring drops on overflow, and consumer-side read timeouts. None of these ever
/// surface as an `Err` from the consumer read API; they are read through this struct instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct Diagnostics {
    pub ingest_blocks_received: u64,
    pub ingest_read_errors: u64,
    pub input_ring_producer_drops: usize,
    pub input_ring_read_timeouts: usize,
    pub output_ring_producer_drops: usize,
    pub output_ring_read_timeouts: usize,
}

/// Owns one open stream end to end: the device adapter handle, the Input/Output Rings, the DSP
/// worker thread (T2), the Controller thread (T3), the io thread running ingest (T1) and the
/// optional UDP control surface (T4), and the Metrics/Auto-Controller state they all share.
///
/// Not `Clone` — `close`/`Drop` join the background threads, so there is exactly one owner.
pub struct Stream {
    config: Arc<StreamConfig>,
    demod: Arc<Mutex<DemodState>>,
    metrics: Arc<Metrics>,
    input_ring: Arc<InputRing>,
    output_ring: Arc<OutputRing>,
    controller: ControllerHandle,
    ingest_stats: Arc<IngestStats>,
    shutdown: CancellationToken,
    controller_thread: Option<thread::JoinHandle<()>>,
    worker_thread: Option<thread::JoinHandle<()>>,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl Stream {
    /// Opens a stream against `backend`: validates `config`, builds the DSP state and shared
    /// rings, then spawns the Controller thread (which runs Cold-Start synchronously and returns
    /// any device-open failure as [`Error::Device`] before this call returns), the DSP worker
    /// thread, and an io thread running the ingest loop plus the optional UDP control surface
    /// (§4.1, §4.7, §5).
    pub fn open<B: Backend + 'static>(backend: Arc<B>, config: StreamConfig) -> Result<Self, Error<B::Error>> {
        validate_config(&config).map_err(Error::Configuration)?;

        let (downsample_passes, capture_rate_hz) = config.downsample_passes();
        let decimated_rate_hz = capture_rate_hz as f32 / (1u32 << downsample_passes) as f32;
        let effective_sps = config.ted_sps_override.unwrap_or(config.ted_sps);

        let demod_config = DemodConfig {
            iq_dc_shift: config.iq_dc_shift,
            dc_block_enabled: config.dc_block_enabled,
            downsample_passes,
            decimated_rate_hz,
            channel_lpf_profile: config.channel_lpf_profile,
            fm_agc_target_rms: config.fm_agc_target_rms,
            fm_agc_min_rms: config.fm_agc_min_rms,
            fm_agc_alpha_up: config.fm_agc_alpha_up,
            fm_agc_alpha_down: config.fm_agc_alpha_down,
            fll_alpha: config.fll_alpha,
            fll_beta: config.fll_beta,
            gardner_sps: effective_sps as f32,
            gardner_gain: config.gardner_gain,
            costas_alpha: config.costas_alpha,
            costas_beta: config.costas_beta,
            deemphasis_tau_us: config.deemphasis_tau_us,
            audio_lpf_cutoff_hz: config.audio_lpf_cutoff_hz,
            audio_lpf_enabled: config.audio_lpf_enabled,
            rate_out_hz: config.rate_out_hz,
            squelch_threshold: config.squelch_threshold,
            conseq_squelch: config.conseq_squelch,
            cqpsk_enabled: config.cqpsk_enabled,
            symbol_timing_enabled: config.symbol_timing_enabled,
        };

        let demod = Arc::new(Mutex::new(DemodState::new(&demod_config)));
        let metrics = Arc::new(Metrics::new(
            config.channel_lpf_profile,
            config.rate_out_hz as f32,
            effective_sps as f32,
            config.spectrum_fft_len,
        ));
        let input_ring = Arc::new(InputRing::new(config.input_ring_capacity));
        let output_ring = Arc::new(OutputRing::new(config.output_ring_capacity));
        let gates = Arc::new(Gates::default());
        let config = Arc::new(config);
        let mute_rearm = Arc::new(ingest::MuteRearm::default());
        let mute_samples = ingest::retune_mute_samples(capture_rate_hz);

        let (controller, controller_handle) = Controller::new(
            backend.clone(),
            config.clone(),
            demod.clone(),
            metrics.clone(),
            input_ring.clone(),
            output_ring.clone(),
            gates.clone(),
            mute_rearm.clone(),
            mute_samples,
        );

        // Blocks until Cold-Start completes, so a device-open failure is reported synchronously
        // rather than discovered later on the DSP worker's first read (§7 error kind 3).
        let controller_thread = controller.spawn()?;

        let worker_thread = {
            let input_ring = input_ring.clone();
            let output_ring = output_ring.clone();
            let demod = demod.clone();
            let metrics = metrics.clone();
            let controller_handle = controller_handle.clone();
            let gates = gates.clone();
            let rate_out_hz = config.rate_out_hz;
            let started_at = Instant::now();
            thread::Builder::new()
                .name("sdr-dsp-worker".to_string())
                .spawn(move || {
                    worker::run(
                        input_ring,
                        output_ring,
                        demod,
                        metrics,
                        controller_handle,
                        gates,
                        rate_out_hz,
                        move || started_at.elapsed().as_millis() as u64,
                    );
                })
                .map_err(|error| Error::Resource(format!("failed to spawn DSP worker thread: {error}")))?
        };

        let ingest_stats = Arc::new(IngestStats::default());
        let shutdown = CancellationToken::new();

        let io_thread = {
            let backend = backend.clone();
            let input_ring = input_ring.clone();
            let rotate_enabled = config.fs4_shift_enabled && config.combine_rotate;
            let mute_rearm = mute_rearm.clone();
            let ingest_stats = ingest_stats.clone();
            let shutdown = shutdown.clone();
            let control_surface_addr = config.control_surface_addr;
            let controller_handle = controller_handle.clone();
            thread::Builder::new()
                .name("sdr-io".to_string())
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed to build io runtime");
                    runtime.block_on(async move {
                        let ingest_shutdown = shutdown.clone();
                        let ingest =
                            ingest::run(backend, input_ring, rotate_enabled, mute_samples, mute_rearm, ingest_stats, ingest_shutdown);
                        match control_surface_addr {
                            Some(bind_addr) => {
                                let control = control_surface::serve(bind_addr, controller_handle, shutdown);
                                tokio::select! {
                                    _ = ingest => {}
                                    result = control => {
                                        if let Err(error) = result {
                                            tracing::warn!(?error, "external control surface exited");
                                        }
                                    }
                                }
                            }
                            None => ingest.await,
                        }
                    });
                })
                .map_err(|error| Error::Resource(format!("failed to spawn io thread: {error}")))?
        };

        Ok(Self {
            config,
            demod,
            metrics,
            input_ring,
            output_ring,
            controller: controller_handle,
            ingest_stats,
            shutdown,
            controller_thread: Some(controller_thread),
            worker_thread: Some(worker_thread),
            io_thread: Some(io_thread),
        })
    }

    /// Stops ingest/DSP/Controller and joins their threads (§6 `close`). Idempotent; `Drop` calls
    /// this too, so an explicit call is only needed when the caller wants to block until shutdown
    /// completes.
    pub fn close(&mut self) {
        self.controller.shutdown();
        self.shutdown.cancel();
        if let Some(handle) = self.controller_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }

    /// Same shutdown sequence as [`Stream::close`], returning a status code instead of unit for
    /// callers mirroring the reference binary's `soft_stop() -> int` surface (§6). `0` means a
    /// clean shutdown; this implementation has no failure path worth distinguishing.
    pub fn soft_stop(&mut self) -> i32 {
        self.close();
        0
    }

    /// Reads up to `n` demodulated `f32`s into `buf`, blocking up to `timeout` for the first one
    /// to arrive (§6 `read`). FM channels yield one sample per audio sample; a CQPSK channel
    /// yields interleaved I/Q pairs, so `n` should stay even while [`Stream::cqpsk_enabled`].
    pub fn read(&self, buf: &mut Vec<f32>, n: usize, timeout: Duration) -> usize {
        self.output_ring.read_block(buf, n, timeout)
    }

    /// Enqueues a retune to `frequency_hz` (§6 `tune`). Coalesces with any retune already
    /// pending; returns [`TuneResult::Deferred`] instead of touching the mailbox while the
    /// Auto-PPM trainer holds the retune-deferral freeze (§4.4 "Retune deferral").
    pub fn tune(&self, frequency_hz: u32) -> TuneResult {
        self.controller.enqueue_retune(frequency_hz)
    }

    pub fn output_rate(&self) -> u32 {
        self.config.rate_out_hz
    }

    /// Most recent channel power in dB, as observed by the last processed block (§6
    /// `return_pwr`).
    pub fn return_pwr(&self) -> f64 {
        self.metrics.return_pwr()
    }

    pub fn set_channel_squelch(&self, level: f32) {
        self.demod.lock().squelch.set_threshold(level);
    }

    /// Discards any demodulated output not yet read by the consumer (§6 `clear_output`).
    pub fn clear_output(&self) {
        self.output_ring.clear();
    }

    // --- DSP toggles (§6 "Demod state mutators") ---------------------------------------------

    pub fn set_cqpsk_enabled(&self, enabled: bool) {
        self.demod.lock().cqpsk_enabled = enabled;
    }

    pub fn cqpsk_enabled(&self) -> bool {
        self.demod.lock().cqpsk_enabled
    }

    pub fn set_symbol_timing_enabled(&self, enabled: bool) {
        self.demod.lock().symbol_timing_enabled = enabled;
    }

    pub fn symbol_timing_enabled(&self) -> bool {
        self.demod.lock().symbol_timing_enabled
    }

    pub fn set_fll_enabled(&self, enabled: bool) {
        self.demod.lock().fll.set_enabled(enabled);
    }

    pub fn set_ted_enabled(&self, enabled: bool) {
        self.demod.lock().gardner.set_enabled(enabled);
    }

    pub fn set_ted_force(&self, force: bool) {
        self.demod.lock().gardner.set_force(force);
    }

    pub fn ted_gain(&self) -> f32 {
        self.demod.lock().gardner.e_ema()
    }

    pub fn ted_sps(&self) -> f32 {
        self.demod.lock().gardner.sps()
    }

    /// Sets the base TED samples-per-symbol (§6 "TED SPS without override"). Routed through the
    /// Controller's own mailbox-of-one so the change is applied (and `costas_reset_pending`
    /// tracked) on the Controller thread rather than racing the DSP worker.
    pub fn set_ted_sps(&self, sps: u32) {
        self.controller.set_ted_sps(sps);
    }

    /// Sets or clears (`None`) the TED samples-per-symbol override (§6 "TED SPS with override").
    pub fn set_ted_sps_override(&self, sps: Option<u32>) {
        self.controller.set_ted_sps_override(sps);
    }

    pub fn set_fm_agc_enabled(&self, enabled: bool) {
        self.demod.lock().fm_agc.set_enabled(enabled);
    }

    pub fn set_fm_limiter_enabled(&self, enabled: bool) {
        self.demod.lock().fm_agc.set_limiter_enabled(enabled);
    }

    pub fn fm_agc_gain(&self) -> f32 {
        self.demod.lock().fm_agc.gain()
    }

    pub fn set_iq_dc_enabled(&self, enabled: bool) {
        self.demod.lock().dc_blocker.set_enabled(enabled);
    }

    pub fn set_iq_dc_shift(&self, shift: u32) {
        self.demod.lock().dc_blocker.set_shift(shift);
    }

    pub fn set_iq_balance_enabled(&self, enabled: bool) {
        self.demod.lock().iq_balance.set_enabled(enabled);
    }

    pub fn set_iq_balance_trim(&self, gain_correction: f32, phase_correction_rad: f32) {
        self.demod.lock().iq_balance.set_trim(gain_correction, phase_correction_rad);
    }

    /// Redesigns the polyphase resampler for a new output rate (§6 "resampler target rate");
    /// `None` disables resampling and leaves the DSP chain at its internal decimated rate.
    pub fn set_resampler_target_rate(&self, rate_out_hz: Option<u32>) {
        let mut demod = self.demod.lock();
        let decimated_rate_hz = demod.decimated_rate_hz() as u32;
        demod.resampler = rate_out_hz.and_then(|rate| Resampler::design(decimated_rate_hz, rate));
    }

    pub fn set_resampler_enabled(&self, enabled: bool) {
        if let Some(resampler) = self.demod.lock().resampler.as_mut() {
            resampler.set_enabled(enabled);
        }
    }

    /// rtl_tcp-variant prebuffer duration (§4.1 TCP variant); read by the binary's TCP front end,
    /// not consumed internally.
    pub fn tcp_prebuffer(&self) -> Option<Duration> {
        self.config.tcp_prebuffer
    }

    pub fn tcp_autotune(&self) -> bool {
        self.config.tcp_autotune
    }

    // --- Snapshot APIs (§4.5, §6) --------------------------------------------------------------

    pub fn constellation_get(&self, out: &mut Vec<(f32, f32)>, max: usize) -> usize {
        self.metrics.constellation.snapshot_into(out, max)
    }

    pub fn eye_get(&self, out: &mut Vec<f32>, max: usize) -> usize {
        self.metrics.eye.snapshot_into(out, max)
    }

    /// Copies up to `max_bins` PSD values (dB) into `out`, returning `(count, rate_hz)` (§6
    /// `spectrum_get`).
    pub fn spectrum_get(&self, out: &mut Vec<f32>, max_bins: usize) -> (usize, u32) {
        self.metrics.spectrum.get(out, max_bins)
    }

    // --- Auto Controllers (§4.6, §6) -----------------------------------------------------------

    pub fn set_autogain_enabled(&self, enabled: bool) {
        self.controller.set_autogain_enabled(enabled);
    }

    pub fn autogain_enabled(&self) -> bool {
        self.controller.autogain_enabled()
    }

    pub fn current_gain_db(&self) -> f32 {
        self.controller.autogain_current_gain_db()
    }

    pub fn set_auto_ppm_enabled(&self, enabled: bool) {
        self.controller.set_auto_ppm_enabled(enabled);
    }

    pub fn auto_ppm_enabled(&self) -> bool {
        self.controller.auto_ppm_enabled()
    }

    pub fn auto_ppm_get_status(&self) -> AutoPpmStatus {
        self.controller.auto_ppm_status()
    }

    pub fn auto_ppm_training_active(&self) -> bool {
        self.auto_ppm_get_status().training_active
    }

    /// Transient-failure counters (§7 kinds 4-7), aggregated from the ingest loop and both rings.
    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            ingest_blocks_received: self.ingest_stats.blocks_received.load(std::sync::atomic::Ordering::Relaxed),
            ingest_read_errors: self.ingest_stats.read_errors.load(std::sync::atomic::Ordering::Relaxed),
            input_ring_producer_drops: self.input_ring.producer_drops(),
            input_ring_read_timeouts: self.input_ring.read_timeouts(),
            output_ring_producer_drops: self.output_ring.producer_drops(),
            output_ring_read_timeouts: self.output_ring.read_timeouts(),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::validate_config;
    use crate::config::StreamConfig;

    #[test]
    fn rejects_an_empty_channel_list() {
        let config = StreamConfig::default();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_scanning_without_squelch() {
        let mut config = StreamConfig {
            frequencies_hz: vec![100_000_000, 101_000_000],
            ..StreamConfig::default()
        };
        config.squelch_threshold = 0.0;
        assert!(validate_config(&config).is_err());

        config.squelch_threshold = 0.01;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn accepts_a_single_channel_with_no_squelch() {
        let config = StreamConfig {
            frequencies_hz: vec![162_475_000],
            ..StreamConfig::default()
        };
        assert!(validate_config(&config).is_ok());
    }
}
