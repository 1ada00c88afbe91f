//! Controller (C5, §4.4): the tuner retune/hop state machine.
//!
//! Runs on its own thread (T3 in §5). Callers (the consumer read API, the UDP External Control
//! Surface, and the supervisory Auto Controllers) never touch the device or `DemodState`
//! directly; they go through a [`ControllerHandle`], a cheap-to-clone mailbox-of-one (§9
//! "Coroutine-like control flow") that coalesces retune requests and wakes the Controller's own
//! condvar-wait loop.
//!
//! Per the implementation note in §5, the Controller's loop body is a plain blocking
//! `parking_lot::Condvar` wait, but device programming itself is `async` (the `Backend` trait):
//! the Controller thread owns a small dedicated current-thread `tokio` runtime purely so it can
//! `block_on` those calls without requiring every other component to be async.

use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            AtomicU32,
            Ordering,
        },
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

use parking_lot::{
    Condvar,
    Mutex,
};
use rtlsdr_async::{
    Backend,
    Gain,
};
use tracing::Instrument;

use crate::{
    auto_ppm::{
        AutoPpm,
        AutoPpmStatus,
    },
    autogain::{
        Autogain,
        AutogainAction,
    },
    config::StreamConfig,
    demod::{
        DemodState,
        channel_lpf::ChannelLpfProfile,
        halfband::choose_downsample_passes,
    },
    metrics::Metrics,
    ring::{
        InputRing,
        OutputRing,
    },
};

/// How often the Controller's idle wait wakes up to tick the Auto Controllers when nothing else
/// is pending (§4.6 "ticked once per retune-CV wakeup or a bounded poll interval when idle").
const AUTO_CONTROLLER_POLL: Duration = Duration::from_millis(200);

/// The gates the DSP worker polls on every loop iteration (§5 "Ordering guarantees").
#[derive(Debug, Default)]
pub struct Gates {
    pub cold_start_ready: AtomicBool,
    pub retune_in_progress: AtomicBool,
    pub should_exit: AtomicBool,
}

/// A mailbox-of-one pending retune request: at most one target frequency is remembered between
/// Controller wakeups, coalescing bursts of requests into the most recent one (§9).
#[derive(Debug, Default)]
struct PendingRetune {
    target_hz: AtomicU32,
    pending: AtomicBool,
}

impl PendingRetune {
    fn set(&self, freq_hz: u32) {
        self.target_hz.store(freq_hz, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<u32> {
        if self.pending.swap(false, Ordering::Acquire) {
            Some(self.target_hz.load(Ordering::Relaxed))
        }
        else {
            None
        }
    }
}

/// Controller states (§4.4). `ControllerHandle` callers never see this directly; it is internal
/// bookkeeping for the Controller's own thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    ColdStart,
    Steady,
    Retuning,
    Hopping,
    Exiting,
}

/// Result of a [`ControllerHandle::tune`] call (§6 `tune(options, frequency_hz) → 0 | deferred`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneResult {
    Accepted,
    /// The Auto-PPM trainer is actively training and `freeze_on_train` is set (§4.4 "Retune
    /// deferral").
    Deferred,
}

/// Thread-safe handle to a running Controller. Cheaply cloneable; every clone shares the same
/// mailbox and hop condvar.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<Shared>,
}

struct Shared {
    pending: PendingRetune,
    hop_requested: AtomicBool,
    training_freeze: AtomicBool,
    hop_lock: Mutex<()>,
    hop_cv: Condvar,
    gates: Arc<Gates>,

    /// Mailbox-of-one for the consumer API's "TED SPS without override" setter.
    ted_sps_pending: AtomicBool,
    ted_sps_value: AtomicU32,
    /// Mailbox-of-one for the consumer API's "TED SPS with override" setter. `_is_some` tags
    /// whether the pending value is `Some` or a request to clear back to `None`.
    ted_sps_override_pending: AtomicBool,
    ted_sps_override_is_some: AtomicBool,
    ted_sps_override_value: AtomicU32,

    /// Mailbox-of-one for the consumer API's autogain enable/disable toggle, plus the published
    /// enabled flag and current gain (§6 `autogain_enabled`/`current_gain_db`) the Controller
    /// thread refreshes once per `tick_auto_controllers` call.
    autogain_enabled_pending: AtomicBool,
    autogain_enabled_value: AtomicBool,
    autogain_enabled_published: AtomicBool,
    current_gain_db_bits: AtomicU32,

    /// Same shape for the Auto-PPM trainer's enable/disable toggle and published status (§6
    /// `auto_ppm_get_status`).
    auto_ppm_enabled_pending: AtomicBool,
    auto_ppm_enabled_value: AtomicBool,
    auto_ppm_enabled_published: AtomicBool,
    auto_ppm_status: Mutex<AutoPpmStatus>,
}

impl ControllerHandle {
    /// Enqueues a retune request (§4.4 `enqueue_retune`). Returns [`TuneResult::Deferred`]
    /// without touching the mailbox if the Auto-PPM trainer currently has the freeze asserted.
    pub fn enqueue_retune(&self, freq_hz: u32) -> TuneResult {
        if self.inner.training_freeze.load(Ordering::Acquire) {
            return TuneResult::Deferred;
        }
        self.inner.pending.set(freq_hz);
        self.wake();
        TuneResult::Accepted
    }

    /// Signaled by the DSP worker when squelch has been below threshold for more than
    /// `conseq_squelch` consecutive blocks (§4.3 stage 11).
    pub fn request_hop(&self) {
        self.inner.hop_requested.store(true, Ordering::Release);
        self.wake();
    }

    pub fn shutdown(&self) {
        self.inner.gates.should_exit.store(true, Ordering::Release);
        self.wake();
    }

    fn wake(&self) {
        let _guard = self.inner.hop_lock.lock();
        self.inner.hop_cv.notify_one();
    }

    pub(crate) fn set_training_freeze(&self, freeze: bool) {
        self.inner.training_freeze.store(freeze, Ordering::Release);
    }

    /// Consumer-API setter for the base TED samples-per-symbol (§6 "TED SPS without override").
    /// Applied by the Controller thread on its next wakeup, same mailbox-of-one shape as
    /// `enqueue_retune`.
    pub fn set_ted_sps(&self, sps: u32) {
        self.inner.ted_sps_value.store(sps, Ordering::Relaxed);
        self.inner.ted_sps_pending.store(true, Ordering::Release);
        self.wake();
    }

    /// Consumer-API setter for the TED samples-per-symbol override (§6 "TED SPS with override"),
    /// `None` clears back to the base `ted_sps`.
    pub fn set_ted_sps_override(&self, sps: Option<u32>) {
        match sps {
            Some(value) => {
                self.inner.ted_sps_override_value.store(value, Ordering::Relaxed);
                self.inner.ted_sps_override_is_some.store(true, Ordering::Relaxed);
            }
            None => self.inner.ted_sps_override_is_some.store(false, Ordering::Relaxed),
        }
        self.inner.ted_sps_override_pending.store(true, Ordering::Release);
        self.wake();
    }

    /// Consumer-API enable/disable toggle for the supervisory tuner-autogain (§6
    /// `autogain_enabled`).
    pub fn set_autogain_enabled(&self, enabled: bool) {
        self.inner.autogain_enabled_value.store(enabled, Ordering::Relaxed);
        self.inner.autogain_enabled_pending.store(true, Ordering::Release);
        self.wake();
    }

    pub fn autogain_enabled(&self) -> bool {
        self.inner.autogain_enabled_published.load(Ordering::Relaxed)
    }

    pub fn autogain_current_gain_db(&self) -> f32 {
        f32::from_bits(self.inner.current_gain_db_bits.load(Ordering::Relaxed))
    }

    /// Consumer-API enable/disable toggle for the Auto-PPM trainer (§6 `auto_ppm_enabled`).
    pub fn set_auto_ppm_enabled(&self, enabled: bool) {
        self.inner.auto_ppm_enabled_value.store(enabled, Ordering::Relaxed);
        self.inner.auto_ppm_enabled_pending.store(true, Ordering::Release);
        self.wake();
    }

    pub fn auto_ppm_enabled(&self) -> bool {
        self.inner.auto_ppm_enabled_published.load(Ordering::Relaxed)
    }

    pub fn auto_ppm_status(&self) -> AutoPpmStatus {
        *self.inner.auto_ppm_status.lock()
    }
}

/// Picks capture settings for a target channel: the post-cascade decimated rate is held at
/// `config.rate_out_hz`'s DSP baseband, and the hardware capture rate is `rate_out_hz * 2^passes`
/// rounded to the nearest RTL2832U clock anchor (§4.3 stage 2, §4.4 Cold-Start).
pub struct CaptureSettings {
    pub capture_rate_hz: u32,
    pub downsample_passes: usize,
}

fn compute_capture_settings(config: &StreamConfig) -> CaptureSettings {
    let (passes, anchor) = choose_downsample_passes(config.rate_out_hz.max(1), 10);
    CaptureSettings {
        capture_rate_hz: anchor,
        downsample_passes: passes,
    }
}

/// Owns the device-programming side of one open stream. Not `Clone`; callers interact through
/// [`ControllerHandle`] instead.
pub struct Controller<B: Backend> {
    backend: Arc<B>,
    config: Arc<StreamConfig>,
    demod: Arc<Mutex<DemodState>>,
    metrics: Arc<Metrics>,
    input_ring: Arc<InputRing>,
    output_ring: Arc<OutputRing>,
    shared: Arc<Shared>,
    gates: Arc<Gates>,
    mute_rearm: Arc<crate::ingest::MuteRearm>,
    mute_samples: usize,

    state: ControllerState,
    freq_now: usize,
    /// Set when an SPS change (override applied or cleared) means the next retune's Costas reset
    /// must be forced even on an otherwise-ordinary channel, per §4.4 step 4 / §9's "costas_reset_pending"
    /// Open Question, resolved in `DESIGN.md`: both `set_ted_sps_override` and
    /// `clear_ted_sps_override` raise this flag whenever the *effective* SPS actually changes; it
    /// is consumed (cleared) by the next `reset_on_retune` call regardless of outcome.
    costas_reset_pending: bool,
    ted_sps: u32,
    ted_sps_override: Option<u32>,

    autogain: Autogain,
    auto_ppm: AutoPpm,
    started_at: Instant,
}

impl<B: Backend + 'static> Controller<B> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        backend: Arc<B>,
        config: Arc<StreamConfig>,
        demod: Arc<Mutex<DemodState>>,
        metrics: Arc<Metrics>,
        input_ring: Arc<InputRing>,
        output_ring: Arc<OutputRing>,
        gates: Arc<Gates>,
        mute_rearm: Arc<crate::ingest::MuteRearm>,
        mute_samples: usize,
    ) -> (Self, ControllerHandle) {
        let shared = Arc::new(Shared {
            pending: PendingRetune::default(),
            hop_requested: AtomicBool::new(false),
            training_freeze: AtomicBool::new(false),
            hop_lock: Mutex::new(()),
            hop_cv: Condvar::new(),
            gates: gates.clone(),
            ted_sps_pending: AtomicBool::new(false),
            ted_sps_value: AtomicU32::new(0),
            ted_sps_override_pending: AtomicBool::new(false),
            ted_sps_override_is_some: AtomicBool::new(false),
            ted_sps_override_value: AtomicU32::new(0),
            autogain_enabled_pending: AtomicBool::new(false),
            autogain_enabled_value: AtomicBool::new(false),
            autogain_enabled_published: AtomicBool::new(config.autogain.enabled),
            current_gain_db_bits: AtomicU32::new(config.autogain.seed_db.to_bits()),
            auto_ppm_enabled_pending: AtomicBool::new(false),
            auto_ppm_enabled_value: AtomicBool::new(false),
            auto_ppm_enabled_published: AtomicBool::new(config.auto_ppm.enabled),
            auto_ppm_status: Mutex::new(AutoPpmStatus::default()),
        });
        let handle = ControllerHandle { inner: shared.clone() };
        let ted_sps = config.ted_sps;
        let ted_sps_override = config.ted_sps_override;
        let autogain = Autogain::new(config.autogain.clone());
        let auto_ppm = AutoPpm::new(config.auto_ppm.clone(), config.ppm);
        let controller = Self {
            backend,
            config,
            demod,
            metrics,
            input_ring,
            output_ring,
            shared,
            gates,
            mute_rearm,
            mute_samples,
            state: ControllerState::Idle,
            freq_now: 0,
            costas_reset_pending: false,
            ted_sps,
            ted_sps_override,
            autogain,
            auto_ppm,
            started_at: Instant::now(),
        };
        (controller, handle)
    }

    fn effective_sps(&self) -> u32 {
        self.ted_sps_override.unwrap_or(self.ted_sps)
    }

    fn is_p25_phase2_vc(&self) -> bool {
        self.effective_sps() == 4 && self.config.cqpsk_enabled
    }

    /// Spawns the Controller's dedicated thread and runs the Cold-Start sequence before
    /// returning the join handle. Blocks the caller until Cold-Start completes so `Stream::open`
    /// can report device-open failures synchronously (§7 error kind 3).
    pub(crate) fn spawn(mut self) -> Result<thread::JoinHandle<()>, B::Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to build controller runtime");

        runtime.block_on(self.cold_start())?;

        let span = tracing::debug_span!("controller");
        Ok(thread::spawn(move || {
            let _entered = span.enter();
            runtime.block_on(self.run());
        }))
    }

    async fn cold_start(&mut self) -> Result<(), B::Error> {
        self.state = ControllerState::ColdStart;
        let settings = compute_capture_settings(&self.config);
        let freq = self.config.frequencies_hz[self.freq_now];

        tracing::debug!(freq, capture_rate_hz = settings.capture_rate_hz, passes = settings.downsample_passes, "cold start");

        self.backend.set_center_frequency(freq).await?;
        self.backend.set_sample_rate(settings.capture_rate_hz).await?;
        if let Some(bw) = self.config.tuner_bandwidth_hz {
            self.backend.set_tuner_bandwidth(bw).await?;
        }
        self.backend.set_tuner_gain(self.config.gain).await?;
        self.backend.set_frequency_correction(self.config.ppm).await?;
        if let Some(offset_tuning) = self.config.offset_tuning {
            self.backend.set_offset_tuning(offset_tuning).await?;
        }
        for &(stage, gain) in &self.config.if_gains {
            self.backend.set_tuner_if_gain(stage as i16, gain as i16).await?;
        }
        if let Some(xtal) = self.config.rtl_xtal_hz {
            self.backend.set_rtl_xtal(xtal).await?;
        }
        if let Some(xtal) = self.config.tuner_xtal_hz {
            self.backend.set_tuner_xtal(xtal).await?;
        }

        {
            let mut demod = self.demod.lock();
            demod.apply_sps_override(self.effective_sps());
            demod.reset_on_retune(self.is_p25_phase2_vc(), true);
        }
        self.metrics
            .set_profile(channel_lpf_profile_for_sps(
                self.effective_sps(),
                self.config.cqpsk_enabled,
                self.config.channel_lpf_profile,
            ));
        self.metrics.set_sps(self.effective_sps() as f32);

        self.gates.cold_start_ready.store(true, Ordering::Release);
        self.state = ControllerState::Steady;
        Ok(())
    }

    async fn run(mut self) {
        loop {
            if self.gates.should_exit.load(Ordering::Acquire) {
                self.state = ControllerState::Exiting;
                break;
            }

            if self.shared.ted_sps_pending.swap(false, Ordering::AcqRel) {
                let sps = self.shared.ted_sps_value.load(Ordering::Relaxed);
                self.set_ted_sps(sps);
            }
            if self.shared.ted_sps_override_pending.swap(false, Ordering::AcqRel) {
                let sps = self
                    .shared
                    .ted_sps_override_is_some
                    .load(Ordering::Relaxed)
                    .then(|| self.shared.ted_sps_override_value.load(Ordering::Relaxed));
                self.set_ted_sps_override(sps);
            }
            if self.shared.autogain_enabled_pending.swap(false, Ordering::AcqRel) {
                let enabled = self.shared.autogain_enabled_value.load(Ordering::Relaxed);
                self.autogain.set_enabled(enabled);
            }
            if self.shared.auto_ppm_enabled_pending.swap(false, Ordering::AcqRel) {
                let enabled = self.shared.auto_ppm_enabled_value.load(Ordering::Relaxed);
                self.auto_ppm.set_enabled(enabled);
            }

            let retune_target = self.shared.pending.take();
            let hop = self.shared.hop_requested.swap(false, Ordering::AcqRel);

            if let Some(freq) = retune_target {
                self.do_retune(freq).await;
            }
            else if hop && self.config.frequencies_hz.len() > 1 {
                self.state = ControllerState::Hopping;
                self.freq_now = (self.freq_now + 1) % self.config.frequencies_hz.len();
                let freq = self.config.frequencies_hz[self.freq_now];
                self.do_retune(freq).await;
            }
            else {
                self.tick_auto_controllers().await;
                self.wait_for_wakeup();
            }
        }

        tracing::debug!("controller thread exiting");
    }

    /// Ticks both supervisory Auto Controllers once per idle loop iteration (§4.6): they only
    /// read estimator atomics out of `Metrics` and, when they decide to act, call the same
    /// device-programming operations the Controller itself already serializes, so there is no
    /// need for either to run on its own thread.
    async fn tick_auto_controllers(&mut self) {
        let now_ms = self.started_at.elapsed().as_millis() as u64;
        let freq_hz = self.config.frequencies_hz[self.freq_now];

        let squelch_open = !self.demod.lock().squelch.is_squelched();
        match self.autogain.tick(&self.metrics, squelch_open, now_ms) {
            AutogainAction::SetGainDb(gain_db) => {
                if let Err(error) = self.backend.set_tuner_gain(Gain::ManualValue((gain_db * 10.0) as i32)).await {
                    tracing::warn!(?error, gain_db, "autogain: set_tuner_gain failed");
                }
            }
            AutogainAction::None => {}
        }

        if let Some(new_ppm) = self.auto_ppm.tick(&self.metrics, freq_hz, self.config.rate_out_hz, now_ms) {
            if let Err(error) = self.backend.set_frequency_correction(new_ppm).await {
                tracing::warn!(?error, new_ppm, "auto-ppm: set_frequency_correction failed");
            }
        }

        // Retune deferral while the Auto-PPM trainer is actively steering frequency correction
        // (§4.4 "Retune deferral", `AutoPpmConfig::freeze_on_train`).
        let freeze = self.config.auto_ppm.freeze_on_train && self.auto_ppm.status().training_active;
        self.shared.training_freeze.store(freeze, Ordering::Release);

        self.shared.autogain_enabled_published.store(self.autogain.enabled(), Ordering::Relaxed);
        self.shared
            .current_gain_db_bits
            .store(self.autogain.current_gain_db().to_bits(), Ordering::Relaxed);
        self.shared.auto_ppm_enabled_published.store(self.auto_ppm.enabled(), Ordering::Relaxed);
        *self.shared.auto_ppm_status.lock() = self.auto_ppm.status();
    }

    fn wait_for_wakeup(&self) {
        let mut guard = self.shared.hop_lock.lock();
        if self.shared.pending.pending.load(Ordering::Acquire)
            || self.shared.hop_requested.load(Ordering::Acquire)
            || self.gates.should_exit.load(Ordering::Acquire)
        {
            return;
        }
        self.shared.hop_cv.wait_for(&mut guard, AUTO_CONTROLLER_POLL);
    }

    /// Runs the Retune/Hop sequence (§4.4 "On Retune/Hop"): gate, program, reset, ungate, drain.
    async fn do_retune(&mut self, freq_hz: u32) {
        let span = tracing::debug_span!("retune", freq_hz);
        async {
            self.state = ControllerState::Retuning;
            self.gates.retune_in_progress.store(true, Ordering::Release);
            self.input_ring.clear();
            self.mute_rearm.request(self.mute_samples);

            if let Err(error) = self.backend.set_center_frequency(freq_hz).await {
                tracing::warn!(?error, "retune: set_center_frequency failed");
            }

            let p25_phase2_vc = self.is_p25_phase2_vc();
            {
                let mut demod = self.demod.lock();
                let sps_changed = demod.apply_sps_override(self.effective_sps());
                self.costas_reset_pending |= sps_changed;
                demod.reset_on_retune(p25_phase2_vc, self.costas_reset_pending);
            }
            self.costas_reset_pending = false;
            self.metrics.set_profile(channel_lpf_profile_for_sps(
                self.effective_sps(),
                self.config.cqpsk_enabled,
                self.config.channel_lpf_profile,
            ));
            self.metrics.set_sps(self.effective_sps() as f32);

            self.gates.retune_in_progress.store(false, Ordering::Release);
            self.state = ControllerState::Steady;
            let now_ms = self.started_at.elapsed().as_millis() as u64;
            self.autogain.on_retune(now_ms);

            if self.config.retune_drain.is_zero() {
                self.output_ring.clear();
            }
            else {
                tokio::time::sleep(self.config.retune_drain).await;
                self.output_ring.clear();
            }
        }
        .instrument(span)
        .await;
    }

    /// Applies a samples-per-symbol override from the consumer API (§6), raising
    /// `costas_reset_pending` whenever the effective SPS actually changes (see the field
    /// doc-comment's Open-Question resolution).
    pub(crate) fn set_ted_sps_override(&mut self, sps: Option<u32>) {
        let before = self.effective_sps();
        self.ted_sps_override = sps;
        if self.effective_sps() != before {
            self.costas_reset_pending = true;
        }
    }

    pub(crate) fn set_ted_sps(&mut self, sps: u32) {
        let before = self.effective_sps();
        self.ted_sps = sps;
        if self.effective_sps() != before {
            self.costas_reset_pending = true;
        }
    }
}

/// Selects the channel LPF profile that should be active for the current SPS/CQPSK state: the
/// dynamic OP25-TDMA/FDMA switch (§4.3 stage 4) when CQPSK is enabled, or the statically
/// configured profile (wide/analog or digital-narrow) otherwise. Exposed here for the
/// Controller's own bookkeeping and test fixtures that don't want to reach into `demod`.
pub fn channel_lpf_profile_for_sps(sps: u32, cqpsk_enabled: bool, configured: ChannelLpfProfile) -> ChannelLpfProfile {
    if cqpsk_enabled {
        ChannelLpfProfile::for_cqpsk_sps(sps)
    }
    else {
        configured
    }
}

#[cfg(test)]
mod tests {
    use super::compute_capture_settings;
    use crate::config::StreamConfig;

    #[test]
    fn capture_settings_choose_an_rtl_anchor_rate() {
        let mut config = StreamConfig::default();
        config.rate_out_hz = 32_000;
        let settings = compute_capture_settings(&config);
        assert_eq!(settings.capture_rate_hz, 1_024_000);
        assert_eq!(settings.downsample_passes, 5);
    }
}
