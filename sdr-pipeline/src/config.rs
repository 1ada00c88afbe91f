//! `StreamConfig`: the immutable, open-time-only configuration record (§1.1, §3, §9 Design
//! Note "Environment-driven config"). Populated once by the binary entry point from CLI flags
//! and environment variables, then handed to [`crate::Stream::open`] by reference. No component
//! reads the process environment after open.

use std::{
    net::SocketAddr,
    time::Duration,
};

use rtlsdr_async::{
    DirectSamplingMode,
    Gain,
};

use crate::demod::channel_lpf::ChannelLpfProfile;

/// How direct sampling is configured (§3 "Dongle State"). `Off` leaves the tuner's normal I/Q
/// path active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirectSampling {
    #[default]
    Off,
    I,
    Q,
}

impl From<DirectSampling> for Option<DirectSamplingMode> {
    fn from(value: DirectSampling) -> Self {
        match value {
            DirectSampling::Off => None,
            DirectSampling::I => Some(DirectSamplingMode::I),
            DirectSampling::Q => Some(DirectSamplingMode::Q),
        }
    }
}

/// Supervisory tuner-autogain parameters (§4.6.1), mirroring the `DSD_NEO_TUNER_AUTOGAIN*` table.
#[derive(Debug, Clone)]
pub struct AutogainConfig {
    pub enabled: bool,
    pub probe: Duration,
    pub seed_db: f32,
    pub spectral_snr_db: f32,
    pub inband_ratio: f32,
    pub up_step_db: f32,
    pub down_step_db: f32,
    pub up_persist: u32,
}

impl Default for AutogainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probe: Duration::from_millis(3_000),
            seed_db: 30.0,
            spectral_snr_db: 6.0,
            inband_ratio: 0.60,
            up_step_db: 3.0,
            down_step_db: 5.0,
            up_persist: 2,
        }
    }
}

/// Auto-PPM trainer parameters (§4.6.2), mirroring the `DSD_NEO_AUTO_PPM*` table.
#[derive(Debug, Clone)]
pub struct AutoPpmConfig {
    pub enabled: bool,
    pub snr_threshold_db: f32,
    pub power_threshold_db: f32,
    pub zerolock_ppm: f32,
    pub zerolock_hz: f32,
    pub freeze_on_train: bool,
}

impl Default for AutoPpmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            snr_threshold_db: 6.0,
            power_threshold_db: -80.0,
            zerolock_ppm: 0.6,
            zerolock_hz: 60.0,
            freeze_on_train: true,
        }
    }
}

/// Immutable configuration for one `Stream::open` call (§3 "StreamConfig (ambient, new)").
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Channels to cycle through on squelch hop (§3 "Controller State"); must be non-empty and
    /// no longer than 1000 entries (§7 error kind 1).
    pub frequencies_hz: Vec<u32>,
    pub capture_rate_hz: u32,
    pub rate_out_hz: u32,
    pub gain: Gain,
    pub ppm: i32,
    /// `None` lets the driver pick its default bandwidth.
    pub tuner_bandwidth_hz: Option<u32>,
    pub fs4_shift_enabled: bool,
    pub combine_rotate: bool,
    pub direct_sampling: DirectSampling,
    /// `None` leaves the driver's offset-tuning default untouched.
    pub offset_tuning: Option<bool>,
    pub rtl_xtal_hz: Option<u32>,
    pub tuner_xtal_hz: Option<u32>,
    pub testmode: bool,
    /// `(stage, tenth_db)` pairs, parsed from `DSD_NEO_RTL_IF_GAINS`.
    pub if_gains: Vec<(i32, i32)>,

    pub channel_lpf_profile: ChannelLpfProfile,
    pub cqpsk_enabled: bool,
    pub symbol_timing_enabled: bool,
    pub ted_sps: u32,
    pub ted_sps_override: Option<u32>,
    pub squelch_threshold: f32,
    pub conseq_squelch: u32,

    pub dc_block_enabled: bool,
    pub iq_dc_shift: u32,
    pub fm_agc_target_rms: f32,
    pub fm_agc_min_rms: f32,
    pub fm_agc_alpha_up: f32,
    pub fm_agc_alpha_down: f32,
    pub deemphasis_tau_us: f32,
    pub audio_lpf_enabled: bool,
    pub audio_lpf_cutoff_hz: f32,
    pub fll_alpha: f32,
    pub fll_beta: f32,
    pub gardner_gain: f32,
    pub costas_alpha: f32,
    pub costas_beta: f32,

    pub input_ring_capacity: usize,
    pub output_ring_capacity: usize,
    pub read_timeout: Duration,
    pub retune_drain: Duration,

    pub autogain: AutogainConfig,
    pub auto_ppm: AutoPpmConfig,

    /// rtl_tcp-only: duration to prebuffer before signaling the consumer to start (§4.1 TCP
    /// variant); `None` disables prebuffering.
    pub tcp_prebuffer: Option<Duration>,
    pub tcp_autotune: bool,

    /// Bind address for the UDP External Control Surface (C8); `None` disables it.
    pub control_surface_addr: Option<SocketAddr>,

    pub spectrum_fft_len: usize,
    pub debug_cqpsk: bool,
}

impl StreamConfig {
    /// Computes the halfband cascade's pass count and the RTL2832U capture-rate anchor nearest
    /// it, per §4.3 stage 2. `max_passes` bounds the search (§3 `downsample_passes` is 0-10).
    pub fn downsample_passes(&self) -> (usize, u32) {
        crate::demod::halfband::choose_downsample_passes(self.rate_out_hz.max(1), 10)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frequencies_hz: Vec::new(),
            capture_rate_hz: 1_024_000,
            rate_out_hz: 48_000,
            gain: Gain::Auto,
            ppm: 0,
            tuner_bandwidth_hz: None,
            fs4_shift_enabled: true,
            combine_rotate: true,
            direct_sampling: DirectSampling::Off,
            offset_tuning: None,
            rtl_xtal_hz: None,
            tuner_xtal_hz: None,
            testmode: false,
            if_gains: Vec::new(),

            channel_lpf_profile: ChannelLpfProfile::WideAnalog,
            cqpsk_enabled: false,
            symbol_timing_enabled: false,
            ted_sps: 4,
            ted_sps_override: None,
            squelch_threshold: 0.0,
            conseq_squelch: 2,

            dc_block_enabled: true,
            iq_dc_shift: 8,
            fm_agc_target_rms: 0.4,
            fm_agc_min_rms: 0.01,
            fm_agc_alpha_up: 0.3,
            fm_agc_alpha_down: 0.1,
            deemphasis_tau_us: 75.0,
            audio_lpf_enabled: true,
            audio_lpf_cutoff_hz: 4_000.0,
            fll_alpha: 0.05,
            fll_beta: 0.002,
            gardner_gain: 0.01,
            costas_alpha: 0.02,
            costas_beta: 0.001,

            input_ring_capacity: 1 << 16,
            output_ring_capacity: 1 << 16,
            read_timeout: Duration::from_millis(500),
            retune_drain: Duration::from_millis(50),

            autogain: AutogainConfig::default(),
            auto_ppm: AutoPpmConfig::default(),

            tcp_prebuffer: None,
            tcp_autotune: false,

            control_surface_addr: None,
            spectrum_fft_len: 1024,
            debug_cqpsk: false,
        }
    }
}

/// Parses the `DSD_NEO_*` environment table (§6) on top of `base`, following the reference
/// binary's ad-hoc `FromStr`/parse-or-default idiom rather than a config-file crate. Unset or
/// unparseable variables fall back to whatever `base` already holds.
pub fn apply_env(mut base: StreamConfig) -> StreamConfig {
    use std::env::var;

    if let Ok(v) = var("DSD_NEO_TUNER_BW_HZ") {
        base.tuner_bandwidth_hz = match v.trim() {
            "auto" | "0" => None,
            hz => hz.parse().ok(),
        };
    }
    if let Ok(v) = var("DSD_NEO_DISABLE_FS4_SHIFT") {
        base.fs4_shift_enabled = !is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_COMBINE_ROT") {
        base.combine_rotate = is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_RTL_DIRECT") {
        base.direct_sampling = match v.trim() {
            "1" | "I" | "i" => DirectSampling::I,
            "2" | "Q" | "q" => DirectSampling::Q,
            _ => DirectSampling::Off,
        };
    }
    if let Ok(v) = var("DSD_NEO_RTL_OFFSET_TUNING") {
        base.offset_tuning = Some(is_truthy(&v));
    }
    if let Ok(v) = var("DSD_NEO_RTL_XTAL_HZ") {
        base.rtl_xtal_hz = v.parse().ok();
    }
    if let Ok(v) = var("DSD_NEO_TUNER_XTAL_HZ") {
        base.tuner_xtal_hz = v.parse().ok();
    }
    if let Ok(v) = var("DSD_NEO_RTL_TESTMODE") {
        base.testmode = is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_RTL_IF_GAINS") {
        base.if_gains = v
            .split(',')
            .filter_map(|pair| {
                let (stage, gain) = pair.split_once(':')?;
                Some((stage.trim().parse().ok()?, gain.trim().parse().ok()?))
            })
            .collect();
    }

    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN") {
        base.autogain.enabled = is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_PROBE_MS") {
        if let Ok(ms) = v.parse() {
            base.autogain.probe = Duration::from_millis(ms);
        }
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_SEED_DB") {
        base.autogain.seed_db = v.parse().unwrap_or(base.autogain.seed_db);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_SPEC_SNR_DB") {
        base.autogain.spectral_snr_db = v.parse().unwrap_or(base.autogain.spectral_snr_db);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_INBAND_RATIO") {
        base.autogain.inband_ratio = v.parse().unwrap_or(base.autogain.inband_ratio);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_UP_STEP_DB") {
        base.autogain.up_step_db = v.parse().unwrap_or(base.autogain.up_step_db);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_DOWN_STEP_DB") {
        base.autogain.down_step_db = v.parse().unwrap_or(base.autogain.down_step_db);
    }
    if let Ok(v) = var("DSD_NEO_TUNER_AUTOGAIN_UP_PERSIST") {
        base.autogain.up_persist = v.parse().unwrap_or(base.autogain.up_persist);
    }

    if let Ok(v) = var("DSD_NEO_AUTO_PPM") {
        base.auto_ppm.enabled = is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_AUTO_PPM_SNR_DB") {
        base.auto_ppm.snr_threshold_db = v.parse().unwrap_or(base.auto_ppm.snr_threshold_db);
    }
    if let Ok(v) = var("DSD_NEO_AUTO_PPM_PWR_DB") {
        base.auto_ppm.power_threshold_db = v.parse().unwrap_or(base.auto_ppm.power_threshold_db);
    }
    if let Ok(v) = var("DSD_NEO_AUTO_PPM_ZEROLOCK_PPM") {
        base.auto_ppm.zerolock_ppm = v.parse().unwrap_or(base.auto_ppm.zerolock_ppm);
    }
    if let Ok(v) = var("DSD_NEO_AUTO_PPM_ZEROLOCK_HZ") {
        base.auto_ppm.zerolock_hz = v.parse().unwrap_or(base.auto_ppm.zerolock_hz);
    }
    if let Ok(v) = var("DSD_NEO_AUTO_PPM_FREEZE") {
        base.auto_ppm.freeze_on_train = is_truthy(&v);
    }

    if let Ok(v) = var("DSD_NEO_TCP_PREBUF_MS") {
        base.tcp_prebuffer = v.parse().ok().map(Duration::from_millis);
    }
    if let Ok(v) = var("DSD_NEO_TCP_AUTOTUNE") {
        base.tcp_autotune = is_truthy(&v);
    }
    if let Ok(v) = var("DSD_NEO_DEBUG_CQPSK") {
        base.debug_cqpsk = is_truthy(&v);
    }

    base
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::{
        DirectSampling,
        StreamConfig,
    };

    #[test]
    fn default_config_has_no_cqpsk_and_wide_profile() {
        let config = StreamConfig::default();
        assert!(!config.cqpsk_enabled);
        assert_eq!(config.direct_sampling, DirectSampling::Off);
    }

    #[test]
    fn downsample_passes_lands_near_an_rtl_anchor() {
        let mut config = StreamConfig::default();
        config.rate_out_hz = 32_000;
        let (passes, anchor) = config.downsample_passes();
        assert_eq!(passes, 5);
        assert_eq!(anchor, 1_024_000);
    }
}
