//! `full_demod` (§4.3): the DSP worker's per-block processing chain, and the mutable state it
//! carries across blocks.

pub mod channel_lpf;
pub mod costas;
pub mod dc_block;
pub mod discriminator;
pub mod fll;
pub mod fm_agc;
pub mod gardner;
pub mod halfband;
pub mod iq_balance;
pub mod mixer;
pub mod resampler;
pub mod squelch;

use channel_lpf::{
    ChannelLpf,
    ChannelLpfProfile,
};
use costas::CostasCqpsk;
use dc_block::DcBlocker;
use discriminator::{
    AudioLpf,
    Deemphasis,
    PolarDiscriminator,
};
use fll::Fll;
use fm_agc::FmAgc;
use gardner::GardnerTed;
use halfband::HalfbandCascade;
use iq_balance::IqBalance;
use mixer::Fs4Mixer;
use num_complex::Complex32;
use resampler::Resampler;
use squelch::Squelch;

/// Immutable construction parameters for a [`DemodState`]; the subset of `StreamConfig` that
/// shapes the DSP chain rather than the Device Adapter or Controller.
#[derive(Debug, Clone)]
pub struct DemodConfig {
    pub iq_dc_shift: u32,
    pub dc_block_enabled: bool,
    pub downsample_passes: usize,
    pub decimated_rate_hz: f32,
    pub channel_lpf_profile: ChannelLpfProfile,
    pub fm_agc_target_rms: f32,
    pub fm_agc_min_rms: f32,
    pub fm_agc_alpha_up: f32,
    pub fm_agc_alpha_down: f32,
    pub fll_alpha: f32,
    pub fll_beta: f32,
    pub gardner_sps: f32,
    pub gardner_gain: f32,
    pub costas_alpha: f32,
    pub costas_beta: f32,
    pub deemphasis_tau_us: f32,
    pub audio_lpf_cutoff_hz: f32,
    pub audio_lpf_enabled: bool,
    pub rate_out_hz: u32,
    pub squelch_threshold: f32,
    pub conseq_squelch: u32,
    pub cqpsk_enabled: bool,
    /// Whether Gardner/FLL symbol-timing recovery runs at all. Always `true` when
    /// `cqpsk_enabled`; for the discriminator path this distinguishes digital-narrow FSK/C4FM
    /// (timed) from wideband analog FM broadcast (untimed, full-rate discriminator).
    pub symbol_timing_enabled: bool,
}

/// Result of one `full_demod` call: whether the channel is currently squelched, and whether this
/// block just crossed the consecutive-low-power threshold that should wake the Controller's hop
/// condition variable (§4.3 stage 11).
#[derive(Debug, Clone, Copy, Default)]
pub struct DemodOutput {
    pub squelched: bool,
    pub hop_requested: bool,
    /// Largest `max(|I|, |Q|)` seen in this block's raw input, before any DC/AGC correction
    /// (§4.6.1 "fraction of blocks with max|I|,|Q| > 0.9").
    pub peak_iq: f32,
    /// Mean `(|I| + |Q|) / 2` over this block's raw input (§4.6.1 "fraction of blocks with
    /// mean|I|,|Q| < 0.06").
    pub mean_iq: f32,
}

/// All per-channel DSP state carried across blocks by the DSP worker (§3 "Demod State").
pub struct DemodState {
    pub dc_blocker: DcBlocker,
    pub iq_balance: IqBalance,
    pub halfband: HalfbandCascade,
    pub mixer: Fs4Mixer,
    pub channel_lpf: ChannelLpf,
    pub fm_agc: FmAgc,
    pub fll: Fll,
    pub gardner: GardnerTed,
    pub costas: CostasCqpsk,
    pub discriminator: PolarDiscriminator,
    pub deemphasis: Deemphasis,
    pub audio_lpf: AudioLpf,
    pub resampler: Option<Resampler>,
    pub squelch: Squelch,
    pub cqpsk_enabled: bool,
    pub symbol_timing_enabled: bool,
    decimated_rate_hz: f32,

    block: Vec<Complex32>,
    decimated: Vec<Complex32>,
    scratch: Vec<Complex32>,
    symbols: Vec<Complex32>,
    audio: Vec<f32>,
    silence: Vec<f32>,
}

impl DemodState {
    pub fn new(config: &DemodConfig) -> Self {
        let symbol_rate_hz = config.decimated_rate_hz / config.gardner_sps;
        Self {
            dc_blocker: DcBlocker::new(config.dc_block_enabled, config.iq_dc_shift),
            iq_balance: IqBalance::new(false),
            halfband: HalfbandCascade::new(config.downsample_passes),
            mixer: Fs4Mixer::default(),
            channel_lpf: ChannelLpf::new(config.channel_lpf_profile, config.decimated_rate_hz),
            fm_agc: FmAgc::new(
                config.fm_agc_target_rms,
                config.fm_agc_min_rms,
                config.fm_agc_alpha_up,
                config.fm_agc_alpha_down,
            ),
            fll: Fll::new(
                config.decimated_rate_hz,
                symbol_rate_hz,
                config.fll_alpha,
                config.fll_beta,
            ),
            gardner: GardnerTed::new(config.gardner_sps, config.gardner_gain),
            costas: CostasCqpsk::new(config.costas_alpha, config.costas_beta),
            discriminator: PolarDiscriminator::default(),
            deemphasis: Deemphasis::new(config.deemphasis_tau_us, config.rate_out_hz as f32),
            audio_lpf: {
                let mut lpf = AudioLpf::new(config.audio_lpf_cutoff_hz, config.rate_out_hz as f32);
                lpf.set_enabled(config.audio_lpf_enabled);
                lpf
            },
            resampler: Resampler::design(config.decimated_rate_hz as u32, config.rate_out_hz),
            squelch: Squelch::new(config.squelch_threshold, config.conseq_squelch),
            cqpsk_enabled: config.cqpsk_enabled,
            symbol_timing_enabled: config.symbol_timing_enabled || config.cqpsk_enabled,
            decimated_rate_hz: config.decimated_rate_hz,
            block: Vec::new(),
            decimated: Vec::new(),
            scratch: Vec::new(),
            symbols: Vec::new(),
            audio: Vec::new(),
            silence: Vec::new(),
        }
    }

    /// Post-channel-filter complex samples from the most recent block, for spectrum-snapshot use
    /// (§4.5).
    pub fn channel_samples(&self) -> &[Complex32] {
        &self.decimated
    }

    /// The DSP chain's internal sample rate after the halfband cascade, needed to redesign the
    /// resampler when the consumer API changes its target output rate (§6 "resampler target
    /// rate").
    pub fn decimated_rate_hz(&self) -> f32 {
        self.decimated_rate_hz
    }

    /// Decoded CQPSK symbols from the most recent block, for the constellation ring and QPSK SNR
    /// estimator (§4.5, §4.3 SNR estimation).
    pub fn symbols(&self) -> &[Complex32] {
        &self.symbols
    }

    /// Switches the CQPSK samples-per-symbol override, retargeting the channel LPF profile and
    /// flagging that the Costas loop needs a full reset on the next retune (§4.3 stage 4 /
    /// §4.4 step 4 "a prior `costas_reset_pending` flag").
    pub fn apply_sps_override(&mut self, sps: u32) -> bool {
        let changed = (self.gardner.sps() - sps as f32).abs() > f32::EPSILON;
        if changed {
            if self.cqpsk_enabled {
                self.channel_lpf.set_profile(ChannelLpfProfile::for_cqpsk_sps(sps));
            }
            self.gardner.hard_reset(sps as f32);
        }
        changed
    }

    /// Runs the full retune/hop reset sequence described in §4.4 step 4. `p25_phase2_vc` is
    /// true when the newly tuned channel is a P25 Phase 2 voice channel
    /// (`ted_sps_override == 4 && cqpsk_enable`), which forces a hard symbol-clock relock rather
    /// than the default soft reset. `costas_reset_pending` additionally forces a full Costas
    /// reset when set by a prior SPS-override change.
    pub fn reset_on_retune(&mut self, p25_phase2_vc: bool, costas_reset_pending: bool) {
        self.squelch.reset();

        let symbol_rate_hz = self.decimated_rate_hz / self.gardner.sps();
        self.fll.reset(symbol_rate_hz, p25_phase2_vc);

        if p25_phase2_vc {
            self.gardner.hard_reset(self.gardner.sps());
            self.halfband.reset();
            self.channel_lpf.reset();
        }
        else {
            self.gardner.soft_reset();
        }

        self.costas.reset(p25_phase2_vc || costas_reset_pending);
    }

    fn run_fm_path(&mut self, output: &mut Vec<f32>) {
        self.fm_agc.process_block(&mut self.decimated);

        self.audio.clear();
        if self.symbol_timing_enabled {
            self.fll.process_block(&mut self.decimated);
            self.symbols.clear();
            for &sample in self.decimated.iter() {
                if let Some(sym) = self.gardner.process_sample(sample) {
                    self.symbols.push(sym);
                }
            }
            self.discriminator.process_block(&self.symbols, &mut self.audio);
        }
        else {
            self.discriminator.process_block(&self.decimated, &mut self.audio);
        }

        self.deemphasis.process_block(&mut self.audio);
        self.audio_lpf.process_block(&mut self.audio);

        if let Some(resampler) = self.resampler.as_mut() {
            if self.squelch.is_squelched() {
                self.silence.clear();
                self.silence.resize(self.audio.len(), 0.0);
                resampler.process_block(&self.silence, output);
            }
            else {
                resampler.process_block(&self.audio, output);
            }
        }
        else if self.squelch.is_squelched() {
            output.resize(self.audio.len(), 0.0);
        }
        else {
            output.extend_from_slice(&self.audio);
        }
    }

    fn run_cqpsk_path(&mut self, output: &mut Vec<f32>) {
        self.fll.process_block(&mut self.decimated);
        self.symbols.clear();
        for &sample in self.decimated.iter() {
            if let Some(sym) = self.gardner.process_sample(sample) {
                self.symbols.push(sym);
            }
        }
        for &sym in self.symbols.iter() {
            let decoded = self.costas.process_symbol(sym);
            if self.squelch.is_squelched() {
                output.push(0.0);
                output.push(0.0);
            }
            else {
                output.push(decoded.re);
                output.push(decoded.im);
            }
        }
    }
}

/// Runs one block through the full DSP chain, writing FM audio (mono `f32`) or CQPSK symbols
/// (interleaved I/Q `f32` pairs) to `output`.
pub fn full_demod(state: &mut DemodState, input: &[Complex32], output: &mut Vec<f32>) -> DemodOutput {
    state.block.clear();
    state.block.extend_from_slice(input);

    let (peak_iq, mean_iq) = if state.block.is_empty() {
        (0.0, 0.0)
    }
    else {
        let mut peak = 0.0f32;
        let mut mean_acc = 0.0f32;
        for sample in state.block.iter() {
            peak = peak.max(sample.re.abs()).max(sample.im.abs());
            mean_acc += (sample.re.abs() + sample.im.abs()) * 0.5;
        }
        (peak, mean_acc / state.block.len() as f32)
    };

    let retarget = state.dc_blocker.process_block(&mut state.block);
    if (retarget - 1.0).abs() > f32::EPSILON {
        state.fm_agc.retarget(retarget);
    }
    state.iq_balance.process_block(&mut state.block);

    state.halfband.process_block(&state.block, &mut state.decimated, &mut state.scratch);
    state.mixer.process_block(&mut state.decimated);
    state.channel_lpf.process_block(&mut state.decimated);

    let hop_requested = state.squelch.process_block(&state.decimated);

    output.clear();
    if state.cqpsk_enabled {
        state.run_cqpsk_path(output);
    }
    else {
        state.run_fm_path(output);
    }

    DemodOutput {
        squelched: state.squelch.is_squelched(),
        hop_requested,
        peak_iq,
        mean_iq,
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::{
        DemodConfig,
        DemodState,
        channel_lpf::ChannelLpfProfile,
        full_demod,
    };

    fn fm_config() -> DemodConfig {
        DemodConfig {
            iq_dc_shift: 8,
            dc_block_enabled: true,
            downsample_passes: 2,
            decimated_rate_hz: 48_000.0,
            channel_lpf_profile: ChannelLpfProfile::WideAnalog,
            fm_agc_target_rms: 0.4,
            fm_agc_min_rms: 0.01,
            fm_agc_alpha_up: 0.3,
            fm_agc_alpha_down: 0.1,
            fll_alpha: 0.05,
            fll_beta: 0.002,
            gardner_sps: 4.0,
            gardner_gain: 0.01,
            costas_alpha: 0.02,
            costas_beta: 0.001,
            deemphasis_tau_us: 75.0,
            audio_lpf_cutoff_hz: 4_000.0,
            audio_lpf_enabled: true,
            rate_out_hz: 48_000,
            squelch_threshold: 0.001,
            conseq_squelch: 2,
            cqpsk_enabled: false,
            symbol_timing_enabled: false,
        }
    }

    #[test]
    fn fm_path_produces_mono_audio_samples() {
        let mut state = DemodState::new(&fm_config());
        let input: Vec<Complex32> = (0..256)
            .map(|n| {
                let theta = 0.05 * n as f32;
                Complex32::new(theta.cos(), theta.sin()) * 0.5
            })
            .collect();
        let mut output = Vec::new();
        let result = full_demod(&mut state, &input, &mut output);
        assert!(!output.is_empty());
        assert!(!result.squelched);
    }

    #[test]
    fn silence_triggers_squelch_and_eventually_a_hop_request() {
        let mut config = fm_config();
        config.squelch_threshold = 0.5;
        config.conseq_squelch = 1;
        let mut state = DemodState::new(&config);
        let quiet = vec![Complex32::new(0.001, 0.0); 256];
        let mut output = Vec::new();
        let mut hop_requested = false;
        for _ in 0..4 {
            let result = full_demod(&mut state, &quiet, &mut output);
            hop_requested |= result.hop_requested;
        }
        assert!(hop_requested);
        assert!(output.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn cqpsk_path_emits_interleaved_symbol_pairs() {
        let mut config = fm_config();
        config.cqpsk_enabled = true;
        config.symbol_timing_enabled = true;
        config.channel_lpf_profile = ChannelLpfProfile::Op25Tdma;
        config.squelch_threshold = 0.0;
        let mut state = DemodState::new(&config);
        let input: Vec<Complex32> = (0..512)
            .map(|n| {
                let theta = 0.3 * n as f32;
                Complex32::new(theta.cos(), theta.sin())
            })
            .collect();
        let mut output = Vec::new();
        full_demod(&mut state, &input, &mut output);
        assert_eq!(output.len() % 2, 0);
    }
}
