//! Channel LPF: `full_demod` stage 4.

use num_complex::Complex32;

/// Which coefficient set is loaded into the channel LPF (§3 Demod State, §4.3 stage 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLpfProfile {
    /// Wide/analog: FM broadcast and general analog use.
    WideAnalog,
    /// Digital-narrow: generic narrowband digital voice.
    DigitalNarrow,
    /// P25 Phase 2, SPS = 4, 9600 Hz cutoff.
    Op25Tdma,
    /// P25 Phase 1, SPS = 5, 7000 Hz cutoff.
    Op25Fdma,
}

impl ChannelLpfProfile {
    /// Cutoff frequency in Hz, used both for tap design and for the §4.3 SNR noise-equivalent
    /// bandwidth table (`reference_noise_bandwidth_hz`).
    pub fn cutoff_hz(&self) -> f32 {
        match self {
            Self::WideAnalog => 15_000.0,
            Self::DigitalNarrow => 4_000.0,
            Self::Op25Tdma => 9_600.0,
            Self::Op25Fdma => 7_000.0,
        }
    }

    /// Reference noise-equivalent bandwidth at a 24 kHz output rate (§4.3 SNR bias correction).
    pub fn reference_noise_bandwidth_hz(&self) -> f32 {
        match self {
            Self::WideAnalog => 8_200.0,
            Self::DigitalNarrow => 5_400.0,
            Self::Op25Tdma => 9_800.0,
            Self::Op25Fdma => 7_200.0,
        }
    }

    /// Picks the CQPSK channel LPF profile for a given samples-per-symbol override (§4.3 stage
    /// 4): SPS=4 is P25 Phase 2 (6000 sym/s) using OP25-TDMA, SPS=5 is P25 Phase 1 (4800 sym/s)
    /// using OP25-FDMA.
    pub fn for_cqpsk_sps(sps: u32) -> Self {
        if sps == 4 { Self::Op25Tdma } else { Self::Op25Fdma }
    }
}

const TAP_COUNT: usize = 31;

fn design_lowpass(cutoff_hz: f32, sample_rate_hz: f32) -> [f32; TAP_COUNT] {
    let fc = (cutoff_hz / sample_rate_hz).clamp(0.001, 0.49);
    let m = (TAP_COUNT - 1) as f32;
    let mut taps = [0.0f32; TAP_COUNT];
    let mut sum = 0.0;
    for (n, tap) in taps.iter_mut().enumerate() {
        let k = n as f32 - m / 2.0;
        let sinc = if k == 0.0 {
            2.0 * fc
        }
        else {
            (2.0 * std::f32::consts::PI * fc * k).sin() / (std::f32::consts::PI * k)
        };
        // Hamming window
        let window = 0.54 - 0.46 * (2.0 * std::f32::consts::PI * n as f32 / m).cos();
        *tap = sinc * window;
        sum += *tap;
    }
    for tap in taps.iter_mut() {
        *tap /= sum;
    }
    taps
}

/// Symmetric FIR channel low-pass with swappable coefficient sets and its own history.
#[derive(Debug, Clone)]
pub struct ChannelLpf {
    profile: ChannelLpfProfile,
    sample_rate_hz: f32,
    taps: [f32; TAP_COUNT],
    history: [Complex32; TAP_COUNT],
}

impl ChannelLpf {
    pub fn new(profile: ChannelLpfProfile, sample_rate_hz: f32) -> Self {
        Self {
            profile,
            sample_rate_hz,
            taps: design_lowpass(profile.cutoff_hz(), sample_rate_hz),
            history: [Complex32::new(0.0, 0.0); TAP_COUNT],
        }
    }

    pub fn profile(&self) -> ChannelLpfProfile {
        self.profile
    }

    /// Switches the coefficient set (e.g. driven by a Controller SPS-override update); purges
    /// history so the stale passband's state doesn't leak into the new filter's output.
    pub fn set_profile(&mut self, profile: ChannelLpfProfile) {
        if profile != self.profile {
            self.profile = profile;
            self.taps = design_lowpass(profile.cutoff_hz(), self.sample_rate_hz);
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.history = [Complex32::new(0.0, 0.0); TAP_COUNT];
    }

    pub fn process_block(&mut self, block: &mut [Complex32]) {
        for sample in block.iter_mut() {
            self.history.copy_within(1.., 0);
            *self.history.last_mut().unwrap() = *sample;
            *sample = self
                .taps
                .iter()
                .zip(self.history.iter())
                .map(|(&tap, &s)| s * tap)
                .sum();
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::{
        ChannelLpf,
        ChannelLpfProfile,
    };

    #[test]
    fn picks_profile_from_cqpsk_sps() {
        assert_eq!(
            ChannelLpfProfile::for_cqpsk_sps(4),
            ChannelLpfProfile::Op25Tdma
        );
        assert_eq!(
            ChannelLpfProfile::for_cqpsk_sps(5),
            ChannelLpfProfile::Op25Fdma
        );
    }

    #[test]
    fn passes_dc_with_near_unity_gain() {
        let mut lpf = ChannelLpf::new(ChannelLpfProfile::WideAnalog, 48_000.0);
        let mut block = vec![Complex32::new(1.0, 0.0); 128];
        lpf.process_block(&mut block);
        let tail_avg: f32 =
            block.iter().skip(100).map(|s| s.re).sum::<f32>() / block.len().min(28) as f32;
        assert!((tail_avg - 1.0).abs() < 0.2);
    }

    #[test]
    fn switching_profile_resets_history() {
        let mut lpf = ChannelLpf::new(ChannelLpfProfile::Op25Fdma, 48_000.0);
        let mut block = vec![Complex32::new(1.0, 1.0); 16];
        lpf.process_block(&mut block);
        lpf.set_profile(ChannelLpfProfile::Op25Tdma);
        assert_eq!(lpf.profile(), ChannelLpfProfile::Op25Tdma);
        assert!(lpf.history.iter().all(|s| s.re == 0.0 && s.im == 0.0));
    }
}
