//! Band-edge FLL: `full_demod` stage 6.

use num_complex::Complex32;

const TAP_COUNT: usize = 15;

fn design_band_edge_taps(symbol_rate_hz: f32, sample_rate_hz: f32, sign: f32) -> [Complex32; TAP_COUNT] {
    let edge_hz = sign * symbol_rate_hz / 2.0;
    let m = (TAP_COUNT - 1) as f32;
    let mut taps = [Complex32::new(0.0, 0.0); TAP_COUNT];
    for (n, tap) in taps.iter_mut().enumerate() {
        let window = 0.54 - 0.46 * (2.0 * std::f32::consts::PI * n as f32 / m).cos();
        let theta = 2.0 * std::f32::consts::PI * edge_hz * (n as f32 - m / 2.0) / sample_rate_hz;
        *tap = Complex32::new(theta.cos(), theta.sin()) * window;
    }
    taps
}

/// Frequency-locked loop using a pair of complex band-edge filters, as described in §4.3 stage 6.
#[derive(Debug, Clone)]
pub struct Fll {
    enabled: bool,
    sample_rate_hz: f32,
    symbol_rate_hz: f32,
    taps_plus: [Complex32; TAP_COUNT],
    taps_minus: [Complex32; TAP_COUNT],
    history: [Complex32; TAP_COUNT],
    alpha: f32,
    beta: f32,
    pub freq: f32,
    pub phase: f32,
}

impl Fll {
    pub fn new(sample_rate_hz: f32, symbol_rate_hz: f32, alpha: f32, beta: f32) -> Self {
        Self {
            enabled: true,
            sample_rate_hz,
            symbol_rate_hz,
            taps_plus: design_band_edge_taps(symbol_rate_hz, sample_rate_hz, 1.0),
            taps_minus: design_band_edge_taps(symbol_rate_hz, sample_rate_hz, -1.0),
            history: [Complex32::new(0.0, 0.0); TAP_COUNT],
            alpha,
            beta,
            freq: 0.0,
            phase: 0.0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Redesigns the band-edge taps from a new symbol rate (e.g. after an SPS change) and zeros
    /// the filter history; optionally zeros `freq` too (forced on P25 Phase 2 voice-channel
    /// retunes per §4.4 step 4).
    pub fn reset(&mut self, symbol_rate_hz: f32, zero_freq: bool) {
        self.symbol_rate_hz = symbol_rate_hz;
        self.taps_plus = design_band_edge_taps(symbol_rate_hz, self.sample_rate_hz, 1.0);
        self.taps_minus = design_band_edge_taps(symbol_rate_hz, self.sample_rate_hz, -1.0);
        self.history = [Complex32::new(0.0, 0.0); TAP_COUNT];
        self.phase = 0.0;
        if zero_freq {
            self.freq = 0.0;
        }
    }

    pub fn process_block(&mut self, block: &mut [Complex32]) {
        if !self.enabled {
            return;
        }
        for sample in block.iter_mut() {
            self.history.copy_within(1.., 0);
            *self.history.last_mut().unwrap() = *sample;

            let y_plus: Complex32 = self
                .taps_plus
                .iter()
                .zip(self.history.iter())
                .map(|(&t, &s)| t * s)
                .sum();
            let y_minus: Complex32 = self
                .taps_minus
                .iter()
                .zip(self.history.iter())
                .map(|(&t, &s)| t * s)
                .sum();

            let error = (y_plus * y_minus.conj() * sample.conj()).im;
            self.freq += self.beta * error;
            self.phase += self.alpha * error + self.freq;

            // rotate by -phase; the band-edge filters only exist to derive `error`, they are not
            // themselves in the signal path.
            let correction = Complex32::new(self.phase.cos(), -self.phase.sin());
            *sample *= correction;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Fll;

    #[test]
    fn reset_zeroes_freq_when_requested() {
        let mut fll = Fll::new(48_000.0, 6_000.0, 0.05, 0.002);
        fll.freq = 0.01;
        fll.reset(4_800.0, true);
        assert_eq!(fll.freq, 0.0);
    }

    #[test]
    fn reset_preserves_freq_when_not_requested() {
        let mut fll = Fll::new(48_000.0, 6_000.0, 0.05, 0.002);
        fll.freq = 0.01;
        fll.reset(4_800.0, false);
        assert_eq!(fll.freq, 0.01);
    }
}
