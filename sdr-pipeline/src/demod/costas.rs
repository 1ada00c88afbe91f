//! Costas loop + CQPSK differential demodulator: `full_demod` stage 8.

use num_complex::Complex32;

/// Decision-directed QPSK Costas loop followed by one-symbol differential decode, per §4.3
/// stage 8.
#[derive(Debug, Clone)]
pub struct CostasCqpsk {
    enabled: bool,
    theta: f32,
    freq: f32,
    alpha: f32,
    beta: f32,
    diff_prev: Complex32,
}

impl CostasCqpsk {
    pub fn new(alpha: f32, beta: f32) -> Self {
        Self {
            enabled: true,
            theta: 0.0,
            freq: 0.0,
            alpha,
            beta,
            diff_prev: Complex32::new(1.0, 0.0),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn diff_prev(&self) -> Complex32 {
        self.diff_prev
    }

    /// Resets Costas phase/error unconditionally; `zero_freq` additionally zeros the tracked
    /// carrier frequency (forced on P25 Phase 2 voice-channel retunes, or when a pending
    /// `costas_reset_pending` flag from an SPS change is set, per §4.4 step 4). The differential
    /// `diff_prev` phasor is always reinitialized to `(1, 0)` so the first post-retune symbol is
    /// passed through unchanged.
    pub fn reset(&mut self, zero_freq: bool) {
        self.theta = 0.0;
        if zero_freq {
            self.freq = 0.0;
        }
        self.diff_prev = Complex32::new(1.0, 0.0);
    }

    /// Processes one post-TED symbol: carrier correction via the Costas loop, then one-symbol
    /// differential decode. Returns the differentially-decoded symbol.
    pub fn process_symbol(&mut self, symbol: Complex32) -> Complex32 {
        if !self.enabled {
            return symbol;
        }

        let corrected = symbol * Complex32::new(self.theta.cos(), -self.theta.sin());

        // sign-based QPSK decision error
        let decision = Complex32::new(corrected.re.signum(), corrected.im.signum());
        let error = (corrected * decision.conj()).im;

        self.freq += self.beta * error;
        self.theta += self.alpha * error + self.freq;

        let diff = corrected * self.diff_prev.conj();
        self.diff_prev = corrected;
        diff
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::CostasCqpsk;

    #[test]
    fn reset_reinitializes_diff_prev_to_unity() {
        let mut costas = CostasCqpsk::new(0.02, 0.001);
        costas.process_symbol(Complex32::new(0.7, 0.7));
        assert_ne!(costas.diff_prev(), Complex32::new(1.0, 0.0));
        costas.reset(true);
        assert_eq!(costas.diff_prev(), Complex32::new(1.0, 0.0));
    }

    #[test]
    fn first_symbol_after_reset_passes_through_unchanged() {
        let mut costas = CostasCqpsk::new(0.0, 0.0);
        costas.reset(true);
        let input = Complex32::new(0.6, 0.8);
        let out = costas.process_symbol(input);
        // with alpha=beta=0 theta stays 0, so corrected == input, and diff_prev starts at (1,0)
        assert!((out.re - input.re).abs() < 1e-6);
        assert!((out.im - input.im).abs() < 1e-6);
    }

    #[test]
    fn reset_without_zero_freq_preserves_tracked_frequency() {
        let mut costas = CostasCqpsk::new(0.02, 0.001);
        costas.process_symbol(Complex32::new(0.7, -0.3));
        costas.process_symbol(Complex32::new(-0.5, 0.5));
        let freq_before = costas.freq;
        costas.reset(false);
        assert_eq!(costas.freq, freq_before);
    }
}
