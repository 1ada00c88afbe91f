//! Gardner Timing Error Detector: `full_demod` stage 7.

use num_complex::Complex32;

/// Interpolates at 2 samples/symbol and releases one output symbol whenever fractional phase
/// `mu` crosses 1.0, per §4.3 stage 7.
#[derive(Debug, Clone)]
pub struct GardnerTed {
    enabled: bool,
    /// nominal samples-per-symbol
    omega: f32,
    /// fractional symbol phase
    mu: f32,
    gain: f32,
    delay_line: [Complex32; 3],
    e_ema: f32,
    force: bool,
}

impl GardnerTed {
    pub fn new(sps: f32, gain: f32) -> Self {
        Self {
            enabled: true,
            omega: sps,
            mu: 0.0,
            gain,
            delay_line: [Complex32::new(0.0, 0.0); 3],
            e_ema: 0.0,
            force: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_force(&mut self, force: bool) {
        self.force = force;
    }

    pub fn sps(&self) -> f32 {
        self.omega
    }

    pub fn e_ema(&self) -> f32 {
        self.e_ema
    }

    /// Soft reset: preserves `mu`/`omega` (used on ordinary retunes). Use [`Self::hard_reset`] for
    /// channels that require a fresh symbol-clock lock (P25 Phase 2 voice channel retunes, §4.4
    /// step 4).
    pub fn soft_reset(&mut self) {
        self.delay_line = [Complex32::new(0.0, 0.0); 3];
    }

    pub fn hard_reset(&mut self, sps: f32) {
        self.omega = sps;
        self.mu = 0.0;
        self.delay_line = [Complex32::new(0.0, 0.0); 3];
        self.e_ema = 0.0;
    }

    /// Feeds one 2x-oversampled input sample; returns `Some(symbol)` whenever `mu` crosses 1.0.
    pub fn process_sample(&mut self, sample: Complex32) -> Option<Complex32> {
        if !self.enabled && !self.force {
            return None;
        }

        self.delay_line.copy_within(1.., 0);
        self.delay_line[2] = sample;

        self.mu += 1.0 / (self.omega / 2.0);
        if self.mu >= 1.0 {
            self.mu -= 1.0;

            let prev = self.delay_line[0];
            let mid = self.delay_line[1];
            let now = self.delay_line[2];

            let error = (mid * (now - prev).conj()).re;
            self.e_ema += 0.1 * (error - self.e_ema);
            self.mu += self.gain * error;

            return Some(now);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::GardnerTed;

    #[test]
    fn produces_one_symbol_per_sps_samples() {
        let mut ted = GardnerTed::new(4.0, 0.01);
        let mut symbols = 0;
        for n in 0..80 {
            let phase = n as f32 * 0.1;
            if ted
                .process_sample(Complex32::new(phase.cos(), phase.sin()))
                .is_some()
            {
                symbols += 1;
            }
        }
        // roughly 80 / (4/2) = 40 mu-crossings for a 2x-oversampled detector at sps=4
        assert!(symbols > 30 && symbols < 50);
    }

    #[test]
    fn soft_reset_preserves_sps() {
        let mut ted = GardnerTed::new(5.0, 0.01);
        ted.soft_reset();
        assert_eq!(ted.sps(), 5.0);
    }

    #[test]
    fn hard_reset_clears_delay_line_and_sets_sps() {
        let mut ted = GardnerTed::new(5.0, 0.01);
        ted.process_sample(Complex32::new(1.0, 1.0));
        ted.hard_reset(4.0);
        assert_eq!(ted.sps(), 4.0);
        assert!(ted.delay_line.iter().all(|s| *s == Complex32::new(0.0, 0.0)));
    }
}
