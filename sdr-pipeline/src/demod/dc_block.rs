//! IQ DC blocker: `full_demod` stage 1.

use num_complex::Complex32;

/// Running-mean DC estimator/remover with a precharge-on-enable path.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    enabled: bool,
    shift: u32,
    avg_i: f32,
    avg_q: f32,
    primed: bool,
}

impl DcBlocker {
    /// `shift` is the EMA shift exponent (`iq_dc_shift` in §3), 6-15: smaller shifts track DC
    /// faster at the cost of leaking more low-frequency signal energy into the estimate.
    pub fn new(enabled: bool, shift: u32) -> Self {
        assert!((6..=15).contains(&shift), "iq_dc_shift must be in 6..=15");
        Self {
            enabled,
            shift,
            avg_i: 0.0,
            avg_q: 0.0,
            primed: false,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled && !self.enabled {
            self.primed = false;
        }
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Changes the EMA shift exponent at runtime (consumer API "IQ-DC shift"); re-primes the
    /// estimator since the old average was accumulated at a different time constant.
    pub fn set_shift(&mut self, shift: u32) {
        assert!((6..=15).contains(&shift), "iq_dc_shift must be in 6..=15");
        self.shift = shift;
        self.primed = false;
    }

    pub fn shift(&self) -> u32 {
        self.shift
    }

    pub fn reset(&mut self) {
        self.avg_i = 0.0;
        self.avg_q = 0.0;
        self.primed = false;
    }

    /// Removes the DC estimate from `block` in place. Returns the pre-charge gain retarget factor
    /// (1.0 unless this is the first processed block after enabling, in which case it reports how
    /// much apparent signal level the precharge step removed so the caller can retarget FM-AGC).
    pub fn process_block(&mut self, block: &mut [Complex32]) -> f32 {
        if !self.enabled || block.is_empty() {
            return 1.0;
        }

        let n = block.len() as f32;
        let mean_i = block.iter().map(|s| s.re).sum::<f32>() / n;
        let mean_q = block.iter().map(|s| s.im).sum::<f32>() / n;

        let mut retarget = 1.0;
        if !self.primed {
            self.avg_i = mean_i;
            self.avg_q = mean_q;
            self.primed = true;
            let removed = (mean_i * mean_i + mean_q * mean_q).sqrt();
            retarget = (1.0 - removed).max(0.25);
        }
        else {
            let alpha = 1.0 / (1u32 << self.shift) as f32;
            self.avg_i += alpha * (mean_i - self.avg_i);
            self.avg_q += alpha * (mean_q - self.avg_q);
        }

        for sample in block.iter_mut() {
            sample.re -= self.avg_i;
            sample.im -= self.avg_q;
        }

        retarget
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::DcBlocker;

    #[test]
    fn removes_constant_offset() {
        let mut blocker = DcBlocker::new(true, 8);
        let mut block: Vec<Complex32> = (0..64)
            .map(|i| Complex32::new(0.3 + 0.01 * (i as f32).sin(), -0.2))
            .collect();
        blocker.process_block(&mut block);
        blocker.process_block(&mut block);
        let mean_i: f32 = block.iter().map(|s| s.re).sum::<f32>() / block.len() as f32;
        let mean_q: f32 = block.iter().map(|s| s.im).sum::<f32>() / block.len() as f32;
        assert!(mean_i.abs() < 0.05);
        assert!(mean_q.abs() < 0.05);
    }

    #[test]
    fn disabled_is_passthrough() {
        let mut blocker = DcBlocker::new(false, 8);
        let mut block = vec![Complex32::new(0.5, 0.5); 8];
        let before = block.clone();
        blocker.process_block(&mut block);
        assert_eq!(block, before);
    }
}
