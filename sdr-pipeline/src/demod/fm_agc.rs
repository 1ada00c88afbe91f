//! FM AGC + limiter: `full_demod` stage 5.

use num_complex::Complex32;

#[derive(Debug, Clone)]
pub struct FmAgc {
    enabled: bool,
    target_rms: f32,
    min_rms: f32,
    alpha_up: f32,
    alpha_down: f32,
    gain: f32,
    limiter_enabled: bool,
}

impl FmAgc {
    pub const GAIN_MIN: f32 = 1.0 / 8.0;
    pub const GAIN_MAX: f32 = 8.0;

    pub fn new(target_rms: f32, min_rms: f32, alpha_up: f32, alpha_down: f32) -> Self {
        Self {
            enabled: true,
            target_rms,
            min_rms,
            alpha_up,
            alpha_down,
            gain: 1.0,
            limiter_enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_limiter_enabled(&mut self, enabled: bool) {
        self.limiter_enabled = enabled;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Retargets the current gain directly; used when the DC blocker's precharge step removes
    /// apparent signal level that the AGC would otherwise have to re-chase over several blocks
    /// (§4.3 stage 1).
    pub fn retarget(&mut self, factor: f32) {
        self.gain = (self.gain / factor.max(1e-6)).clamp(Self::GAIN_MIN, Self::GAIN_MAX);
    }

    pub fn reset(&mut self) {
        self.gain = 1.0;
    }

    pub fn process_block(&mut self, block: &mut [Complex32]) {
        if !self.enabled || block.is_empty() {
            return;
        }

        let rms = {
            let sum_sq: f32 = block.iter().map(|s| s.norm_sqr()).sum();
            (sum_sq / block.len() as f32).sqrt()
        };

        let target_gain = self.target_rms / rms.max(self.min_rms);
        let alpha = if target_gain > self.gain {
            self.alpha_up
        }
        else {
            self.alpha_down
        };
        self.gain += alpha * (target_gain - self.gain);
        self.gain = self.gain.clamp(Self::GAIN_MIN, Self::GAIN_MAX);

        for sample in block.iter_mut() {
            *sample *= self.gain;
            if self.limiter_enabled {
                let mag = sample.norm();
                if mag > 1.0 {
                    *sample /= mag;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::FmAgc;

    #[test]
    fn boosts_weak_signal_towards_target() {
        let mut agc = FmAgc::new(0.5, 0.01, 0.5, 0.2);
        let mut block = vec![Complex32::new(0.05, 0.0); 64];
        for _ in 0..20 {
            agc.process_block(&mut block.clone());
        }
        assert!(agc.gain() > 1.0);
    }

    #[test]
    fn limiter_clamps_magnitude() {
        let mut agc = FmAgc::new(0.5, 0.01, 1.0, 1.0);
        agc.set_limiter_enabled(true);
        let mut block = vec![Complex32::new(5.0, 5.0); 8];
        agc.process_block(&mut block);
        for sample in block {
            assert!(sample.norm() <= 1.0 + 1e-4);
        }
    }

    #[test]
    fn gain_stays_within_clamp_bounds() {
        let mut agc = FmAgc::new(0.5, 0.001, 1.0, 1.0);
        let mut silent = vec![Complex32::new(0.0, 0.0); 32];
        for _ in 0..10 {
            agc.process_block(&mut silent);
        }
        assert!(agc.gain() <= FmAgc::GAIN_MAX && agc.gain() >= FmAgc::GAIN_MIN);
    }
}
