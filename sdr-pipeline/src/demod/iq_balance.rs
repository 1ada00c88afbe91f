//! Static I/Q gain/phase balance trim (§6 consumer API "IQ-balance enable"), applied immediately
//! after DC blocking and before the halfband cascade.
//!
//! Disabled by default; unlike the DC blocker (which tracks a slowly-varying offset on its own)
//! this corrects a *fixed* gain/phase skew between the I and Q rails, so it only ever carries the
//! trim values the consumer API sets — there is no blind estimator here.

use num_complex::Complex32;

#[derive(Debug, Clone, Copy)]
pub struct IqBalance {
    enabled: bool,
    gain_correction: f32,
    phase_correction: f32,
}

impl Default for IqBalance {
    fn default() -> Self {
        Self {
            enabled: false,
            gain_correction: 1.0,
            phase_correction: 0.0,
        }
    }
}

impl IqBalance {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// `gain_correction` is a multiplicative trim on the Q rail (1.0 = no change);
    /// `phase_correction_rad` is a small-angle skew correction subtracted from Q using I.
    pub fn set_trim(&mut self, gain_correction: f32, phase_correction_rad: f32) {
        self.gain_correction = gain_correction;
        self.phase_correction = phase_correction_rad;
    }

    pub fn process_block(&self, block: &mut [Complex32]) {
        if !self.enabled {
            return;
        }
        for sample in block.iter_mut() {
            sample.im = sample.im * self.gain_correction - sample.re * self.phase_correction;
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::IqBalance;

    #[test]
    fn disabled_balance_leaves_samples_untouched() {
        let balance = IqBalance::new(false);
        let mut block = [Complex32::new(0.5, 0.25)];
        balance.process_block(&mut block);
        assert_eq!(block[0], Complex32::new(0.5, 0.25));
    }

    #[test]
    fn gain_trim_scales_the_q_rail() {
        let mut balance = IqBalance::new(true);
        balance.set_trim(2.0, 0.0);
        let mut block = [Complex32::new(0.5, 0.25)];
        balance.process_block(&mut block);
        assert_eq!(block[0], Complex32::new(0.5, 0.5));
    }
}
