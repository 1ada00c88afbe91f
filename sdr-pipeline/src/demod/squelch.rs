//! Channel squelch: `full_demod` stage 11.

use num_complex::Complex32;

/// Power-threshold squelch with a consecutive-hit debounce before signaling a hop, per §4.3
/// stage 11 / §4.4 hop selection.
#[derive(Debug, Clone)]
pub struct Squelch {
    threshold: f32,
    conseq_squelch: u32,
    consecutive_hits: u32,
    squelched: bool,
    last_power: f32,
}

impl Squelch {
    pub fn new(threshold: f32, conseq_squelch: u32) -> Self {
        Self {
            threshold,
            conseq_squelch,
            consecutive_hits: 0,
            squelched: false,
            last_power: 0.0,
        }
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn is_squelched(&self) -> bool {
        self.squelched
    }

    /// Post-channel-filter power, for soft-squelch decisions (`return_pwr()` in §6).
    pub fn last_power(&self) -> f32 {
        self.last_power
    }

    pub fn reset(&mut self) {
        self.consecutive_hits = 0;
        self.squelched = false;
        self.last_power = 0.0;
    }

    /// Computes post-filter power and updates the debounce counter. Returns `true` exactly once
    /// per transition into the "should hop" state: after `conseq_squelch + 1` consecutive
    /// below-threshold blocks (§8 scenario 4).
    pub fn process_block(&mut self, block: &[Complex32]) -> bool {
        if block.is_empty() {
            return false;
        }
        self.last_power = block.iter().map(|s| s.norm_sqr()).sum::<f32>() / block.len() as f32;

        if self.last_power < self.threshold {
            self.consecutive_hits += 1;
            let was_squelched = self.squelched;
            self.squelched = true;
            return !was_squelched && self.consecutive_hits > self.conseq_squelch;
        }

        self.consecutive_hits = 0;
        self.squelched = false;
        false
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::Squelch;

    #[test]
    fn signals_hop_after_conseq_squelch_plus_one_low_blocks() {
        let mut squelch = Squelch::new(0.5, 3);
        let quiet = vec![Complex32::new(0.01, 0.0); 16];
        let mut hop_signaled_at = None;
        for i in 1..=6 {
            if squelch.process_block(&quiet) {
                hop_signaled_at = Some(i);
                break;
            }
        }
        assert_eq!(hop_signaled_at, Some(4));
    }

    #[test]
    fn strong_signal_resets_debounce() {
        let mut squelch = Squelch::new(0.5, 3);
        let quiet = vec![Complex32::new(0.01, 0.0); 16];
        let loud = vec![Complex32::new(1.0, 0.0); 16];
        squelch.process_block(&quiet);
        squelch.process_block(&quiet);
        squelch.process_block(&loud);
        assert!(!squelch.is_squelched());
        let hop = squelch.process_block(&quiet);
        assert!(!hop);
    }
}
