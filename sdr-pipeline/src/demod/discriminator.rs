//! Polar discriminator + deemphasis + audio LPF: `full_demod` stage 9 (FM path only).

use num_complex::Complex32;

/// `y[n] = arg(x[n] * conj(x[n-1])) / pi`, per §4.3 stage 9.
#[derive(Debug, Clone, Default)]
pub struct PolarDiscriminator {
    prev: Complex32,
}

impl PolarDiscriminator {
    pub fn reset(&mut self) {
        self.prev = Complex32::new(0.0, 0.0);
    }

    pub fn process_block(&mut self, input: &[Complex32], output: &mut Vec<f32>) {
        output.clear();
        output.reserve(input.len());
        for &sample in input {
            let angle = (sample * self.prev.conj()).arg();
            output.push(angle / std::f32::consts::PI);
            self.prev = sample;
        }
    }
}

/// One-pole deemphasis filter, τ ∈ {50, 75, 750} µs (§3 FM path, §4.3 stage 9).
#[derive(Debug, Clone)]
pub struct Deemphasis {
    alpha: f32,
    state: f32,
}

impl Deemphasis {
    /// `tau_us` is the deemphasis time constant in microseconds (50/75/750 are the standard
    /// values); `sample_rate_hz` is the rate at which `process_block` is called.
    pub fn new(tau_us: f32, sample_rate_hz: f32) -> Self {
        let dt = 1.0 / sample_rate_hz;
        let tau_s = tau_us / 1_000_000.0;
        let alpha = dt / (tau_s + dt);
        Self { alpha, state: 0.0 }
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }

    pub fn process_block(&mut self, block: &mut [f32]) {
        for sample in block.iter_mut() {
            self.state += self.alpha * (*sample - self.state);
            *sample = self.state;
        }
    }
}

/// One-pole audio low-pass, configured by cutoff frequency rather than time constant.
#[derive(Debug, Clone)]
pub struct AudioLpf {
    enabled: bool,
    alpha: f32,
    state: f32,
}

impl AudioLpf {
    pub fn new(cutoff_hz: f32, sample_rate_hz: f32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate_hz;
        Self {
            enabled: true,
            alpha: dt / (rc + dt),
            state: 0.0,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn reset(&mut self) {
        self.state = 0.0;
    }

    pub fn process_block(&mut self, block: &mut [f32]) {
        if !self.enabled {
            return;
        }
        for sample in block.iter_mut() {
            self.state += self.alpha * (*sample - self.state);
            *sample = self.state;
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::{
        Deemphasis,
        PolarDiscriminator,
    };

    #[test]
    fn constant_frequency_offset_yields_steady_discriminator_output() {
        // a tone offset from center produces a constant per-sample phase increment, so the
        // discriminator should settle to a constant (non-zero) output value.
        let mut disc = PolarDiscriminator::default();
        let step = 0.2_f32;
        let input: Vec<Complex32> = (0..32)
            .map(|n| {
                let theta = step * n as f32;
                Complex32::new(theta.cos(), theta.sin())
            })
            .collect();
        let mut out = Vec::new();
        disc.process_block(&input, &mut out);
        let tail = &out[4..];
        let first = tail[0];
        for value in tail {
            assert!((value - first).abs() < 1e-4);
        }
    }

    #[test]
    fn deemphasis_smooths_step_input() {
        let mut deemph = Deemphasis::new(75.0, 48_000.0);
        let mut block = vec![1.0f32; 64];
        deemph.process_block(&mut block);
        assert!(block[0] < block[block.len() - 1]);
        assert!((block[block.len() - 1] - 1.0).abs() < 0.05);
    }
}
