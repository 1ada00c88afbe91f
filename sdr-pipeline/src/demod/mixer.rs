//! Software mixer: `full_demod` stage 3, undoes the Device Adapter's ingest-time fs/4 rotation.

use num_complex::Complex32;

/// Multiplies by `(-j)^n`, the inverse of the ingest-time `(+1, +j, -1, -j, ...)` rotation, so the
/// channel of interest returns to true baseband after decimation.
#[derive(Debug, Clone, Default)]
pub struct Fs4Mixer {
    phase: u8,
}

impl Fs4Mixer {
    pub fn reset(&mut self) {
        self.phase = 0;
    }

    pub fn process_block(&mut self, block: &mut [Complex32]) {
        for sample in block.iter_mut() {
            *sample = match self.phase {
                0 => *sample,
                1 => Complex32::new(sample.im, -sample.re),
                2 => -*sample,
                _ => Complex32::new(-sample.im, sample.re),
            };
            self.phase = (self.phase + 1) % 4;
        }
    }
}

#[cfg(test)]
mod tests {
    use num_complex::Complex32;

    use super::Fs4Mixer;

    #[test]
    fn undoes_fixed_rotation_sequence() {
        // simulate the ingest-side rotation (+1, +j, -1, -j, ...) applied to a constant sample,
        // then verify the mixer's inverse rotation restores the original value exactly.
        let original = Complex32::new(0.5, -0.25);
        let rotated: Vec<Complex32> = (0..8)
            .map(|n| {
                let twiddle = match n % 4 {
                    0 => Complex32::new(1.0, 0.0),
                    1 => Complex32::new(0.0, 1.0),
                    2 => Complex32::new(-1.0, 0.0),
                    _ => Complex32::new(0.0, -1.0),
                };
                original * twiddle
            })
            .collect();

        let mut mixer = Fs4Mixer::default();
        let mut block = rotated;
        mixer.process_block(&mut block);
        for sample in block {
            assert!((sample.re - original.re).abs() < 1e-6);
            assert!((sample.im - original.im).abs() < 1e-6);
        }
    }
}
