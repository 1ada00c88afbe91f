//! Device Adapter ingest glue (C1, §4.1): the per-block callback that turns raw I/Q samples from
//! a `Backend` into normalized interleaved floats in the Input Ring.
//!
//! Grounding note: generalizes the teacher's block-handler loop
//! (`rtlsdr-async::sampling::{spawn_reader_thread, read_to_buffer}`) from "read into a shared
//! buffer queue" to "apply mute/rotate/normalize, then push into the bounded SPSC `InputRing`",
//! carrying `mute_remaining` and `rotate_phase` across callback invocations the same way the
//! teacher's reader thread carries its buffer across `read_to_buffer` calls. Samples already
//! arrive as [`rtlsdr_async::Iq`] pairs (not raw bytes) because the Device Adapter's `Backend`
//! trait hands back a typed `Samples<Iq>` stream rather than a byte buffer — `Iq`'s existing
//! `From<Iq> for Complex32` impl already computes `(value − 127.5) / 127.5`, the same centered
//! normalization §4.1 describes, so it is reused as-is rather than reimplemented here.

use std::sync::{
    Arc,
    atomic::{
        AtomicU64,
        AtomicUsize,
        Ordering,
    },
};

use futures_util::StreamExt;
use num_complex::Complex32;
use rtlsdr_async::Backend;
use tokio_util::sync::CancellationToken;

use crate::ring::InputRing;

/// Carries ingest-time state across callback invocations: how many more samples to mute (zero
/// out) after a retune, and the fs/4 rotation phase (§4.1 steps 1, 3).
struct IngestState {
    mute_remaining: usize,
    rotate_phase: u8,
    rotate_enabled: bool,
}

impl IngestState {
    fn process_block(&mut self, samples: &[rtlsdr_async::Iq], scratch: &mut Vec<f32>) {
        scratch.clear();
        scratch.reserve(samples.len() * 2);

        for &iq in samples {
            let mut sample: Complex32 = if self.mute_remaining > 0 {
                self.mute_remaining -= 1;
                Complex32::new(0.0, 0.0)
            }
            else {
                iq.into()
            };

            if self.rotate_enabled {
                sample = match self.rotate_phase {
                    0 => sample,
                    1 => Complex32::new(-sample.im, sample.re),
                    2 => -sample,
                    _ => Complex32::new(sample.im, -sample.re),
                };
                self.rotate_phase = (self.rotate_phase + 1) % 4;
            }

            scratch.push(sample.re);
            scratch.push(sample.im);
        }
    }
}

/// Counters exposed to the consumer API / diagnostics (§4.1 "Failure semantics").
#[derive(Debug, Default)]
pub struct IngestStats {
    pub blocks_received: AtomicU64,
    pub read_errors: AtomicU64,
}

/// Cross-thread mailbox the Controller uses to re-arm the mute countdown after every retune or
/// hop (§4.1 step 1: "Mute is used to flush tuner transients after retunes"). A plain `AtomicUsize`
/// is enough since there is only ever one writer (the Controller thread) and one reader (the
/// ingest task); a later-arriving rearm always wins over a partially-consumed earlier one because
/// the ingest loop takes the max of what's left and what's requested.
#[derive(Debug, Default)]
pub struct MuteRearm(AtomicUsize);

impl MuteRearm {
    pub fn request(&self, samples: usize) {
        self.0.store(samples, Ordering::Release);
    }

    fn take(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }
}

/// Runs the ingest loop until the backend's sample stream ends or `shutdown` is cancelled.
/// Spawned as a tokio task (T1 in §5) rather than a dedicated OS thread, since `Backend::samples`
/// is itself `async` — unlike the teacher's USB path, which has its own blocking reader thread
/// underneath that this code never has to manage directly.
pub async fn run<B: Backend>(
    backend: Arc<B>,
    input_ring: Arc<InputRing>,
    rotate_enabled: bool,
    mute_samples: usize,
    mute_rearm: Arc<MuteRearm>,
    stats: Arc<IngestStats>,
    shutdown: CancellationToken,
) {
    let mut state = IngestState {
        mute_remaining: mute_samples,
        rotate_phase: 0,
        rotate_enabled,
    };

    let stream = match backend.samples().await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "failed to open device sample stream");
            return;
        }
    };
    tokio::pin!(stream);

    let mut scratch = Vec::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        stats.blocks_received.fetch_add(1, Ordering::Relaxed);
                        let rearm = mute_rearm.take();
                        if rearm > state.mute_remaining {
                            state.mute_remaining = rearm;
                        }
                        state.process_block(chunk.samples(), &mut scratch);
                        let written = input_ring.write_block(scratch.iter().copied(), scratch.len());
                        if written < scratch.len() {
                            tracing::trace!(dropped = scratch.len() - written, "input ring full, dropped block");
                        }
                    }
                    Some(Err(error)) => {
                        stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(?error, "device read error");
                    }
                    None => {
                        tracing::debug!("device sample stream ended");
                        break;
                    }
                }
            }
        }
    }
}

/// Computes how many leading samples to mute after open or after a retune (§4.1 step 1, §4.4
/// step 2's "flush tuner transients"); used both for the ingest task's initial mute budget and
/// as the `Controller`'s `MuteRearm::request` amount. Mirrors the spec's byte-count mute
/// parameter translated into I/Q sample units, since ingest here operates on typed `Iq` pairs
/// rather than raw bytes.
pub fn retune_mute_samples(capture_rate_hz: u32) -> usize {
    // ~10 ms of settling time at the capture rate, matching the driver-transient flush the
    // teacher's own retune path allows for.
    (capture_rate_hz as usize) / 100
}

#[cfg(test)]
mod tests {
    use rtlsdr_async::Iq;

    use super::IngestState;

    #[test]
    fn mute_zeros_leading_samples_then_passes_through() {
        let mut state = IngestState {
            mute_remaining: 2,
            rotate_phase: 0,
            rotate_enabled: false,
        };
        let samples = vec![Iq { i: 255, q: 0 }; 4];
        let mut out = Vec::new();
        state.process_block(&samples, &mut out);
        assert_eq!(&out[0..4], &[0.0, 0.0, 0.0, 0.0]);
        assert!(out[4] > 0.9);
    }

    #[test]
    fn rotation_cycles_every_four_samples() {
        let mut state = IngestState {
            mute_remaining: 0,
            rotate_phase: 0,
            rotate_enabled: true,
        };
        let samples = vec![Iq { i: 255, q: 128 }; 8];
        let mut out = Vec::new();
        state.process_block(&samples, &mut out);
        // after a full 4-sample cycle the rotation phase returns to 0, so samples 0 and 4
        // (both pre-rotation-identical inputs) come out identical.
        assert_eq!(out[0], out[8]);
        assert_eq!(out[1], out[9]);
    }
}
