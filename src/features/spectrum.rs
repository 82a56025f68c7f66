//! Short-time power spectrum: periodic Hann window, centered frames.

use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Number of frames produced for a signal of `len` samples with centered framing.
#[inline]
pub fn frame_count(len: usize, hop: usize) -> usize {
    1 + len / hop
}

/// Periodic Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|k| 0.5 - 0.5 * (2.0 * PI * k as f32 / n as f32).cos())
        .collect()
}

/// Frames a signal and returns per-frame power spectra (`fft_size / 2 + 1` bins).
pub struct PowerSpectrum {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    fft_size: usize,
    hop: usize,
}

impl PowerSpectrum {
    pub fn new(fft_size: usize, hop: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(fft_size),
            window: hann_window(fft_size),
            fft_size,
            hop,
        }
    }

    pub fn bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Call `sink` once per frame, in time order, with that frame's power spectrum.
    /// Frames are centered: the signal is zero-padded by half a window on each side.
    pub fn for_each_frame(&self, signal: &[f32], mut sink: impl FnMut(&[f32])) {
        let half = self.fft_size / 2;
        let mut buf = vec![Complex::new(0.0f32, 0.0); self.fft_size];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.fft.get_inplace_scratch_len()];
        let mut power = vec![0.0f32; self.bins()];

        for frame in 0..frame_count(signal.len(), self.hop) {
            let origin = frame * self.hop;
            for (k, slot) in buf.iter_mut().enumerate() {
                let sample = (origin + k)
                    .checked_sub(half)
                    .and_then(|idx| signal.get(idx))
                    .copied()
                    .unwrap_or(0.0);
                *slot = Complex::new(sample * self.window[k], 0.0);
            }
            self.fft.process_with_scratch(&mut buf, &mut scratch);
            for (p, c) in power.iter_mut().zip(&buf) {
                *p = c.norm_sqr();
            }
            sink(&power);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_count_matches_centered_framing() {
        assert_eq!(frame_count(0, 256), 1);
        assert_eq!(frame_count(16_000, 256), 63);
        assert_eq!(frame_count(4_800, 256), 19);
    }

    #[test]
    fn hann_is_periodic() {
        let w = hann_window(8);
        assert_eq!(w[0], 0.0);
        assert!((w[4] - 1.0).abs() < 1e-6);
        assert!((w[1] - w[7]).abs() < 1e-6);
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let spectrum = PowerSpectrum::new(512, 256);
        let bin = 32usize;
        let signal: Vec<f32> = (0..2048)
            .map(|n| (2.0 * PI * bin as f32 * n as f32 / 512.0).sin())
            .collect();
        let mut peaks = Vec::new();
        spectrum.for_each_frame(&signal, |power| {
            let (idx, _) = power
                .iter()
                .enumerate()
                .fold((0, 0.0f32), |best, (i, &p)| if p > best.1 { (i, p) } else { best });
            peaks.push(idx);
        });
        assert_eq!(peaks.len(), 9);
        assert_eq!(peaks[4], bin);
    }
}
