//! Slaney-style mel filterbank, power-to-dB conversion and orthonormal DCT-II.

use std::f64::consts::PI;

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

/// Triangular mel filters spanning 0 Hz to Nyquist, area-normalized.
pub struct MelFilterbank {
    n_mels: usize,
    n_bins: usize,
    /// Row-major `n_mels x n_bins`.
    weights: Vec<f32>,
}

impl MelFilterbank {
    pub fn new(sample_rate: u32, fft_size: usize, n_mels: usize) -> Self {
        let n_bins = fft_size / 2 + 1;
        let nyquist = sample_rate as f64 / 2.0;
        let fft_freqs: Vec<f64> = (0..n_bins)
            .map(|k| k as f64 * sample_rate as f64 / fft_size as f64)
            .collect();

        let max_mel = hz_to_mel(nyquist);
        let mel_points: Vec<f64> = (0..n_mels + 2)
            .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
            .collect();

        let mut weights = vec![0.0f32; n_mels * n_bins];
        for m in 0..n_mels {
            let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
            let enorm = 2.0 / (right - left);
            for (k, &f) in fft_freqs.iter().enumerate() {
                let lower = (f - left) / (center - left);
                let upper = (right - f) / (right - center);
                let w = lower.min(upper).max(0.0);
                weights[m * n_bins + k] = (w * enorm) as f32;
            }
        }

        Self {
            n_mels,
            n_bins,
            weights,
        }
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Project a power spectrum onto the mel bands.
    pub fn apply(&self, power: &[f32], out: &mut [f32]) {
        debug_assert_eq!(power.len(), self.n_bins);
        for (m, slot) in out.iter_mut().enumerate().take(self.n_mels) {
            let row = &self.weights[m * self.n_bins..(m + 1) * self.n_bins];
            *slot = row.iter().zip(power).map(|(w, p)| w * p).sum();
        }
    }
}

const AMIN: f32 = 1e-10;
const TOP_DB: f32 = 80.0;

/// Convert mel power to dB (reference 1.0) in place, then floor every value at
/// `max - 80 dB` across the whole matrix.
pub fn power_to_db(values: &mut [f32]) {
    let mut max_db = f32::NEG_INFINITY;
    for v in values.iter_mut() {
        *v = 10.0 * v.max(AMIN).log10();
        max_db = max_db.max(*v);
    }
    let floor = max_db - TOP_DB;
    for v in values.iter_mut() {
        *v = v.max(floor);
    }
}

/// Orthonormal DCT-II basis, row-major `n_out x n_in`.
pub fn dct_basis(n_in: usize, n_out: usize) -> Vec<f32> {
    let mut basis = Vec::with_capacity(n_in * n_out);
    let n = n_in as f64;
    for k in 0..n_out {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        for i in 0..n_in {
            let angle = PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n);
            basis.push((scale * angle.cos()) as f32);
        }
    }
    basis
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mel_scale_roundtrips() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hz(hz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        assert!((hz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn filters_are_non_negative_and_cover_midband() {
        let bank = MelFilterbank::new(16_000, 512, 40);
        assert!(bank.weights.iter().all(|&w| w >= 0.0));
        let mut out = vec![0.0; 40];
        let mut power = vec![0.0; 257];
        power[64] = 1.0;
        bank.apply(&power, &mut out);
        assert!(out.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn db_floor_is_top_db_below_peak() {
        let mut values = vec![1.0, 1e-12, 0.0];
        power_to_db(&mut values);
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], -80.0);
        assert_eq!(values[2], -80.0);
    }

    #[test]
    fn dct_of_constant_has_only_dc() {
        let basis = dct_basis(8, 4);
        let input = [1.0f32; 8];
        let coeffs: Vec<f32> = (0..4)
            .map(|k| basis[k * 8..(k + 1) * 8].iter().zip(&input).map(|(b, x)| b * x).sum())
            .collect();
        assert!((coeffs[0] - 8f32.sqrt()).abs() < 1e-5);
        assert!(coeffs[1..].iter().all(|c| c.abs() < 1e-5));
    }
}
