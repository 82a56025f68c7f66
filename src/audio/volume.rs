//! Volume measures used by the arbiter's gate.

/// Root-mean-square of f32 samples. Samples are full-scale normalized, so the
/// result is already a 0..1 volume.
#[inline]
pub fn normalized_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = s as f64;
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Largest absolute sample value.
#[inline]
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, &s| acc.max(s.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_zero() {
        assert_eq!(normalized_rms(&[0.0; 64]), 0.0);
        assert_eq!(normalized_rms(&[]), 0.0);
    }

    #[test]
    fn square_wave_rms_equals_amplitude() {
        let wave: Vec<f32> = (0..100).map(|i| if i % 2 == 0 { 0.5 } else { -0.5 }).collect();
        assert!((normalized_rms(&wave) - 0.5).abs() < 1e-6);
        assert_eq!(peak(&wave), 0.5);
    }
}
