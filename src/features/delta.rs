//! Centered regression deltas over a coefficient sequence.

/// Regression half-width: each delta spans 2 * DELTA_WIDTH + 1 frames.
pub const DELTA_WIDTH: usize = 4;

/// Delta of a row-major `frames x dim` sequence. Edges replicate the boundary
/// frame, so the output has the same shape as the input.
pub fn delta(data: &[f32], frames: usize, dim: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; frames * dim];
    if frames == 0 {
        return out;
    }
    let denom: f32 = 2.0 * (1..=DELTA_WIDTH).map(|n| (n * n) as f32).sum::<f32>();
    let last = frames - 1;
    for t in 0..frames {
        for n in 1..=DELTA_WIDTH {
            let ahead = (t + n).min(last);
            let behind = t.saturating_sub(n);
            let weight = n as f32 / denom;
            for d in 0..dim {
                out[t * dim + d] += weight * (data[ahead * dim + d] - data[behind * dim + d]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_ramp_has_unit_slope_inside() {
        let data: Vec<f32> = (0..20).map(|t| t as f32).collect();
        let d = delta(&data, 20, 1);
        for t in DELTA_WIDTH..20 - DELTA_WIDTH {
            assert!((d[t] - 1.0).abs() < 1e-6, "t={t} d={}", d[t]);
        }
    }

    #[test]
    fn constant_sequence_has_zero_delta() {
        let data = vec![3.0f32; 30];
        assert!(delta(&data, 10, 3).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_input_is_empty() {
        assert!(delta(&[], 0, 13).is_empty());
    }
}
