//! Length-normalized elastic distance between a live feature matrix and a
//! reference template.

pub mod dtw;

use crate::features::FeatureMatrix;
use crate::MIN_FRAMES;

/// Distance between two feature matrices. `+inf` means "cannot match".
pub trait Matcher: Send + Sync {
    fn distance(&self, live: &FeatureMatrix, reference: &FeatureMatrix) -> f32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Exact,
    Fast { radius: usize },
}

/// DTW matcher; the accumulated path cost is divided by the reference length.
#[derive(Debug, Clone, Copy)]
pub struct DtwMatcher {
    alignment: Alignment,
}

impl DtwMatcher {
    pub fn exact() -> Self {
        Self {
            alignment: Alignment::Exact,
        }
    }

    pub fn fast(radius: usize) -> Self {
        Self {
            alignment: Alignment::Fast {
                radius: radius.max(1),
            },
        }
    }

    pub fn alignment(&self) -> Alignment {
        self.alignment
    }
}

impl Default for DtwMatcher {
    fn default() -> Self {
        Self::fast(1)
    }
}

impl Matcher for DtwMatcher {
    fn distance(&self, live: &FeatureMatrix, reference: &FeatureMatrix) -> f32 {
        if live.frames() < MIN_FRAMES || reference.frames() < MIN_FRAMES {
            return f32::INFINITY;
        }
        if live.dim() != reference.dim() {
            return f32::INFINITY;
        }
        if !live.as_slice().iter().all(|v| v.is_finite())
            || !reference.as_slice().iter().all(|v| v.is_finite())
        {
            return f32::INFINITY;
        }

        let dim = live.dim();
        let alignment = match self.alignment {
            Alignment::Exact => dtw::exact(live.as_slice(), reference.as_slice(), dim),
            Alignment::Fast { radius } => {
                dtw::fast(live.as_slice(), reference.as_slice(), dim, radius)
            }
        };

        let normalized = (alignment.cost / reference.frames() as f64) as f32;
        if normalized.is_finite() {
            normalized
        } else {
            f32::INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureExtractor;

    fn tone(len: usize, freq: f32) -> Vec<f32> {
        (0..len)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32 / 16_000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn self_distance_is_zero() {
        let fx = FeatureExtractor::new(16_000);
        let m = fx.extract(&tone(8_000, 440.0));
        assert_eq!(DtwMatcher::exact().distance(&m, &m), 0.0);
        assert_eq!(DtwMatcher::fast(1).distance(&m, &m), 0.0);
    }

    #[test]
    fn short_matrices_never_match() {
        let fx = FeatureExtractor::new(16_000);
        let short = fx.extract(&tone(1_000, 440.0));
        assert!(short.frames() < MIN_FRAMES);
        let long = fx.extract(&tone(8_000, 440.0));
        assert_eq!(DtwMatcher::default().distance(&short, &long), f32::INFINITY);
        assert_eq!(DtwMatcher::default().distance(&long, &short), f32::INFINITY);
    }

    #[test]
    fn different_sounds_are_farther_than_same() {
        let fx = FeatureExtractor::new(16_000);
        let reference = fx.extract(&tone(8_000, 440.0));
        let same = fx.extract(&tone(9_000, 440.0));
        let other = fx.extract(&tone(8_000, 2_500.0));
        let m = DtwMatcher::default();
        assert!(m.distance(&same, &reference) < m.distance(&other, &reference));
    }

    #[test]
    fn fast_is_an_upper_bound_of_exact() {
        let fx = FeatureExtractor::new(16_000);
        let reference = fx.extract(&tone(8_000, 440.0));
        let mut sweep = tone(4_000, 440.0);
        sweep.extend(tone(6_000, 880.0));
        let live = fx.extract(&sweep);
        let exact = DtwMatcher::exact().distance(&live, &reference);
        let fast = DtwMatcher::fast(1).distance(&live, &reference);
        assert!(fast >= exact);
    }

    #[test]
    fn non_finite_input_is_infinite() {
        let nan = FeatureMatrix::from_vec(vec![f32::NAN; 10 * 2], 10, 2).unwrap();
        let ok = FeatureMatrix::from_vec(vec![0.0; 10 * 2], 10, 2).unwrap();
        assert_eq!(DtwMatcher::exact().distance(&nan, &ok), f32::INFINITY);
    }
}
