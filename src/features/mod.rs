//! PCM → MFCC feature matrices (13 cepstral coefficients plus delta and delta²).

pub mod delta;
pub mod mel;
pub mod spectrum;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audio::volume::peak;
use crate::config::EngineConfig;
use crate::profile::TrainError;
use crate::{FEATURE_DIM, FFT_SIZE, HOP_SIZE, N_MELS, N_MFCC};

use mel::{dct_basis, power_to_db, MelFilterbank};
use spectrum::PowerSpectrum;

/// Row-major `frames x dim` matrix of per-frame feature vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMatrix")]
pub struct FeatureMatrix {
    frames: usize,
    dim: usize,
    data: Vec<f32>,
}

#[derive(Deserialize)]
struct RawMatrix {
    frames: usize,
    dim: usize,
    data: Vec<f32>,
}

impl TryFrom<RawMatrix> for FeatureMatrix {
    type Error = String;

    fn try_from(raw: RawMatrix) -> Result<Self, Self::Error> {
        FeatureMatrix::from_vec(raw.data, raw.frames, raw.dim)
    }
}

impl FeatureMatrix {
    /// Wrap row-major data. Fails when the buffer does not hold `frames * dim` values.
    pub fn from_vec(data: Vec<f32>, frames: usize, dim: usize) -> Result<Self, String> {
        if dim == 0 {
            return Err("feature dimension must be > 0".into());
        }
        if data.len() != frames * dim {
            return Err(format!(
                "feature data holds {} values, expected {frames} x {dim}",
                data.len()
            ));
        }
        Ok(Self { frames, dim, data })
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    #[inline]
    pub fn frame(&self, index: usize) -> &[f32] {
        &self.data[index * self.dim..(index + 1) * self.dim]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn iter_frames(&self) -> std::slice::ChunksExact<'_, f32> {
        self.data.chunks_exact(self.dim)
    }
}

/// Stateless MFCC extractor. Tables are computed once and never mutated, so a
/// single instance is shared across threads.
pub struct FeatureExtractor {
    sample_rate: u32,
    spectrum: PowerSpectrum,
    filterbank: MelFilterbank,
    dct: Vec<f32>,
}

impl FeatureExtractor {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            spectrum: PowerSpectrum::new(FFT_SIZE, HOP_SIZE),
            filterbank: MelFilterbank::new(sample_rate, FFT_SIZE, N_MELS),
            dct: dct_basis(N_MELS, N_MFCC),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Compute the 39-dimensional feature matrix of a mono clip.
    pub fn extract(&self, samples: &[f32]) -> FeatureMatrix {
        let scale = match peak(samples) {
            p if p > 0.0 => 1.0 / p,
            _ => 1.0,
        };
        let signal: Vec<f32> = samples.iter().map(|&s| s * scale).collect();

        let n_mels = self.filterbank.n_mels();
        let mut mel_db = Vec::new();
        let mut band = vec![0.0f32; n_mels];
        self.spectrum.for_each_frame(&signal, |power| {
            self.filterbank.apply(power, &mut band);
            mel_db.extend_from_slice(&band);
        });
        let frames = mel_db.len() / n_mels;
        power_to_db(&mut mel_db);

        let mut mfcc = Vec::with_capacity(frames * N_MFCC);
        for row in mel_db.chunks_exact(n_mels) {
            for k in 0..N_MFCC {
                let basis = &self.dct[k * n_mels..(k + 1) * n_mels];
                mfcc.push(basis.iter().zip(row).map(|(b, x)| b * x).sum::<f32>());
            }
        }

        let d1 = delta::delta(&mfcc, frames, N_MFCC);
        let d2 = delta::delta(&d1, frames, N_MFCC);

        let mut data = Vec::with_capacity(frames * FEATURE_DIM);
        for t in 0..frames {
            let span = t * N_MFCC..(t + 1) * N_MFCC;
            data.extend_from_slice(&mfcc[span.clone()]);
            data.extend_from_slice(&d1[span.clone()]);
            data.extend_from_slice(&d2[span]);
        }

        debug!(samples = samples.len(), frames, "features extracted");
        FeatureMatrix {
            frames,
            dim: FEATURE_DIM,
            data,
        }
    }

    /// Like [`extract`](Self::extract), but rejects clips shorter than `min_secs`.
    pub fn extract_training(
        &self,
        samples: &[f32],
        min_secs: f32,
    ) -> Result<FeatureMatrix, TrainError> {
        let duration_secs = samples.len() as f32 / self.sample_rate as f32;
        if duration_secs < min_secs {
            return Err(TrainError::TooShort {
                duration_secs,
                min_secs,
            });
        }
        Ok(self.extract(samples))
    }
}
