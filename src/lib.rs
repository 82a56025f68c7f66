//! soundtrigger: launch a program when a recorded reference sound recurs.
//! Library: capture → sliding window → MFCC features → DTW matching →
//! gated arbitration → asynchronous dispatch.

pub mod arbiter;
pub mod audio;
pub mod cancellation;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod events;
pub mod features;
pub mod history;
pub mod matcher;
pub mod metrics;
pub mod persistence;
pub mod profile;
pub mod state_machine;
pub mod store;

/// Cepstral coefficients per frame.
pub const N_MFCC: usize = 13;
/// Feature vector length: coefficients, delta, delta².
pub const FEATURE_DIM: usize = 3 * N_MFCC;
/// STFT window length in samples.
pub const FFT_SIZE: usize = 512;
/// STFT hop in samples.
pub const HOP_SIZE: usize = 256;
/// Mel bands feeding the cepstrum.
pub const N_MELS: usize = 128;
/// Matrices shorter than this never match.
pub const MIN_FRAMES: usize = 8;

pub use arbiter::{TriggerArbiter, TriggerEvent};
pub use config::EngineConfig;
pub use engine::Engine;
pub use features::{FeatureExtractor, FeatureMatrix};
pub use matcher::{DtwMatcher, Matcher};
pub use profile::{Profile, ProfileId, ProfileSettings};
pub use store::TemplateStore;
