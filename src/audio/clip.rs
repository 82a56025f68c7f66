//! Training clip I/O: WAV decoding to mono f32 at the engine rate, and WAV
//! writing for recorded clips.

use std::cmp::Ordering as CmpOrdering;
use std::path::Path;

use rubato::{InterpolationParameters, InterpolationType, Resampler, SincFixedIn, WindowFunction};
use tracing::{debug, info};

#[derive(Debug)]
pub enum ClipError {
    Io(std::io::Error),
    Decode(hound::Error),
    Resample(String),
    Empty,
}

impl std::fmt::Display for ClipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipError::Io(e) => write!(f, "clip IO error: {e}"),
            ClipError::Decode(e) => write!(f, "clip decode error: {e}"),
            ClipError::Resample(msg) => write!(f, "clip resample error: {msg}"),
            ClipError::Empty => write!(f, "clip contains no samples"),
        }
    }
}

impl std::error::Error for ClipError {}

impl From<std::io::Error> for ClipError {
    fn from(e: std::io::Error) -> Self {
        ClipError::Io(e)
    }
}

impl From<hound::Error> for ClipError {
    fn from(e: hound::Error) -> Self {
        match e {
            hound::Error::IoError(io) => ClipError::Io(io),
            other => ClipError::Decode(other),
        }
    }
}

/// Decode a WAV file into mono f32 samples at `target_rate`.
pub fn load_wav(path: &Path, target_rate: u32) -> Result<Vec<f32>, ClipError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono: Vec<f32> = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    };
    if mono.is_empty() {
        return Err(ClipError::Empty);
    }

    debug!(
        path = %path.display(),
        rate = spec.sample_rate,
        channels,
        bits = spec.bits_per_sample,
        samples = mono.len(),
        "clip decoded"
    );

    resample(&mono, spec.sample_rate, target_rate)
}

/// Write mono samples as 16-bit PCM WAV.
pub fn save_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), ClipError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample((s.clamp(-1.0, 1.0) * 32_767.0) as i16)?;
    }
    writer.finalize()?;
    info!(path = %path.display(), samples = samples.len(), "clip saved");
    Ok(())
}

/// Sinc resampling from `from_rate` to `to_rate`. Identity when rates match.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, ClipError> {
    if input.is_empty() || from_rate == to_rate {
        return Ok(input.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        return Err(ClipError::Resample(format!(
            "invalid rates {from_rate} Hz -> {to_rate} Hz"
        )));
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let chunk = 256usize;
    let sinc_len = 64usize;
    let params = InterpolationParameters {
        sinc_len,
        f_cutoff: 0.90,
        interpolation: InterpolationType::Cubic,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut rs = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk, 1)
        .map_err(|e| ClipError::Resample(format!("construct resampler: {e:?}")))?;

    // The sinc filter delays its output by half its length.
    let delay = ((sinc_len / 2) as f64 * ratio).round() as usize;
    let expect = ((input.len() as f64) * ratio).round().max(1.0) as usize;
    let mut out = Vec::with_capacity(delay + expect + chunk);
    let mut seg = vec![0.0f32; chunk];
    let mut idx = 0usize;
    // Past the end of the input, zero blocks flush the filter tail.
    while idx < input.len() || out.len() < delay + expect {
        seg.fill(0.0);
        if idx < input.len() {
            let end = (idx + chunk).min(input.len());
            seg[..end - idx].copy_from_slice(&input[idx..end]);
        }
        let produced = rs
            .process(std::slice::from_ref(&seg), None)
            .map_err(|e| ClipError::Resample(format!("process: {e:?}")))?;
        if produced[0].is_empty() && idx >= input.len() {
            break;
        }
        out.extend_from_slice(&produced[0]);
        idx += chunk;
    }

    out.drain(..delay.min(out.len()));
    match out.len().cmp(&expect) {
        CmpOrdering::Greater => out.truncate(expect),
        CmpOrdering::Less => out.resize(expect, 0.0),
        CmpOrdering::Equal => {}
    }
    debug!(from_rate, to_rate, delay, samples = out.len(), "clip resampled");
    Ok(out)
}
