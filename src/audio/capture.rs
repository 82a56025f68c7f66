//! Capture boundary: continuous mono PCM delivered as fixed-size chunks.
//! `MicCapture` wraps a cpal input stream; `ClipSource` replays an in-memory
//! signal through the same interface for simulation and tests.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate};
use crossbeam_channel as cb;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Immutable block of f32 samples in [-1, 1].
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: Arc<[f32]>,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples: samples.into(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceError {
    NoDevice,
    DeviceNotFound(String),
    UnsupportedConfig(String),
    Stream(String),
    Closed,
    /// A replayed clip ran out of samples.
    Exhausted,
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::NoDevice => write!(f, "no audio input device available"),
            DeviceError::DeviceNotFound(name) => write!(f, "input device '{name}' not found"),
            DeviceError::UnsupportedConfig(msg) => write!(f, "unsupported input config: {msg}"),
            DeviceError::Stream(msg) => write!(f, "audio stream fault: {msg}"),
            DeviceError::Closed => write!(f, "audio stream closed"),
            DeviceError::Exhausted => write!(f, "audio source exhausted"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Chunked PCM source. Implementations block in `read_chunk` until exactly
/// `chunk_size()` samples are available.
pub trait AudioSource {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError>;

    /// Release the device. Idempotent, and safe after a failed read.
    fn close(&mut self);

    fn sample_rate(&self) -> u32;

    fn chunk_size(&self) -> usize;
}

/// Deferred source construction. cpal streams are not `Send` on every host,
/// so sources are opened on the capture thread that owns them.
pub type OpenSource = Box<dyn FnOnce() -> Result<Box<dyn AudioSource>, DeviceError> + Send>;

/// List input device names.
pub fn list_devices() -> Result<Vec<String>, DeviceError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| DeviceError::Stream(format!("enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Microphone capture via cpal.
pub struct MicCapture {
    stream: Option<cpal::Stream>,
    rx: cb::Receiver<Vec<f32>>,
    pending: Vec<f32>,
    fault: Arc<Mutex<Option<String>>>,
    sample_rate: u32,
    chunk_size: usize,
}

impl MicCapture {
    /// Open the named (or default) input device at `sample_rate`, mono.
    pub fn open(
        sample_rate: u32,
        chunk_size: usize,
        device_name: Option<&str>,
    ) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| DeviceError::Stream(format!("enumerate input devices: {e}")))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| DeviceError::DeviceNotFound(name.to_string()))?,
            None => host.default_input_device().ok_or(DeviceError::NoDevice)?,
        };

        let supported = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?
            .filter(|c| {
                c.min_sample_rate().0 <= sample_rate && c.max_sample_rate().0 >= sample_rate
            })
            .min_by_key(|c| c.channels())
            .map(|c| c.with_sample_rate(SampleRate(sample_rate)))
            .ok_or_else(|| {
                DeviceError::UnsupportedConfig(format!("device does not support {sample_rate} Hz"))
            })?;

        let format = supported.sample_format();
        let stream_config = supported.config();
        let channels = usize::from(stream_config.channels.max(1));

        // Unbounded hand-off: the device callback never drops samples.
        let (tx, rx) = cb::unbounded::<Vec<f32>>();
        let fault = Arc::new(Mutex::new(None));
        let fault_cb = Arc::clone(&fault);
        let err_fn = move |err: cpal::StreamError| {
            error!(error = %err, "audio capture error");
            *fault_cb.lock() = Some(err.to_string());
        };

        let stream = match format {
            SampleFormat::F32 => device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix(data, channels, |s| s));
                },
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix(data, channels, |s| s as f32 / 32_768.0));
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                &stream_config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let _ = tx.send(downmix(data, channels, |s| {
                        (s as f32 - 32_768.0) / 32_768.0
                    }));
                },
                err_fn,
                None,
            ),
            other => {
                return Err(DeviceError::UnsupportedConfig(format!(
                    "sample format {other:?}"
                )))
            }
        }
        .map_err(|e| DeviceError::Stream(format!("failed to build input stream: {e}")))?;

        stream
            .play()
            .map_err(|e| DeviceError::Stream(format!("failed to start audio stream: {e}")))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate,
            channels,
            format = ?format,
            "audio capture stream started"
        );

        Ok(Self {
            stream: Some(stream),
            rx,
            pending: Vec::with_capacity(chunk_size * 2),
            fault,
            sample_rate,
            chunk_size,
        })
    }
}

impl AudioSource for MicCapture {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError> {
        loop {
            if self.pending.len() >= self.chunk_size {
                let rest = self.pending.split_off(self.chunk_size);
                let chunk = std::mem::replace(&mut self.pending, rest);
                return Ok(AudioChunk::new(chunk));
            }
            if self.stream.is_none() {
                return Err(DeviceError::Closed);
            }
            if let Some(msg) = self.fault.lock().take() {
                return Err(DeviceError::Stream(msg));
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(samples) => self.pending.extend_from_slice(&samples),
                Err(cb::RecvTimeoutError::Timeout) => continue,
                Err(cb::RecvTimeoutError::Disconnected) => return Err(DeviceError::Closed),
            }
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!(error = %e, "failed to pause audio stream");
            }
            drop(stream);
            info!("audio capture stream closed");
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Average interleaved frames into mono f32.
fn downmix<T: Copy>(data: &[T], channels: usize, convert: impl Fn(T) -> f32) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| convert(s)).collect();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| convert(s)).sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Replays an in-memory signal as fixed-size chunks.
pub struct ClipSource {
    samples: Arc<[f32]>,
    pos: usize,
    chunk_size: usize,
    sample_rate: u32,
    /// Sleep one chunk duration per read, like a real device.
    paced: bool,
    /// After the clip ends, keep delivering silence instead of failing.
    hold_open: bool,
    closed: bool,
}

impl ClipSource {
    pub fn new(samples: impl Into<Arc<[f32]>>, chunk_size: usize, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            pos: 0,
            chunk_size: chunk_size.max(1),
            sample_rate,
            paced: false,
            hold_open: false,
            closed: false,
        }
    }

    pub fn paced(mut self) -> Self {
        self.paced = true;
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// Seconds of audio delivered so far.
    pub fn position_secs(&self) -> f64 {
        self.pos as f64 / self.sample_rate.max(1) as f64
    }
}

impl AudioSource for ClipSource {
    fn read_chunk(&mut self) -> Result<AudioChunk, DeviceError> {
        if self.closed {
            return Err(DeviceError::Closed);
        }
        if self.pos >= self.samples.len() && !self.hold_open {
            return Err(DeviceError::Exhausted);
        }
        if self.paced {
            let secs = self.chunk_size as f64 / self.sample_rate.max(1) as f64;
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
        let start = self.pos.min(self.samples.len());
        let end = (start + self.chunk_size).min(self.samples.len());
        let mut chunk = Vec::with_capacity(self.chunk_size);
        chunk.extend_from_slice(&self.samples[start..end]);
        chunk.resize(self.chunk_size, 0.0);
        self.pos += self.chunk_size;
        Ok(AudioChunk::new(chunk))
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            debug!(position_secs = self.position_secs(), "clip source closed");
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// Read `chunks` chunks from a source into one contiguous buffer.
pub fn record_chunks(source: &mut dyn AudioSource, chunks: usize) -> Result<Vec<f32>, DeviceError> {
    let mut out = Vec::with_capacity(chunks * source.chunk_size());
    for _ in 0..chunks {
        match source.read_chunk() {
            Ok(chunk) => out.extend_from_slice(chunk.samples()),
            Err(e) => {
                warn!(error = %e, captured = out.len(), "recording interrupted");
                source.close();
                return Err(e);
            }
        }
    }
    source.close();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_source_pads_final_chunk() {
        let mut src = ClipSource::new(vec![0.5f32; 10], 4, 16_000);
        assert_eq!(src.read_chunk().unwrap().samples(), &[0.5; 4]);
        assert_eq!(src.read_chunk().unwrap().samples(), &[0.5; 4]);
        assert_eq!(src.read_chunk().unwrap().samples(), &[0.5, 0.5, 0.0, 0.0]);
        assert_eq!(src.read_chunk().unwrap_err(), DeviceError::Exhausted);
    }

    #[test]
    fn clip_source_hold_open_yields_silence() {
        let mut src = ClipSource::new(vec![1.0f32; 2], 2, 16_000).hold_open();
        assert_eq!(src.read_chunk().unwrap().samples(), &[1.0, 1.0]);
        assert_eq!(src.read_chunk().unwrap().samples(), &[0.0, 0.0]);
        assert_eq!(src.read_chunk().unwrap().samples(), &[0.0, 0.0]);
    }

    #[test]
    fn close_is_idempotent_and_blocks_reads() {
        let mut src = ClipSource::new(vec![0.0f32; 8], 4, 16_000);
        src.close();
        src.close();
        assert_eq!(src.read_chunk().unwrap_err(), DeviceError::Closed);
    }

    #[test]
    fn downmix_averages_frames() {
        let stereo = [1.0f32, -1.0, 0.5, 0.5];
        assert_eq!(downmix(&stereo, 2, |s| s), vec![0.0, 0.5]);
        assert_eq!(downmix(&[0.25f32, 0.5], 1, |s| s), vec![0.25, 0.5]);
    }

    #[test]
    fn record_chunks_collects_and_closes() {
        let mut src = ClipSource::new(vec![0.1f32; 12], 4, 16_000);
        let out = record_chunks(&mut src, 3).unwrap();
        assert_eq!(out.len(), 12);
        assert_eq!(src.read_chunk().unwrap_err(), DeviceError::Closed);
    }
}
