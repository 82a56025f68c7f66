//! Sliding window: fixed-capacity FIFO of the most recent capture chunks.
//! Matching only ever sees immutable snapshots, never the live window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use super::capture::AudioChunk;

/// Bounded chunk FIFO. Appending beyond capacity evicts the oldest chunk.
pub struct SlidingWindow {
    chunks: VecDeque<AudioChunk>,
    capacity: usize,
    sample_rate: u32,
    appended: u64,
}

impl SlidingWindow {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity + 1),
            capacity,
            sample_rate,
            appended: 0,
        }
    }

    /// Append a chunk, returning the evicted one if the window was full.
    #[inline]
    pub fn append(&mut self, chunk: AudioChunk) -> Option<AudioChunk> {
        self.chunks.push_back(chunk);
        self.appended += 1;
        if self.chunks.len() > self.capacity {
            self.chunks.pop_front()
        } else {
            None
        }
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.chunks.len() == self.capacity
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Copy the current contents into an independent snapshot.
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, captured_at: Instant) -> WindowSnapshot {
        let total: usize = self.chunks.iter().map(AudioChunk::len).sum();
        let mut samples = Vec::with_capacity(total);
        for chunk in &self.chunks {
            samples.extend_from_slice(chunk.samples());
        }
        WindowSnapshot {
            samples: samples.into(),
            chunks: self.chunks.len(),
            sample_rate: self.sample_rate,
            sequence: self.appended,
            captured_at,
        }
    }
}

/// Immutable copy of the window taken when it became (or stayed) full.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    samples: Arc<[f32]>,
    chunks: usize,
    sample_rate: u32,
    sequence: u64,
    captured_at: Instant,
}

impl WindowSnapshot {
    /// Build a snapshot directly from samples (probing and tests).
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, captured_at: Instant) -> Self {
        Self {
            samples: samples.into(),
            chunks: 1,
            sample_rate,
            sequence: 0,
            captured_at,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Chunks the snapshot was assembled from.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Total appends seen by the window when the snapshot was taken.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate.max(1) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn chunk(value: f32, len: usize) -> AudioChunk {
        AudioChunk::new(vec![value; len])
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut window = SlidingWindow::new(2, 16_000);
        assert!(window.append(chunk(1.0, 2)).is_none());
        assert!(!window.is_full());
        assert!(window.append(chunk(2.0, 2)).is_none());
        assert!(window.is_full());
        let evicted = window.append(chunk(3.0, 2)).unwrap();
        assert_eq!(evicted.samples(), &[1.0, 1.0]);
        assert_eq!(window.snapshot().samples(), &[2.0, 2.0, 3.0, 3.0]);
    }

    #[test]
    fn snapshot_is_independent_of_later_appends() {
        let mut window = SlidingWindow::new(2, 16_000);
        window.append(chunk(1.0, 1));
        window.append(chunk(2.0, 1));
        let snap = window.snapshot();
        window.append(chunk(3.0, 1));
        assert_eq!(snap.samples(), &[1.0, 2.0]);
        assert_eq!(snap.sequence(), 2);
        assert_eq!(window.snapshot().samples(), &[2.0, 3.0]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let window = SlidingWindow::new(0, 16_000);
        assert_eq!(window.capacity(), 1);
    }

    proptest! {
        #[test]
        fn length_never_exceeds_capacity(capacity in 1usize..32, appends in 0usize..128) {
            let mut window = SlidingWindow::new(capacity, 16_000);
            for i in 0..appends {
                window.append(chunk(i as f32, 4));
                prop_assert!(window.len() <= capacity);
            }
            if appends >= capacity {
                prop_assert!(window.is_full());
                prop_assert_eq!(window.snapshot().chunk_count(), capacity);
                prop_assert_eq!(window.snapshot().samples().len(), capacity * 4);
            }
        }
    }
}
