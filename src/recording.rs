//! Chunked access to multichannel recordings
//!
//! The engine never touches a file format directly: it consumes any source
//! implementing [`Recording`], which hands out padded sample blocks by chunk
//! index plus arbitrary windows for template snippet extraction. Two
//! implementations are provided: an in-memory buffer (tests, simulation) and
//! an interleaved multichannel WAV file.

use snafu::ResultExt;

use crate::error::{ClusterError, WavSnafu};

/// A contiguous multichannel sample block, time-major.
#[derive(Debug, Clone)]
pub struct Block {
    data: Vec<f32>,
    n_samples: usize,
    n_channels: usize,
}

impl Block {
    pub fn zeros(n_samples: usize, n_channels: usize) -> Self {
        Self { data: vec![0.0; n_samples * n_channels], n_samples, n_channels }
    }

    pub fn from_data(data: Vec<f32>, n_channels: usize) -> Self {
        debug_assert_eq!(data.len() % n_channels, 0);
        let n_samples = data.len() / n_channels;
        Self { data, n_samples, n_channels }
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_channels(&self) -> usize {
        self.n_channels
    }

    #[inline]
    pub fn sample(&self, t: usize, ch: usize) -> f32 {
        self.data[t * self.n_channels + ch]
    }

    #[inline]
    pub fn sample_mut(&mut self, t: usize, ch: usize) -> &mut f32 {
        &mut self.data[t * self.n_channels + ch]
    }

    /// All channel values at one time step.
    #[inline]
    pub fn row(&self, t: usize) -> &[f32] {
        &self.data[t * self.n_channels..(t + 1) * self.n_channels]
    }

    /// One channel as an owned trace.
    pub fn channel(&self, ch: usize) -> Vec<f32> {
        (0..self.n_samples).map(|t| self.sample(t, ch)).collect()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

/// Abstract chunk reader over a long multichannel recording.
///
/// `read_span` clamps to the valid sample range and zero-fills outside of it,
/// so callers may request padded windows that nominally start before sample 0
/// or end past the final sample.
pub trait Recording: Sync {
    fn nb_samples(&self) -> u64;
    fn nb_channels(&self) -> usize;
    fn sample_rate(&self) -> f32;

    /// Read `len` samples starting at `start` (absolute, possibly negative).
    fn read_span(&self, start: i64, len: usize) -> Block;

    /// Number of whole chunks of `chunk_size` samples.
    fn nb_chunks(&self, chunk_size: usize) -> usize {
        ((self.nb_samples() / chunk_size as u64) as usize).max(1)
    }

    fn is_first_chunk(&self, idx: usize) -> bool {
        idx == 0
    }

    fn is_last_chunk(&self, idx: usize, chunk_size: usize) -> bool {
        idx + 1 == self.nb_chunks(chunk_size)
    }

    /// Read chunk `idx` widened by `padding` (negative left pad, positive
    /// right pad). Returns the block and the absolute time of its first row.
    fn read_chunk(
        &self,
        idx: usize,
        chunk_size: usize,
        padding: (i64, i64),
    ) -> Result<(Block, i64), ClusterError> {
        let nb_chunks = self.nb_chunks(chunk_size);
        if idx >= nb_chunks {
            return Err(ClusterError::ChunkOutOfRange { index: idx, nb_chunks });
        }
        let start = idx as i64 * chunk_size as i64 + padding.0;
        let len = (chunk_size as i64 - padding.0 + padding.1) as usize;
        Ok((self.read_span(start, len), start))
    }
}

/// Recording held entirely in memory, time-major interleaved.
#[derive(Debug, Clone)]
pub struct MemoryRecording {
    data: Vec<f32>,
    n_channels: usize,
    sample_rate: f32,
}

impl MemoryRecording {
    pub fn new(data: Vec<f32>, n_channels: usize, sample_rate: f32) -> Self {
        debug_assert_eq!(data.len() % n_channels, 0);
        Self { data, n_channels, sample_rate }
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl Recording for MemoryRecording {
    fn nb_samples(&self) -> u64 {
        (self.data.len() / self.n_channels) as u64
    }

    fn nb_channels(&self) -> usize {
        self.n_channels
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_span(&self, start: i64, len: usize) -> Block {
        read_span_from_slice(&self.data, self.n_channels, self.nb_samples() as i64, start, len)
    }
}

/// Interleaved multichannel WAV recording, decoded up front.
pub struct WavRecording {
    samples: Vec<f32>,
    n_channels: usize,
    sample_rate: f32,
}

impl WavRecording {
    /// Open a WAV file and normalize integer formats to [-1.0, 1.0].
    pub fn open(path: &str) -> Result<Self, ClusterError> {
        let reader = hound::WavReader::open(path).context(WavSnafu)?;
        let spec = reader.spec();
        let n_channels = spec.channels as usize;
        let sample_rate = spec.sample_rate as f32;

        let samples: Result<Vec<f32>, hound::Error> = match spec.sample_format {
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader.into_samples::<i32>().map(|s| s.map(|v| v as f32 * scale)).collect()
            }
            hound::SampleFormat::Float => reader.into_samples::<f32>().collect(),
        };
        let samples = samples.context(WavSnafu)?;

        Ok(Self { samples, n_channels, sample_rate })
    }
}

impl Recording for WavRecording {
    fn nb_samples(&self) -> u64 {
        (self.samples.len() / self.n_channels) as u64
    }

    fn nb_channels(&self) -> usize {
        self.n_channels
    }

    fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    fn read_span(&self, start: i64, len: usize) -> Block {
        read_span_from_slice(&self.samples, self.n_channels, self.nb_samples() as i64, start, len)
    }
}

fn read_span_from_slice(
    data: &[f32],
    n_channels: usize,
    nb_samples: i64,
    start: i64,
    len: usize,
) -> Block {
    let mut block = Block::zeros(len, n_channels);
    let lo = start.max(0);
    let hi = (start + len as i64).min(nb_samples);
    if lo < hi {
        let dst0 = (lo - start) as usize;
        for (k, t) in (lo..hi).enumerate() {
            let src = t as usize * n_channels;
            let dst = (dst0 + k) * n_channels;
            block.data[dst..dst + n_channels].copy_from_slice(&data[src..src + n_channels]);
        }
    }
    block
}

/// Sorted absolute sample ranges excluded from spike detection.
#[derive(Debug, Clone, Default)]
pub struct DeadTimes {
    ranges: Vec<(u64, u64)>,
}

impl DeadTimes {
    /// Build from half-open `[start, end)` ranges; overlaps are merged.
    pub fn new(mut ranges: Vec<(u64, u64)>) -> Self {
        ranges.retain(|r| r.1 > r.0);
        ranges.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match merged.last_mut() {
                Some(last) if r.0 <= last.1 => last.1 = last.1.max(r.1),
                _ => merged.push(r),
            }
        }
        Self { ranges: merged }
    }

    pub fn contains(&self, t: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.1 <= t);
        self.ranges.get(idx).is_some_and(|r| r.0 <= t)
    }

    /// True when `[start, end)` intersects any dead range.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.1 <= start);
        self.ranges.get(idx).is_some_and(|r| r.0 < end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
