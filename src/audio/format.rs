//! # PCM Formats and Sample Containers
//!
//! Shared vocabulary for every stage that touches raw audio: the decoder's
//! output, the resampler on both sides of the conversion, the playback sink
//! and the encoder input.
//!
//! ## Conventions:
//! - **Interleaved** storage everywhere (`L R L R ...`), never planar
//! - **S16** samples travel as little-endian bytes on the wire and in files
//! - **Time bases** are rationals; timestamps are integers in those units

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

/// Bytes per sample for the 16-bit PCM used at every pipeline boundary.
pub const S16_BYTES: usize = 2;

/// Sample representation of a PCM buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit integer samples
    S16,
    /// 32-bit float samples in `[-1.0, 1.0]`
    F32,
}

impl SampleFormat {
    pub fn name(&self) -> &'static str {
        match self {
            SampleFormat::S16 => "s16",
            SampleFormat::F32 => "flt",
        }
    }
}

/// Speaker arrangement of an interleaved buffer.
///
/// Some bitstreams (ADTS with channel configuration 0, raw G.711, raw PCM)
/// carry no layout at all. Callers then build one with
/// [`ChannelLayout::default_for`], mirroring what a decoder would assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLayout {
    Mono,
    Stereo,
    /// Any other arrangement, identified only by its channel count
    Discrete(u16),
}

impl ChannelLayout {
    /// Default layout for a bare channel count.
    pub fn default_for(channels: u16) -> Self {
        match channels {
            1 => ChannelLayout::Mono,
            2 => ChannelLayout::Stereo,
            n => ChannelLayout::Discrete(n),
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
            ChannelLayout::Discrete(n) => *n,
        }
    }
}

/// Full description of one side of a PCM conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub layout: ChannelLayout,
    pub format: SampleFormat,
}

impl PcmSpec {
    pub fn new(sample_rate: u32, layout: ChannelLayout, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            layout,
            format,
        }
    }

    /// Mono signed 16-bit at `sample_rate` - the playback and capture format.
    pub fn mono_s16(sample_rate: u32) -> Self {
        Self::new(sample_rate, ChannelLayout::Mono, SampleFormat::S16)
    }

    pub fn channels(&self) -> u16 {
        self.layout.channels()
    }
}

/// Interleaved PCM samples in one of the supported formats.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleData {
    S16(Vec<i16>),
    F32(Vec<f32>),
}

impl SampleData {
    pub fn empty(format: SampleFormat) -> Self {
        match format {
            SampleFormat::S16 => SampleData::S16(Vec::new()),
            SampleFormat::F32 => SampleData::F32(Vec::new()),
        }
    }

    pub fn format(&self) -> SampleFormat {
        match self {
            SampleData::S16(_) => SampleFormat::S16,
            SampleData::F32(_) => SampleFormat::F32,
        }
    }

    /// Total number of samples across all channels.
    pub fn len(&self) -> usize {
        match self {
            SampleData::S16(s) => s.len(),
            SampleData::F32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self, channels: u16) -> usize {
        if channels == 0 {
            return 0;
        }
        self.len() / channels as usize
    }

    /// Append `other`, converting it to this buffer's format if needed.
    pub fn append(&mut self, other: SampleData) {
        match (self, other) {
            (SampleData::S16(a), SampleData::S16(b)) => a.extend(b),
            (SampleData::F32(a), SampleData::F32(b)) => a.extend(b),
            (SampleData::S16(a), SampleData::F32(b)) => a.extend(b.into_iter().map(f32_to_s16)),
            (SampleData::F32(a), SampleData::S16(b)) => a.extend(b.into_iter().map(s16_to_f32)),
        }
    }

    /// Remove and return the first `samples` samples (fewer if shorter).
    pub fn take_front(&mut self, samples: usize) -> SampleData {
        match self {
            SampleData::S16(s) => {
                let n = samples.min(s.len());
                SampleData::S16(s.drain(..n).collect())
            }
            SampleData::F32(s) => {
                let n = samples.min(s.len());
                SampleData::F32(s.drain(..n).collect())
            }
        }
    }

    /// Sample `index` as a float, whatever the storage format.
    pub(crate) fn sample_f32(&self, index: usize) -> f32 {
        match self {
            SampleData::S16(s) => s16_to_f32(s[index]),
            SampleData::F32(s) => s[index],
        }
    }

    /// Serialize as signed 16-bit little-endian bytes.
    pub fn to_s16le_bytes(&self) -> Vec<u8> {
        match self {
            SampleData::S16(s) => s16_to_le_bytes(s),
            SampleData::F32(s) => {
                let converted: Vec<i16> = s.iter().map(|&v| f32_to_s16(v)).collect();
                s16_to_le_bytes(&converted)
            }
        }
    }
}

#[inline]
pub fn s16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[inline]
pub fn f32_to_s16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}

/// Decode little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
pub fn s16le_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    let mut samples = vec![0i16; bytes.len() / S16_BYTES];
    LittleEndian::read_i16_into(&bytes[..samples.len() * S16_BYTES], &mut samples);
    samples
}

pub fn s16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * S16_BYTES];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Rational time base, e.g. `1/44100` for sample clocks or `1/1000` for FLV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: u32,
    pub den: u32,
}

impl TimeBase {
    pub const MILLIS: TimeBase = TimeBase { num: 1, den: 1000 };

    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// One tick per sample at `sample_rate`.
    pub fn per_sample(sample_rate: u32) -> Self {
        Self::new(1, sample_rate)
    }
}

/// Convert `ts` from one time base to another, rounding to nearest
/// (halves away from zero).
pub fn rescale_ts(ts: i64, from: TimeBase, to: TimeBase) -> i64 {
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };
    rounded as i64
}

/// `ceil(a * b / c)` without intermediate overflow.
pub fn rescale_ceil(a: u64, b: u64, c: u64) -> u64 {
    if c == 0 {
        return 0;
    }
    let product = a as u128 * b as u128;
    product.div_ceil(c as u128) as u64
}
