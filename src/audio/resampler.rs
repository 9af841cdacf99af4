//! # Streaming Resampler
//!
//! Converts interleaved PCM between sample rates, channel layouts and sample
//! formats, one chunk at a time. Used on both pipelines:
//!
//! - **Receive**: decoder output (any rate/layout, float or s16) to the fixed
//!   mono S16 playback format
//! - **Send**: mono S16 capture to the encoder's native format
//!
//! ## Algorithm:
//! Input is downmixed to mono floats and buffered. Rate conversion is a
//! band-limited sinc resampler from `rubato`, fed in fixed input chunks;
//! whatever it has produced but the caller has not taken yet stays queued.
//! Equal rates bypass rubato entirely. Output is duplicated across the
//! output channels.
//!
//! [`Resampler::delay`] counts everything held back (buffered input, queued
//! output and the filter latency) in input frames, so
//! [`Resampler::out_capacity`] is always enough for one call.

use crate::audio::format::{f32_to_s16, rescale_ceil, PcmSpec, SampleData, SampleFormat};
use crate::error::ResampleError;
use rubato::{
    Resampler as _, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::collections::VecDeque;

/// Upper bound accepted for either sample rate.
const MAX_RATE: u32 = 384_000;

/// Input frames handed to rubato per call.
const CHUNK_FRAMES: usize = 256;

pub struct Resampler {
    input: PcmSpec,
    output: PcmSpec,
    /// `None` when both rates match.
    engine: Option<SincFixedIn<f32>>,
    pending: Vec<f32>,
    ready: VecDeque<f32>,
}

impl Resampler {
    /// Build a converter from `input` to `output`.
    ///
    /// ## Returns:
    /// - **`ResampleError::InvalidSpec`** for zero or absurd rates and for
    ///   layouts without channels
    /// - **`ResampleError::Engine`** if rubato rejects the ratio
    pub fn new(input: PcmSpec, output: PcmSpec) -> Result<Self, ResampleError> {
        for (side, spec) in [("input", &input), ("output", &output)] {
            if spec.sample_rate == 0 || spec.sample_rate > MAX_RATE {
                return Err(ResampleError::InvalidSpec(format!(
                    "{side} sample rate {} out of range",
                    spec.sample_rate
                )));
            }
            if spec.channels() == 0 {
                return Err(ResampleError::InvalidSpec(format!(
                    "{side} layout has no channels"
                )));
            }
        }

        let engine = if input.sample_rate == output.sample_rate {
            None
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 128,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let ratio = output.sample_rate as f64 / input.sample_rate as f64;
            let engine = SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_FRAMES, 1)
                .map_err(|e| ResampleError::Engine(e.to_string()))?;
            Some(engine)
        };

        Ok(Self {
            input,
            output,
            engine,
            pending: Vec::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn input(&self) -> &PcmSpec {
        &self.input
    }

    pub fn output(&self) -> &PcmSpec {
        &self.output
    }

    /// Frames held back, in input frames: buffered input, queued output and
    /// the filter latency.
    pub fn delay(&self) -> u64 {
        let in_rate = self.input.sample_rate as u64;
        let out_rate = self.output.sample_rate as u64;
        let latency = self.engine.as_ref().map_or(0, |e| e.output_delay()) as u64;
        self.pending.len() as u64 + rescale_ceil(self.ready.len() as u64 + latency, in_rate, out_rate)
    }

    /// Output frames that converting `in_frames` more input can produce at
    /// most: `ceil((delay + in_frames) * out_rate / in_rate)`.
    pub fn out_capacity(&self, in_frames: usize) -> usize {
        rescale_ceil(
            self.delay() + in_frames as u64,
            self.output.sample_rate as u64,
            self.input.sample_rate as u64,
        ) as usize
    }

    /// Convert one chunk, producing at most `max_out_frames` output frames.
    ///
    /// Output beyond `max_out_frames` stays queued for the next call, so
    /// nothing is lost when the caller sizes its buffer from
    /// [`Resampler::out_capacity`].
    pub fn convert(
        &mut self,
        input: &SampleData,
        max_out_frames: usize,
    ) -> Result<SampleData, ResampleError> {
        if input.format() != self.input.format {
            return Err(ResampleError::FormatMismatch {
                expected: self.input.format.name(),
                got: input.format().name(),
            });
        }
        let in_channels = self.input.channels();
        if input.len() % in_channels as usize != 0 {
            return Err(ResampleError::Misaligned {
                samples: input.len(),
                channels: in_channels,
            });
        }

        self.push_downmixed(input, in_channels as usize);
        self.process_chunks()?;
        Ok(self.take_ready(max_out_frames))
    }

    /// Push the buffered input tail through the filter and return every
    /// frame still held back. The resampler can be reused afterwards.
    pub fn flush(&mut self) -> Result<SampleData, ResampleError> {
        if let Some(engine) = self.engine.as_mut() {
            if !self.pending.is_empty() {
                let ratio = self.output.sample_rate as f64 / self.input.sample_rate as f64;
                let expected = (self.pending.len() as f64 * ratio).ceil() as usize + engine.output_delay();
                let tail = vec![std::mem::take(&mut self.pending)];
                let out = engine
                    .process_partial(Some(tail.as_slice()), None)
                    .map_err(|e| ResampleError::Engine(e.to_string()))?;
                if let Some(channel) = out.into_iter().next() {
                    let keep = expected.min(channel.len());
                    self.ready.extend(&channel[..keep]);
                }
            }
            engine.reset();
        } else {
            self.ready.extend(self.pending.drain(..));
        }
        let all = self.ready.len();
        Ok(self.take_ready(all))
    }

    fn push_downmixed(&mut self, input: &SampleData, channels: usize) {
        let frames = input.len() / channels;
        self.pending.reserve(frames);
        for frame in 0..frames {
            let base = frame * channels;
            let sum: f32 = (0..channels).map(|c| input.sample_f32(base + c)).sum();
            self.pending.push(sum / channels as f32);
        }
    }

    fn process_chunks(&mut self) -> Result<(), ResampleError> {
        let Some(engine) = self.engine.as_mut() else {
            self.ready.extend(self.pending.drain(..));
            return Ok(());
        };

        let mut consumed = 0;
        while self.pending.len() - consumed >= engine.input_frames_next() {
            let needed = engine.input_frames_next();
            let chunk = [&self.pending[consumed..consumed + needed]];
            let out = engine
                .process(&chunk, None)
                .map_err(|e| ResampleError::Engine(e.to_string()))?;
            if let Some(channel) = out.into_iter().next() {
                self.ready.extend(channel);
            }
            consumed += needed;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    fn take_ready(&mut self, max_out_frames: usize) -> SampleData {
        let n = max_out_frames.min(self.ready.len());
        let mono: Vec<f32> = self.ready.drain(..n).collect();
        self.expand(&mono)
    }

    fn expand(&self, mono: &[f32]) -> SampleData {
        let channels = self.output.channels() as usize;
        match self.output.format {
            SampleFormat::S16 => {
                let mut out = Vec::with_capacity(mono.len() * channels);
                for &s in mono {
                    let v = f32_to_s16(s);
                    out.extend(std::iter::repeat(v).take(channels));
                }
                SampleData::S16(out)
            }
            SampleFormat::F32 => {
                let mut out = Vec::with_capacity(mono.len() * channels);
                for &s in mono {
                    out.extend(std::iter::repeat(s.clamp(-1.0, 1.0)).take(channels));
                }
                SampleData::F32(out)
            }
        }
    }
}
