//! Raw signed 16-bit little-endian PCM.

use super::{AudioDecoder, AudioEncoder, CodecKind, DecodedFrame, EncodedPacket, EncoderFrame,
    EncoderSettings, PacketQueue};
use crate::audio::format::{s16_to_le_bytes, s16le_bytes_to_samples, SampleData, SampleFormat, S16_BYTES};
use crate::error::CodecError;
use std::collections::VecDeque;

/// Rates an FLV linear-PCM stream can signal, preferred first.
pub const SUPPORTED_RATES: [u32; 4] = [44100, 22050, 11025, 5512];

pub struct PcmDecoder {
    sample_rate: u32,
    channels: u16,
    frames: VecDeque<DecodedFrame>,
}

impl PcmDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        if sample_rate == 0 || channels == 0 {
            return Err(CodecError::Unsupported(format!(
                "raw pcm needs a rate and channel count, got {sample_rate} Hz x {channels}"
            )));
        }
        Ok(Self {
            sample_rate,
            channels,
            frames: VecDeque::new(),
        })
    }
}

impl AudioDecoder for PcmDecoder {
    fn name(&self) -> &'static str {
        CodecKind::Pcm.name()
    }

    fn send_packet(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let frame_bytes = S16_BYTES * self.channels as usize;
        if data.len() % frame_bytes != 0 {
            return Err(CodecError::InvalidData(format!(
                "{} bytes is not a whole number of {frame_bytes}-byte frames",
                data.len()
            )));
        }
        self.frames.push_back(DecodedFrame {
            sample_rate: self.sample_rate,
            channels: self.channels,
            layout: None,
            data: SampleData::S16(s16le_bytes_to_samples(data)),
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        Ok(self.frames.pop_front())
    }
}

pub struct PcmEncoder {
    sample_rate: u32,
    channels: u16,
    queue: PacketQueue,
}

impl PcmEncoder {
    pub fn new(settings: &EncoderSettings) -> Self {
        let sample_rate = if SUPPORTED_RATES.contains(&settings.sample_rate) {
            settings.sample_rate
        } else {
            SUPPORTED_RATES[0]
        };
        let channels = settings.channels.clamp(1, 2);
        Self {
            sample_rate,
            channels,
            queue: PacketQueue::default(),
        }
    }
}

impl AudioEncoder for PcmEncoder {
    fn codec(&self) -> CodecKind {
        CodecKind::Pcm
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn sample_format(&self) -> SampleFormat {
        SampleFormat::S16
    }

    fn bit_rate(&self) -> u32 {
        self.sample_rate * self.channels as u32 * 16
    }

    fn frame_size(&self) -> Option<usize> {
        None
    }

    fn send_frame(&mut self, frame: Option<&EncoderFrame>) -> Result<(), CodecError> {
        self.queue.accept(frame, self.channels, s16_to_le_bytes)
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        Ok(self.queue.pop())
    }
}
