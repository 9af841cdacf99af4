//! # AAC in ADTS Framing
//!
//! Each wire payload carries one or more ADTS frames. The ADTS headers are
//! parsed here to learn the sample rate and channel configuration; the raw
//! access units behind them are decoded by symphonia's AAC-LC decoder.
//!
//! ## Channel configuration 0:
//! ADTS uses `0` to mean "described in-band by a program config element".
//! Such frames report no layout, and the caller falls back to a default
//! layout for the decoded channel count.

use super::{AudioDecoder, DecodedFrame};
use crate::audio::format::{ChannelLayout, SampleData};
use crate::error::CodecError;
use std::collections::VecDeque;
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

/// Sampling frequency table indexed by the ADTS frequency index.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Samples per channel in one AAC-LC access unit.
const AAC_FRAME_SAMPLES: u64 = 1024;

/// Fields of a fixed + variable ADTS header that the decoder needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub sample_rate: u32,
    pub channel_config: u8,
    pub header_len: usize,
    pub frame_len: usize,
}

impl AdtsHeader {
    pub const MIN_LEN: usize = 7;

    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < Self::MIN_LEN {
            return Err(CodecError::InvalidData(format!(
                "ADTS header needs 7 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] != 0xFF || bytes[1] & 0xF0 != 0xF0 {
            return Err(CodecError::InvalidData("missing ADTS sync word".to_string()));
        }

        let protection_absent = bytes[1] & 0x01 == 1;
        let freq_index = ((bytes[2] >> 2) & 0x0F) as usize;
        let channel_config = ((bytes[2] & 0x01) << 2) | (bytes[3] >> 6);
        let frame_len = (((bytes[3] & 0x03) as usize) << 11)
            | ((bytes[4] as usize) << 3)
            | ((bytes[5] as usize) >> 5);
        let header_len = if protection_absent { 7 } else { 9 };

        let sample_rate = *SAMPLE_RATES.get(freq_index).ok_or_else(|| {
            CodecError::InvalidData(format!("reserved ADTS frequency index {freq_index}"))
        })?;
        if frame_len <= header_len {
            return Err(CodecError::InvalidData(format!(
                "ADTS frame length {frame_len} does not cover its {header_len}-byte header"
            )));
        }

        Ok(Self {
            sample_rate,
            channel_config,
            header_len,
            frame_len,
        })
    }

    /// Layout signalled by the header, `None` for in-band configuration.
    pub fn layout(&self) -> Option<ChannelLayout> {
        match self.channel_config {
            0 => None,
            7 => Some(ChannelLayout::Discrete(8)),
            n => Some(ChannelLayout::default_for(n as u16)),
        }
    }

    /// Channel count to configure the decoder with.
    fn decoder_channels(&self) -> u16 {
        match self.layout() {
            Some(layout) => layout.channels(),
            None => 2,
        }
    }
}

/// Split a payload into ADTS frames. Nothing is returned unless every frame
/// is complete.
pub fn split_adts(payload: &[u8]) -> Result<Vec<(AdtsHeader, &[u8])>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let header = AdtsHeader::parse(rest)?;
        if header.frame_len > rest.len() {
            return Err(CodecError::InvalidData(format!(
                "ADTS frame declares {} bytes, {} left",
                header.frame_len,
                rest.len()
            )));
        }
        frames.push((header, &rest[header.header_len..header.frame_len]));
        rest = &rest[header.frame_len..];
    }
    Ok(frames)
}

struct ActiveDecoder {
    sample_rate: u32,
    channel_config: u8,
    inner: Box<dyn Decoder>,
}

/// Stateful ADTS decoder. The symphonia decoder is created from the first
/// header and rebuilt if the stream configuration changes.
pub struct AdtsDecoder {
    active: Option<ActiveDecoder>,
    pending: VecDeque<(AdtsHeader, Vec<u8>)>,
    next_ts: u64,
}

impl AdtsDecoder {
    pub fn new() -> Self {
        Self {
            active: None,
            pending: VecDeque::new(),
            next_ts: 0,
        }
    }

    fn decoder_for(&mut self, header: &AdtsHeader) -> Result<&mut Box<dyn Decoder>, CodecError> {
        let reuse = matches!(
            &self.active,
            Some(a) if a.sample_rate == header.sample_rate && a.channel_config == header.channel_config
        );
        if !reuse {
            let channel_bits = (1u32 << header.decoder_channels()) - 1;
            let mut params = CodecParameters::new();
            params
                .for_codec(CODEC_TYPE_AAC)
                .with_sample_rate(header.sample_rate)
                .with_channels(Channels::from_bits_truncate(channel_bits));

            let inner = symphonia::default::get_codecs()
                .make(&params, &DecoderOptions::default())
                .map_err(backend_error)?;

            tracing::debug!(
                sample_rate = header.sample_rate,
                channel_config = header.channel_config,
                "AAC decoder configured"
            );
            self.active = Some(ActiveDecoder {
                sample_rate: header.sample_rate,
                channel_config: header.channel_config,
                inner,
            });
        }

        match self.active.as_mut() {
            Some(active) => Ok(&mut active.inner),
            None => Err(CodecError::Backend("AAC decoder unavailable".to_string())),
        }
    }
}

impl Default for AdtsDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoder for AdtsDecoder {
    fn name(&self) -> &'static str {
        "aac"
    }

    fn send_packet(&mut self, data: &[u8]) -> Result<(), CodecError> {
        for (header, raw) in split_adts(data)? {
            self.pending.push_back((header, raw.to_vec()));
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        let Some((header, raw)) = self.pending.pop_front() else {
            return Ok(None);
        };

        let ts = self.next_ts;
        self.next_ts += AAC_FRAME_SAMPLES;

        let decoder = self.decoder_for(&header)?;
        let packet = Packet::new_from_slice(0, ts, AAC_FRAME_SAMPLES, &raw);
        let decoded = decoder.decode(&packet).map_err(backend_error)?;

        let spec = *decoded.spec();
        let channels = spec.channels.count() as u16;
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);

        Ok(Some(DecodedFrame {
            sample_rate: spec.rate,
            channels,
            layout: header.layout(),
            data: SampleData::F32(buffer.samples().to_vec()),
        }))
    }
}

fn backend_error(err: SymphoniaError) -> CodecError {
    match err {
        SymphoniaError::DecodeError(msg) => CodecError::InvalidData(msg.to_string()),
        SymphoniaError::Unsupported(msg) => CodecError::Unsupported(msg.to_string()),
        other => CodecError::Backend(other.to_string()),
    }
}
