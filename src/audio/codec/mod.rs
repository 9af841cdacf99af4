//! # Audio Codecs
//!
//! Decoder and encoder seams shared by both pipelines, plus the concrete
//! codecs the intercom speaks:
//!
//! - **`aac`**: AAC-LC in ADTS framing (decode only, via symphonia)
//! - **`g711`**: ITU-T G.711 A-law and µ-law (decode and encode)
//! - **`pcm`**: raw signed 16-bit little-endian (decode and encode)
//!
//! Both traits follow a send/receive model: the caller submits compressed
//! data (or a PCM frame) and then drains results until the codec reports it
//! needs more input with `Ok(None)`.

pub mod aac;
pub mod g711;
pub mod pcm;

use crate::audio::format::{ChannelLayout, PcmSpec, SampleData, SampleFormat, TimeBase};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Compressed audio formats known to the pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Aac,
    Pcm,
    ALaw,
    MuLaw,
}

impl CodecKind {
    /// Extension used for raw recordings of this codec's bitstream.
    pub fn file_extension(&self) -> &'static str {
        match self {
            CodecKind::Aac => "aac",
            CodecKind::Pcm => "pcm",
            CodecKind::ALaw => "alaw",
            CodecKind::MuLaw => "mulaw",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Aac => "aac",
            CodecKind::Pcm => "pcm_s16le",
            CodecKind::ALaw => "pcm_alaw",
            CodecKind::MuLaw => "pcm_mulaw",
        }
    }
}

/// One block of decoded PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub sample_rate: u32,
    pub channels: u16,
    /// `None` when the bitstream does not describe its speaker layout
    pub layout: Option<ChannelLayout>,
    pub data: SampleData,
}

impl DecodedFrame {
    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.data.frames(self.channels)
    }

    /// The frame's actual format, with a default layout filled in if the
    /// bitstream carried none.
    pub fn spec(&self) -> PcmSpec {
        PcmSpec::new(
            self.sample_rate,
            self.layout
                .unwrap_or_else(|| ChannelLayout::default_for(self.channels)),
            self.data.format(),
        )
    }
}

/// Stateful decoder for one compressed stream.
pub trait AudioDecoder: Send {
    fn name(&self) -> &'static str;

    /// Submit one compressed payload.
    fn send_packet(&mut self, data: &[u8]) -> Result<(), CodecError>;

    /// Next decoded frame, or `Ok(None)` when more input is needed.
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError>;
}

/// PCM handed to an encoder. `pts` is in the encoder's time base.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderFrame {
    pub pts: i64,
    pub data: SampleData,
}

/// One compressed packet. `pts` and `duration` are in the encoder's time base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Vec<u8>,
    pub pts: i64,
    pub duration: i64,
}

/// Parameters requested when opening an encoder. The encoder may negotiate
/// a different rate or channel count; read the result back from the trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u32,
    /// Codec configuration goes in extradata instead of every packet
    pub global_header: bool,
}

/// Stateful encoder for one output stream.
pub trait AudioEncoder: Send {
    fn codec(&self) -> CodecKind;
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn sample_format(&self) -> SampleFormat;
    fn bit_rate(&self) -> u32;

    /// Samples per channel the encoder wants per frame; `None` if any size
    /// is accepted.
    fn frame_size(&self) -> Option<usize>;

    /// Out-of-band codec configuration, if the codec has any.
    fn extradata(&self) -> Option<&[u8]> {
        None
    }

    fn time_base(&self) -> TimeBase {
        TimeBase::per_sample(self.sample_rate())
    }

    /// The PCM layout this encoder consumes.
    fn input_spec(&self) -> PcmSpec {
        PcmSpec::new(
            self.sample_rate(),
            ChannelLayout::default_for(self.channels()),
            self.sample_format(),
        )
    }

    /// Submit a frame, or `None` to signal end of stream.
    fn send_frame(&mut self, frame: Option<&EncoderFrame>) -> Result<(), CodecError>;

    /// Next packet, or `Ok(None)` when the encoder needs more input.
    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError>;
}

/// Open a decoder for `kind`.
///
/// `pcm_rate` is only used for raw PCM, which has no in-band rate.
pub fn make_decoder(kind: CodecKind, pcm_rate: u32) -> Result<Box<dyn AudioDecoder>, CodecError> {
    match kind {
        CodecKind::Aac => Ok(Box::new(aac::AdtsDecoder::new())),
        CodecKind::Pcm => Ok(Box::new(pcm::PcmDecoder::new(pcm_rate, 1)?)),
        CodecKind::ALaw => Ok(Box::new(g711::G711Decoder::new(g711::Law::A))),
        CodecKind::MuLaw => Ok(Box::new(g711::G711Decoder::new(g711::Law::Mu))),
    }
}

/// Open an encoder for `kind`, negotiating rate and channels.
pub fn make_encoder(
    kind: CodecKind,
    settings: &EncoderSettings,
) -> Result<Box<dyn AudioEncoder>, CodecError> {
    match kind {
        CodecKind::Aac => Err(CodecError::Unsupported(
            "no AAC encoder is available; use pcm, alaw or mulaw".to_string(),
        )),
        CodecKind::Pcm => Ok(Box::new(pcm::PcmEncoder::new(settings))),
        CodecKind::ALaw => Ok(Box::new(g711::G711Encoder::new(g711::Law::A, settings))),
        CodecKind::MuLaw => Ok(Box::new(g711::G711Encoder::new(g711::Law::Mu, settings))),
    }
}

/// Packet queue for sample-wise encoders that emit one packet per frame.
#[derive(Debug, Default)]
pub(crate) struct PacketQueue {
    packets: VecDeque<EncodedPacket>,
    flushed: bool,
}

impl PacketQueue {
    /// Encode `frame` with `encode` and queue the result.
    pub(crate) fn accept(
        &mut self,
        frame: Option<&EncoderFrame>,
        channels: u16,
        encode: impl Fn(&[i16]) -> Vec<u8>,
    ) -> Result<(), CodecError> {
        if self.flushed {
            return Err(CodecError::Flushed);
        }
        let Some(frame) = frame else {
            self.flushed = true;
            return Ok(());
        };
        let SampleData::S16(samples) = &frame.data else {
            return Err(CodecError::InvalidData(format!(
                "expected s16 input, got {}",
                frame.data.format().name()
            )));
        };
        if samples.is_empty() {
            return Ok(());
        }
        self.packets.push_back(EncodedPacket {
            data: encode(samples),
            pts: frame.pts,
            duration: frame.data.frames(channels) as i64,
        });
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<EncodedPacket> {
        self.packets.pop_front()
    }
}
