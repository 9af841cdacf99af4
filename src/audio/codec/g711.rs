//! ITU-T G.711 companding (A-law and µ-law), 8 kHz mono.

use super::{AudioDecoder, AudioEncoder, CodecKind, DecodedFrame, EncodedPacket, EncoderFrame,
    EncoderSettings, PacketQueue};
use crate::audio::format::{SampleData, SampleFormat};
use crate::error::CodecError;
use std::collections::VecDeque;

/// G.711 always runs at the telephony rate.
pub const G711_RATE: u32 = 8000;

const SEG_SHIFT: u32 = 4;
const SEG_MASK: u8 = 0x70;
const QUANT_MASK: u8 = 0x0F;
const SIGN_BIT: u8 = 0x80;

const SEG_AEND: [i32; 8] = [0x1F, 0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF];
const SEG_UEND: [i32; 8] = [0x3F, 0x7F, 0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF];
const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 8159;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Law {
    A,
    Mu,
}

impl Law {
    fn kind(&self) -> CodecKind {
        match self {
            Law::A => CodecKind::ALaw,
            Law::Mu => CodecKind::MuLaw,
        }
    }

    pub fn encode(&self, sample: i16) -> u8 {
        match self {
            Law::A => linear_to_alaw(sample),
            Law::Mu => linear_to_ulaw(sample),
        }
    }

    pub fn decode(&self, byte: u8) -> i16 {
        match self {
            Law::A => alaw_to_linear(byte),
            Law::Mu => ulaw_to_linear(byte),
        }
    }
}

fn segment(value: i32, table: &[i32; 8]) -> u32 {
    table
        .iter()
        .position(|&end| value <= end)
        .unwrap_or(table.len()) as u32
}

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 3;
    let mask = if pcm >= 0 {
        0xD5
    } else {
        pcm = -pcm - 1;
        0x55
    };

    let seg = segment(pcm, &SEG_AEND);
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let mut aval = (seg << SEG_SHIFT) as u8;
    aval |= if seg < 2 {
        ((pcm >> 1) as u8) & QUANT_MASK
    } else {
        ((pcm >> seg) as u8) & QUANT_MASK
    };
    aval ^ mask
}

pub fn alaw_to_linear(byte: u8) -> i16 {
    let a = byte ^ 0x55;
    let mut t = ((a & QUANT_MASK) as i32) << 4;
    let seg = ((a & SEG_MASK) >> SEG_SHIFT) as i32;
    match seg {
        0 => t += 8,
        1 => t += 0x108,
        _ => {
            t += 0x108;
            t <<= seg - 1;
        }
    }
    if a & SIGN_BIT != 0 {
        t as i16
    } else {
        -t as i16
    }
}

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = (sample as i32) >> 2;
    let mask = if pcm < 0 {
        pcm = -pcm;
        0x7F
    } else {
        0xFF
    };
    pcm = pcm.min(ULAW_CLIP) + (ULAW_BIAS >> 2);

    let seg = segment(pcm, &SEG_UEND);
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let uval = ((seg << 4) as u8) | (((pcm >> (seg + 1)) as u8) & QUANT_MASK);
    uval ^ mask
}

pub fn ulaw_to_linear(byte: u8) -> i16 {
    let u = !byte;
    let mut t = (((u & QUANT_MASK) as i32) << 3) + ULAW_BIAS;
    t <<= ((u & SEG_MASK) >> SEG_SHIFT) as i32;
    if u & SIGN_BIT != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

/// Raw G.711 payloads: one byte per sample, no headers, no layout.
pub struct G711Decoder {
    law: Law,
    frames: VecDeque<DecodedFrame>,
}

impl G711Decoder {
    pub fn new(law: Law) -> Self {
        Self {
            law,
            frames: VecDeque::new(),
        }
    }
}

impl AudioDecoder for G711Decoder {
    fn name(&self) -> &'static str {
        self.law.kind().name()
    }

    fn send_packet(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let samples: Vec<i16> = data.iter().map(|&b| self.law.decode(b)).collect();
        self.frames.push_back(DecodedFrame {
            sample_rate: G711_RATE,
            channels: 1,
            layout: None,
            data: SampleData::S16(samples),
        });
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        Ok(self.frames.pop_front())
    }
}

pub struct G711Encoder {
    law: Law,
    bit_rate: u32,
    queue: PacketQueue,
}

impl G711Encoder {
    /// Rate and channels are fixed by the codec; the request is only
    /// consulted for the bit rate it reports.
    pub fn new(law: Law, settings: &EncoderSettings) -> Self {
        if settings.sample_rate != G711_RATE || settings.channels != 1 {
            tracing::debug!(
                requested_rate = settings.sample_rate,
                requested_channels = settings.channels,
                "G.711 negotiated to 8000 Hz mono"
            );
        }
        Self {
            law,
            bit_rate: G711_RATE * 8,
            queue: PacketQueue::default(),
        }
    }
}

impl AudioEncoder for G711Encoder {
    fn codec(&self) -> CodecKind {
        self.law.kind()
    }

    fn sample_rate(&self) -> u32 {
        G711_RATE
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_format(&self) -> SampleFormat {
        SampleFormat::S16
    }

    fn bit_rate(&self) -> u32 {
        self.bit_rate
    }

    fn frame_size(&self) -> Option<usize> {
        None
    }

    fn send_frame(&mut self, frame: Option<&EncoderFrame>) -> Result<(), CodecError> {
        let law = self.law;
        self.queue
            .accept(frame, 1, |s| s.iter().map(|&v| law.encode(v)).collect())
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, CodecError> {
        Ok(self.queue.pop())
    }
}
