//! # FLV Container
//!
//! Tag construction shared by the RTMP publisher (which sends tag bodies as
//! RTMP messages) and the local FLV file writer (which frames them with the
//! FLV tag header and back-pointer).
//!
//! ## Audio tag body:
//! ```text
//! u8  sound flags   format(4) | rate(2) | 16-bit(1) | stereo(1)
//! u8  aac packet    AAC only: 0 = sequence header, 1 = raw frame
//! ..  data
//! ```

use crate::audio::codec::CodecKind;
use crate::error::StreamError;
use crate::stream::amf::{encode_all, Amf0Value};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

pub const TAG_AUDIO: u8 = 8;
pub const TAG_SCRIPT: u8 = 18;

const SOUND_FORMAT_PCM_LE: u8 = 3;
const SOUND_FORMAT_ALAW: u8 = 7;
const SOUND_FORMAT_MULAW: u8 = 8;
const SOUND_FORMAT_AAC: u8 = 10;

const AAC_SEQUENCE_HEADER: u8 = 0;
const AAC_RAW: u8 = 1;

/// Audio stream parameters as the container sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioParams {
    pub codec: CodecKind,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_rate: u32,
    pub extradata: Option<Vec<u8>>,
}

impl AudioParams {
    pub fn sound_format(&self) -> u8 {
        match self.codec {
            CodecKind::Pcm => SOUND_FORMAT_PCM_LE,
            CodecKind::ALaw => SOUND_FORMAT_ALAW,
            CodecKind::MuLaw => SOUND_FORMAT_MULAW,
            CodecKind::Aac => SOUND_FORMAT_AAC,
        }
    }

    /// First byte of every audio tag body.
    pub fn sound_flags(&self) -> Result<u8, StreamError> {
        let stereo = u8::from(self.channels == 2);
        let flags = match self.codec {
            // AAC signals its real configuration in the sequence header.
            CodecKind::Aac => (SOUND_FORMAT_AAC << 4) | 0x0F,
            CodecKind::ALaw | CodecKind::MuLaw => {
                if self.sample_rate != 8000 || self.channels != 1 {
                    return Err(StreamError::Container(format!(
                        "G.711 in FLV must be 8000 Hz mono, got {} Hz x {}",
                        self.sample_rate, self.channels
                    )));
                }
                (self.sound_format() << 4) | 0x02
            }
            CodecKind::Pcm => {
                let rate_bits = match self.sample_rate {
                    5512 => 0,
                    11025 => 1,
                    22050 => 2,
                    44100 => 3,
                    other => {
                        return Err(StreamError::Container(format!(
                            "FLV cannot signal a PCM rate of {other} Hz"
                        )))
                    }
                };
                (SOUND_FORMAT_PCM_LE << 4) | (rate_bits << 2) | 0x02 | stereo
            }
        };
        Ok(flags)
    }

    /// Whether the codec configuration must be sent ahead of the first frame.
    pub fn needs_sequence_header(&self) -> bool {
        self.codec == CodecKind::Aac && self.extradata.is_some()
    }
}

/// One FLV tag with a millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: u8,
    pub timestamp: u32,
    pub body: Vec<u8>,
}

impl FlvTag {
    pub fn audio(params: &AudioParams, timestamp: u32, data: &[u8]) -> Result<Self, StreamError> {
        let mut body = Vec::with_capacity(data.len() + 2);
        body.push(params.sound_flags()?);
        if params.codec == CodecKind::Aac {
            body.push(AAC_RAW);
        }
        body.extend_from_slice(data);
        Ok(Self {
            tag_type: TAG_AUDIO,
            timestamp,
            body,
        })
    }

    /// AAC `AudioSpecificConfig` announcement, if the stream has one.
    pub fn sequence_header(params: &AudioParams) -> Result<Option<Self>, StreamError> {
        if !params.needs_sequence_header() {
            return Ok(None);
        }
        let config = params.extradata.as_deref().unwrap_or_default();
        let mut body = Vec::with_capacity(config.len() + 2);
        body.push(params.sound_flags()?);
        body.push(AAC_SEQUENCE_HEADER);
        body.extend_from_slice(config);
        Ok(Some(Self {
            tag_type: TAG_AUDIO,
            timestamp: 0,
            body,
        }))
    }

    /// `onMetaData` script tag describing the audio stream.
    pub fn metadata(params: &AudioParams) -> Self {
        Self {
            tag_type: TAG_SCRIPT,
            timestamp: 0,
            body: encode_all(&[Amf0Value::string("onMetaData"), metadata_object(params)]),
        }
    }
}

/// ECMA array describing `params`, shared by FLV files and RTMP `@setDataFrame`.
pub fn metadata_object(params: &AudioParams) -> Amf0Value {
    Amf0Value::EcmaArray(vec![
        ("duration".into(), Amf0Value::Number(0.0)),
        ("audiodatarate".into(), Amf0Value::Number(params.bit_rate as f64 / 1000.0)),
        ("audiosamplerate".into(), Amf0Value::Number(params.sample_rate as f64)),
        ("audiosamplesize".into(), Amf0Value::Number(16.0)),
        ("stereo".into(), Amf0Value::Boolean(params.channels == 2)),
        ("audiocodecid".into(), Amf0Value::Number(params.sound_format() as f64)),
        ("encoder".into(), Amf0Value::string(concat!("intercom-audio/", env!("CARGO_PKG_VERSION")))),
        ("filesize".into(), Amf0Value::Number(0.0)),
    ])
}

/// Writes FLV tags to any byte sink.
pub struct FlvWriter<W: Write> {
    inner: W,
}

impl<W: Write> FlvWriter<W> {
    /// Write the file header for an audio-only file.
    pub fn new(mut inner: W) -> std::io::Result<Self> {
        inner.write_all(b"FLV")?;
        inner.write_u8(1)?;
        inner.write_u8(0x04)?; // audio present
        inner.write_u32::<BigEndian>(9)?;
        inner.write_u32::<BigEndian>(0)?; // PreviousTagSize0
        Ok(Self { inner })
    }

    pub fn write_tag(&mut self, tag: &FlvTag) -> std::io::Result<()> {
        let data_size = tag.body.len() as u32;
        self.inner.write_u8(tag.tag_type)?;
        self.inner.write_u24::<BigEndian>(data_size)?;
        self.inner.write_u24::<BigEndian>(tag.timestamp & 0x00FF_FFFF)?;
        self.inner.write_u8((tag.timestamp >> 24) as u8)?;
        self.inner.write_u24::<BigEndian>(0)?; // stream id
        self.inner.write_all(&tag.body)?;
        self.inner.write_u32::<BigEndian>(data_size + 11)?;
        Ok(())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(codec: CodecKind, rate: u32, channels: u16) -> AudioParams {
        AudioParams {
            codec,
            sample_rate: rate,
            channels,
            bit_rate: 128_000,
            extradata: None,
        }
    }

    #[test]
    fn sound_flags_match_codec() {
        assert_eq!(params(CodecKind::ALaw, 8000, 1).sound_flags().unwrap(), 0x72);
        assert_eq!(params(CodecKind::MuLaw, 8000, 1).sound_flags().unwrap(), 0x82);
        assert_eq!(params(CodecKind::Pcm, 44100, 1).sound_flags().unwrap(), 0x3E);
        assert_eq!(params(CodecKind::Pcm, 11025, 2).sound_flags().unwrap(), 0x37);
        assert_eq!(params(CodecKind::Aac, 44100, 1).sound_flags().unwrap(), 0xAF);
    }

    #[test]
    fn unsignalable_rates_are_rejected() {
        assert!(params(CodecKind::Pcm, 48000, 1).sound_flags().is_err());
        assert!(params(CodecKind::MuLaw, 16000, 1).sound_flags().is_err());
    }

    #[test]
    fn aac_tags_carry_packet_type() {
        let mut p = params(CodecKind::Aac, 44100, 2);
        assert!(FlvTag::sequence_header(&p).unwrap().is_none());

        p.extradata = Some(vec![0x12, 0x10]);
        let seq = FlvTag::sequence_header(&p).unwrap().unwrap();
        assert_eq!(seq.body, vec![0xAF, 0x00, 0x12, 0x10]);

        let frame = FlvTag::audio(&p, 23, &[9, 9]).unwrap();
        assert_eq!(frame.body, vec![0xAF, 0x01, 9, 9]);
    }

    #[test]
    fn file_layout_has_header_and_back_pointers() {
        let mut writer = FlvWriter::new(Vec::new()).unwrap();
        let tag = FlvTag::audio(&params(CodecKind::MuLaw, 8000, 1), 0x0102_0304, &[0xFF; 4]).unwrap();
        writer.write_tag(&tag).unwrap();
        let bytes = writer.into_inner();

        assert_eq!(&bytes[..13], &[b'F', b'L', b'V', 1, 4, 0, 0, 0, 9, 0, 0, 0, 0]);
        let tag_bytes = &bytes[13..];
        assert_eq!(tag_bytes[0], TAG_AUDIO);
        assert_eq!(&tag_bytes[1..4], &[0, 0, 5]);
        // Lower 24 bits, then the extended byte.
        assert_eq!(&tag_bytes[4..8], &[0x02, 0x03, 0x04, 0x01]);
        assert_eq!(&tag_bytes[11..16], &[0x82, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&tag_bytes[16..], &16u32.to_be_bytes());
    }

    #[test]
    fn metadata_names_the_codec() {
        let tag = FlvTag::metadata(&params(CodecKind::ALaw, 8000, 1));
        let values = crate::stream::amf::decode_all(&tag.body).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values[1].get("audiocodecid").and_then(Amf0Value::as_number), Some(7.0));
        assert_eq!(values[1].get("audiosamplerate").and_then(Amf0Value::as_number), Some(8000.0));
    }
}
