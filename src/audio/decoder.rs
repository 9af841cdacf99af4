//! # Decode Engine
//!
//! Turns compressed payloads into mono S16 PCM at the fixed playback rate
//! and hands it to the playback sink.
//!
//! ## Per payload:
//! 1. Skip entirely when no decoder could be opened
//! 2. Submit the payload; a rejected payload is logged and dropped
//! 3. Drain every decoded frame: build the resampler from the first frame's
//!    real format, convert, write the produced samples to the sink
//! 4. Stop when the decoder wants more input or fails hard
//!
//! Nothing here returns an error: failures are logged and the next payload
//! starts fresh from whatever state the decoder is in.

use crate::audio::codec::{make_decoder, AudioDecoder, CodecKind};
use crate::audio::format::{PcmSpec, S16_BYTES};
use crate::audio::playback::PlaybackSink;
use crate::audio::resampler::Resampler;
use serde::Serialize;
use tracing::{debug, error, warn};

/// What one `decode_and_play` call did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodeReport {
    pub frames_decoded: u32,
    pub frames_played: u32,
    pub frames_skipped: u32,
    pub bytes_written: usize,
    pub rejected: bool,
}

pub struct DecodeEngine {
    decoder: Option<Box<dyn AudioDecoder>>,
    resampler: Option<Resampler>,
    output: PcmSpec,
    sink: Box<dyn PlaybackSink>,
}

impl DecodeEngine {
    /// Open a decoder for `kind`. If that fails the engine is still built and
    /// every payload is skipped.
    pub fn new(kind: CodecKind, pcm_rate: u32, target_rate: u32, sink: Box<dyn PlaybackSink>) -> Self {
        let decoder = match make_decoder(kind, pcm_rate) {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                error!(codec = kind.name(), error = %e, "Failed to open decoder, playback disabled");
                None
            }
        };
        Self::with_decoder(decoder, target_rate, sink)
    }

    pub fn with_decoder(
        decoder: Option<Box<dyn AudioDecoder>>,
        target_rate: u32,
        sink: Box<dyn PlaybackSink>,
    ) -> Self {
        Self {
            decoder,
            resampler: None,
            output: PcmSpec::mono_s16(target_rate),
            sink,
        }
    }

    pub fn output(&self) -> &PcmSpec {
        &self.output
    }

    pub fn decode_and_play(&mut self, payload: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();

        let Some(decoder) = self.decoder.as_mut() else {
            debug!(bytes = payload.len(), "No decoder, skipping payload");
            report.rejected = true;
            return report;
        };

        if let Err(e) = decoder.send_packet(payload) {
            warn!(decoder = decoder.name(), bytes = payload.len(), error = %e, "Payload rejected by decoder");
            report.rejected = true;
            return report;
        }

        loop {
            let frame = match decoder.receive_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!(decoder = decoder.name(), error = %e, "Decode failed");
                    break;
                }
            };
            report.frames_decoded += 1;

            let in_spec = frame.spec();
            if self.resampler.is_none() {
                match Resampler::new(in_spec, self.output) {
                    Ok(r) => {
                        debug!(
                            in_rate = in_spec.sample_rate,
                            in_channels = in_spec.channels(),
                            in_format = in_spec.format.name(),
                            out_rate = self.output.sample_rate,
                            "Playback resampler configured"
                        );
                        self.resampler = Some(r);
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to create playback resampler");
                        return report;
                    }
                }
            }
            let Some(resampler) = self.resampler.as_mut() else {
                return report;
            };

            let in_frames = frame.frames();
            if in_frames == 0 {
                debug!("Decoded frame has no samples, skipping");
                report.frames_skipped += 1;
                continue;
            }

            let capacity = resampler.out_capacity(in_frames);
            let converted = match resampler.convert(&frame.data, capacity) {
                Ok(converted) => converted,
                Err(e) => {
                    warn!(error = %e, "Resampling failed, skipping frame");
                    report.frames_skipped += 1;
                    continue;
                }
            };

            let bytes = converted.to_s16le_bytes();
            debug_assert_eq!(bytes.len(), converted.len() * S16_BYTES);
            if !bytes.is_empty() {
                self.sink.write(&bytes);
                report.bytes_written += bytes.len();
            }
            report.frames_played += 1;
        }

        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::aac::tests::SILENT_STEREO_FRAME;
    use crate::audio::codec::g711::{linear_to_ulaw, Law};
    use crate::audio::codec::DecodedFrame;
    use crate::audio::format::{s16le_bytes_to_samples, ChannelLayout, SampleData};
    use crate::error::CodecError;
    use std::sync::{Arc, Mutex};

    /// Sink that keeps every chunk it receives.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureSink(pub Arc<Mutex<Vec<Vec<u8>>>>);

    impl CaptureSink {
        pub(crate) fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().concat()
        }
    }

    impl PlaybackSink for CaptureSink {
        fn write(&mut self, pcm: &[u8]) {
            self.0.lock().unwrap().push(pcm.to_vec());
        }
    }

    /// Decoder that replays scripted results.
    struct Scripted {
        frames: Vec<Result<Option<DecodedFrame>, CodecError>>,
    }

    impl AudioDecoder for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn send_packet(&mut self, _: &[u8]) -> Result<(), CodecError> {
            Ok(())
        }
        fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
            if self.frames.is_empty() {
                return Ok(None);
            }
            self.frames.remove(0)
        }
    }

    #[test]
    fn g711_payload_plays_at_target_rate() {
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::new(CodecKind::MuLaw, 0, 16000, Box::new(sink.clone()));

        let payload: Vec<u8> = (0..512).map(|i| linear_to_ulaw((i % 64) as i16 * 100)).collect();
        let report = engine.decode_and_play(&payload);

        assert_eq!(report.frames_decoded, 1);
        assert_eq!(report.frames_played, 1);
        // 8k -> 16k doubles the sample count.
        let played = s16le_bytes_to_samples(&sink.bytes());
        assert!((1020..=1026).contains(&played.len()), "played {}", played.len());
        assert_eq!(report.bytes_written, played.len() * 2);
    }

    #[test]
    fn equal_rates_play_decoded_samples_unchanged() {
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::new(CodecKind::ALaw, 0, 8000, Box::new(sink.clone()));
        let payload = [Law::A.encode(0), Law::A.encode(1000), Law::A.encode(-2000)];
        engine.decode_and_play(&payload);
        let played = s16le_bytes_to_samples(&sink.bytes());
        let expected: Vec<i16> = payload.iter().map(|&b| Law::A.decode(b)).collect();
        assert_eq!(played, expected);
    }

    #[test]
    fn aac_frames_decode_through_symphonia() {
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::new(CodecKind::Aac, 0, 44100, Box::new(sink.clone()));

        let report = engine.decode_and_play(&SILENT_STEREO_FRAME);
        assert_eq!(report.frames_decoded, 1);
        assert_eq!(report.bytes_written, 2048);

        // A cut-off frame is rejected and the decoder carries on.
        let damaged = engine.decode_and_play(&SILENT_STEREO_FRAME[..10]);
        assert!(damaged.rejected);
        assert_eq!(damaged.frames_decoded, 0);

        let report = engine.decode_and_play(&SILENT_STEREO_FRAME);
        assert_eq!(report.frames_decoded, 1);
        assert_eq!(report.bytes_written, 2048);
    }

    #[test]
    fn rejected_payload_keeps_the_decoder() {
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::new(CodecKind::Pcm, 44100, 44100, Box::new(sink.clone()));

        let bad = engine.decode_and_play(&[1, 2, 3]);
        assert!(bad.rejected);
        assert_eq!(sink.bytes(), Vec::<u8>::new());

        let good = engine.decode_and_play(&[0x10, 0x00, 0x20, 0x00]);
        assert!(!good.rejected);
        assert_eq!(sink.bytes(), vec![0x10, 0x00, 0x20, 0x00]);
    }

    #[test]
    fn missing_decoder_skips_everything() {
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::with_decoder(None, 44100, Box::new(sink.clone()));
        assert!(engine.decode_and_play(&[0; 64]).rejected);
        assert!(sink.bytes().is_empty());
    }

    #[test]
    fn empty_frames_are_skipped_and_errors_stop_the_drain() {
        let mono = |data: Vec<i16>| DecodedFrame {
            sample_rate: 44100,
            channels: 1,
            layout: Some(ChannelLayout::Mono),
            data: SampleData::S16(data),
        };
        let decoder = Scripted {
            frames: vec![
                Ok(Some(mono(vec![]))),
                Ok(Some(mono(vec![5, 6]))),
                Err(CodecError::InvalidData("corrupt".into())),
                Ok(Some(mono(vec![7]))),
            ],
        };
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::with_decoder(Some(Box::new(decoder)), 44100, Box::new(sink.clone()));

        let report = engine.decode_and_play(b"x");
        assert_eq!(report.frames_decoded, 2);
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(report.frames_played, 1);
        assert_eq!(s16le_bytes_to_samples(&sink.bytes()), vec![5, 6]);

        // The frame queued after the error is picked up by the next call.
        engine.decode_and_play(b"y");
        assert_eq!(s16le_bytes_to_samples(&sink.bytes()), vec![5, 6, 7]);
    }

    #[test]
    fn stereo_float_is_downmixed_for_playback() {
        let decoder = Scripted {
            frames: vec![Ok(Some(DecodedFrame {
                sample_rate: 44100,
                channels: 2,
                layout: None,
                data: SampleData::F32(vec![0.5, 0.5, -0.5, -0.5]),
            }))],
        };
        let sink = CaptureSink::default();
        let mut engine = DecodeEngine::with_decoder(Some(Box::new(decoder)), 44100, Box::new(sink.clone()));
        engine.decode_and_play(b"z");
        assert_eq!(s16le_bytes_to_samples(&sink.bytes()), vec![16384, -16384]);
    }
}
