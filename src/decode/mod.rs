//! Fragment decoding
//!
//! Converts fragment payloads into mono f32 buffers at the session's fixed
//! output rate. Two paths:
//! - Raw PCM16: stateless conversion plus resample (see [`pcm`],
//!   [`resample`])
//! - MP3 stream: stateful container decode with persistent state across
//!   fragments of one utterance (see [`mp3`])
//!
//! Decode fails closed: malformed payloads produce no buffer and an error
//! the session turns into a diagnostic counter, never a torn session.

pub mod mp3;
pub mod pcm;
pub mod resample;

use crate::error::Result;
use crate::types::{AudioFragment, DecodedBuffer, FragmentEncoding};
use mp3::Mp3StreamDecoder;
use tracing::{debug, warn};

/// Payload signature detected by content inspection.
///
/// Used as a cross-check against the declared encoding; PCM byte streams
/// have no signature, so only a positive MP3 detection is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSignature {
    Mp3Stream,
    RawPcm,
}

/// Classify a payload by its leading bytes.
///
/// Pure function: an ID3v2 preamble or an MP3 frame sync at offset zero
/// marks a container stream; anything else is treated as raw samples.
pub fn detect_format(payload: &[u8]) -> PayloadSignature {
    if payload.len() >= 3 && &payload[..3] == b"ID3" {
        return PayloadSignature::Mp3Stream;
    }
    if payload.len() >= 4 && mp3::parse_frame_header(&payload[..4]).is_some() {
        return PayloadSignature::Mp3Stream;
    }
    PayloadSignature::RawPcm
}

/// Decoder for inbound fragments.
///
/// Holds at most one live streaming-container state at a time; the state is
/// created lazily on the first container fragment of an utterance and
/// destroyed on [`FragmentDecoder::reset_stream`].
pub struct FragmentDecoder {
    output_rate: u32,
    stream: Option<Mp3StreamDecoder>,
}

impl FragmentDecoder {
    pub fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            stream: None,
        }
    }

    /// Decode one fragment into a buffer at the output rate.
    ///
    /// Returns `Ok(None)` when a container stream has not yet accumulated a
    /// complete frame. Errors mean the fragment is dropped; for the MP3
    /// path they additionally mean the stream state was discarded and will
    /// be recreated at the next utterance boundary.
    pub fn decode(&mut self, fragment: &AudioFragment) -> Result<Option<DecodedBuffer>> {
        match fragment.encoding {
            FragmentEncoding::RawPcm16 { sample_rate } => {
                if detect_format(&fragment.payload) == PayloadSignature::Mp3Stream {
                    // Not fatal: PCM bytes can start with a false sync, but
                    // an announcement/payload mismatch is worth surfacing.
                    debug!(
                        sequence = fragment.sequence,
                        "payload declared raw PCM but carries an MP3 signature"
                    );
                }
                let samples = pcm::decode_pcm16(&fragment.payload);
                if samples.is_empty() {
                    return Ok(None);
                }
                let samples = resample::resample_mono(&samples, sample_rate, self.output_rate)?;
                Ok(Some(DecodedBuffer::new(
                    fragment.sequence,
                    fragment.utterance.clone(),
                    samples,
                    self.output_rate,
                )))
            }
            FragmentEncoding::Mp3Stream => {
                let stream = self.stream.get_or_insert_with(Mp3StreamDecoder::new);
                match stream.feed(&fragment.payload) {
                    Ok(None) => Ok(None),
                    Ok(Some((samples, source_rate))) => {
                        let samples =
                            resample::resample_mono(&samples, source_rate, self.output_rate)?;
                        Ok(Some(DecodedBuffer::new(
                            fragment.sequence,
                            fragment.utterance.clone(),
                            samples,
                            self.output_rate,
                        )))
                    }
                    Err(e) => {
                        // Desynchronized stream: discard the instance; the
                        // rest of this utterance's container audio is lost
                        // but the session continues.
                        warn!(
                            sequence = fragment.sequence,
                            utterance = %fragment.utterance,
                            "discarding desynchronized stream decoder"
                        );
                        self.stream = None;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Destroy the streaming-container state (utterance boundary reset).
    pub fn reset_stream(&mut self) {
        if self.stream.take().is_some() {
            debug!("streaming decoder state reset");
        }
    }

    /// Whether container state is currently live.
    pub fn has_stream_state(&self) -> bool {
        self.stream.is_some()
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UtteranceId;

    fn pcm_fragment(sequence: u64, values: &[i16], sample_rate: u32) -> AudioFragment {
        AudioFragment {
            sequence,
            utterance: UtteranceId::from("u1"),
            encoding: FragmentEncoding::RawPcm16 { sample_rate },
            payload: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(b"ID3\x04\x00"), PayloadSignature::Mp3Stream);
        assert_eq!(
            detect_format(&[0xFF, 0xFB, 0x90, 0x00]),
            PayloadSignature::Mp3Stream
        );
        assert_eq!(detect_format(&[0x00, 0x01, 0x02, 0x03]), PayloadSignature::RawPcm);
        assert_eq!(detect_format(&[]), PayloadSignature::RawPcm);
    }

    #[test]
    fn test_pcm_decode_at_output_rate() {
        let mut decoder = FragmentDecoder::new(48_000);
        let fragment = pcm_fragment(0, &[1000, -1000], 48_000);

        let buffer = decoder.decode(&fragment).unwrap().unwrap();
        assert_eq!(buffer.sequence, 0);
        assert_eq!(buffer.sample_rate, 48_000);
        assert_eq!(buffer.samples.len(), 2);
        assert!((buffer.samples[0] - 1000.0 / 32_768.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pcm_decode_resamples_source_rate() {
        let mut decoder = FragmentDecoder::new(48_000);
        // 2400 frames at 24 kHz: expect roughly 4800 out.
        let values: Vec<i16> = (0..2400).map(|i| ((i % 100) * 300 - 15000) as i16).collect();
        let fragment = pcm_fragment(1, &values, 24_000);

        let buffer = decoder.decode(&fragment).unwrap().unwrap();
        assert!(buffer.samples.len() > 4700 && buffer.samples.len() < 4900);
        assert_eq!(buffer.sample_rate, 48_000);
    }

    #[test]
    fn test_empty_pcm_payload_yields_nothing() {
        let mut decoder = FragmentDecoder::new(48_000);
        let fragment = pcm_fragment(2, &[], 24_000);
        assert!(decoder.decode(&fragment).unwrap().is_none());
    }

    #[test]
    fn test_mp3_state_created_lazily_and_reset() {
        let mut decoder = FragmentDecoder::new(48_000);
        assert!(!decoder.has_stream_state());

        let fragment = AudioFragment {
            sequence: 0,
            utterance: UtteranceId::from("u1"),
            encoding: FragmentEncoding::Mp3Stream,
            payload: vec![0xFF, 0xFB, 0x90], // partial header, accumulates
        };
        let result = decoder.decode(&fragment).unwrap();
        assert!(result.is_none());
        assert!(decoder.has_stream_state());

        decoder.reset_stream();
        assert!(!decoder.has_stream_state());
    }

    #[test]
    fn test_mp3_fragment_decodes_at_output_rate() {
        let mut decoder = FragmentDecoder::new(48_000);
        let fragment = AudioFragment {
            sequence: 0,
            utterance: UtteranceId::from("u1"),
            encoding: FragmentEncoding::Mp3Stream,
            payload: mp3::fixtures::mono_stream(),
        };

        let buffer = decoder.decode(&fragment).unwrap().unwrap();
        assert_eq!(buffer.sample_rate, 48_000);
        // 22.05 kHz source resampled up: at least one frame's worth out.
        assert!(buffer.samples.len() > 576);
        assert!(buffer.samples.iter().all(|s| s.abs() <= 1.0));
        assert!(decoder.has_stream_state());
    }

    #[test]
    fn test_reset_discards_accumulated_bytes() {
        let mut decoder = FragmentDecoder::new(48_000);
        let fragment = AudioFragment {
            sequence: 0,
            utterance: UtteranceId::from("u1"),
            encoding: FragmentEncoding::Mp3Stream,
            payload: vec![0xAA; 64],
        };
        decoder.decode(&fragment).unwrap();
        decoder.reset_stream();

        // Fresh state for the next utterance: nothing pending.
        let fragment2 = AudioFragment {
            sequence: 1,
            utterance: UtteranceId::from("u2"),
            encoding: FragmentEncoding::Mp3Stream,
            payload: Vec::new(),
        };
        assert!(decoder.decode(&fragment2).unwrap().is_none());
        assert!(decoder.has_stream_state());
    }
}
