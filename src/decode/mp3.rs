//! Streaming MP3 container decode
//!
//! MP3 frames arrive split across arbitrary fragment boundaries, so decode
//! is stateful: a byte accumulator collects payload bytes, a frame scanner
//! packetizes complete frames (skipping an ID3v2 preamble and re-syncing
//! past garbage), and a persistent symphonia codec instance decodes each
//! frame. "Not enough data for a full frame yet" is a normal condition, not
//! an error.
//!
//! One `Mp3StreamDecoder` corresponds to one utterance's container stream;
//! it is destroyed and recreated at utterance boundaries by the fragment
//! decoder.

use crate::error::{Error, Result};
use symphonia::core::audio::{AudioBufferRef, Channels, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CodecParameters, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use tracing::{debug, warn};

/// Parsed MP3 frame header fields needed for packetization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameInfo {
    /// Total frame length in bytes, header included.
    pub frame_len: usize,
    pub sample_rate: u32,
    pub channels: usize,
    pub samples_per_frame: u32,
}

/// Bitrates in kbps, Layer III. Index 0 ("free") and 15 are rejected.
const BITRATES_V1_L3: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const BITRATES_V2_L3: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

/// Parse a 4-byte MP3 frame header. Only Layer III is accepted (the wire
/// format is plain MP3 speech audio).
pub(crate) fn parse_frame_header(h: &[u8]) -> Option<FrameInfo> {
    if h.len() < 4 || h[0] != 0xFF || (h[1] & 0xE0) != 0xE0 {
        return None;
    }

    // 0 = MPEG 2.5, 2 = MPEG 2, 3 = MPEG 1; 1 is reserved.
    let version = (h[1] >> 3) & 0x3;
    if version == 1 {
        return None;
    }
    // 1 = Layer III.
    let layer = (h[1] >> 1) & 0x3;
    if layer != 1 {
        return None;
    }

    let bitrate_idx = (h[2] >> 4) as usize;
    if bitrate_idx == 0 || bitrate_idx == 15 {
        return None;
    }
    let sr_idx = ((h[2] >> 2) & 0x3) as usize;
    if sr_idx == 3 {
        return None;
    }
    let padding = ((h[2] >> 1) & 0x1) as usize;

    let (sample_rate, bitrate_kbps, samples_per_frame) = match version {
        3 => ([44_100, 48_000, 32_000][sr_idx], BITRATES_V1_L3[bitrate_idx], 1152),
        2 => ([22_050, 24_000, 16_000][sr_idx], BITRATES_V2_L3[bitrate_idx], 576),
        _ => ([11_025, 12_000, 8_000][sr_idx], BITRATES_V2_L3[bitrate_idx], 576),
    };

    let frame_len =
        (samples_per_frame as usize / 8) * (bitrate_kbps as usize * 1000) / sample_rate as usize
            + padding;
    if frame_len <= 4 {
        return None;
    }

    // 3 = single channel.
    let channels = if (h[3] >> 6) == 3 { 1 } else { 2 };

    Some(FrameInfo {
        frame_len,
        sample_rate: sample_rate as u32,
        channels,
        samples_per_frame,
    })
}

/// Accumulates stream bytes and yields complete MP3 frames.
#[derive(Debug, Default)]
pub(crate) struct FrameScanner {
    buf: Vec<u8>,
    /// Consumed prefix of `buf`; compacted periodically.
    pos: usize,
    id3_skipped: bool,
}

impl FrameScanner {
    const COMPACT_THRESHOLD: usize = 4096;

    pub fn push(&mut self, bytes: &[u8]) {
        if self.pos > Self::COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Extract the next complete frame, or None if more data is needed.
    pub fn next_frame(&mut self) -> Option<(Vec<u8>, FrameInfo)> {
        self.skip_id3();

        loop {
            let avail = &self.buf[self.pos..];
            if avail.len() < 4 {
                return None;
            }

            let mut sync_at = None;
            for i in 0..=avail.len() - 4 {
                if let Some(info) = parse_frame_header(&avail[i..i + 4]) {
                    sync_at = Some((i, info));
                    break;
                }
            }

            let Some((i, info)) = sync_at else {
                // No sync word anywhere; keep the last 3 bytes in case a
                // header straddles the fragment boundary.
                self.pos = self.buf.len() - 3;
                return None;
            };

            if i > 0 {
                debug!(skipped = i, "re-synced past garbage bytes");
                self.pos += i;
                continue;
            }

            let avail = &self.buf[self.pos..];
            if avail.len() < info.frame_len {
                return None;
            }

            // Guard against a false sync: when the bytes after this frame
            // are already buffered, the next header must parse too.
            if avail.len() >= info.frame_len + 4
                && parse_frame_header(&avail[info.frame_len..info.frame_len + 4]).is_none()
            {
                self.pos += 1;
                continue;
            }

            let frame = avail[..info.frame_len].to_vec();
            self.pos += info.frame_len;
            return Some((frame, info));
        }
    }

    /// Skip an ID3v2 tag at the very start of the stream. Waits for the
    /// whole tag before consuming anything.
    fn skip_id3(&mut self) {
        if self.id3_skipped {
            return;
        }
        let avail = &self.buf[self.pos..];
        if avail.len() < 10 {
            return;
        }
        if &avail[..3] != b"ID3" {
            self.id3_skipped = true;
            return;
        }
        // Syncsafe 28-bit size, header excluded.
        let size = ((avail[6] as usize & 0x7F) << 21)
            | ((avail[7] as usize & 0x7F) << 14)
            | ((avail[8] as usize & 0x7F) << 7)
            | (avail[9] as usize & 0x7F);
        let total = 10 + size;
        if avail.len() < total {
            return;
        }
        debug!(tag_bytes = total, "skipped ID3v2 preamble");
        self.pos += total;
        self.id3_skipped = true;
    }
}

/// Stateful streaming MP3 decoder for one utterance.
pub struct Mp3StreamDecoder {
    scanner: FrameScanner,
    codec: Option<Box<dyn Decoder>>,
    sample_rate: Option<u32>,
    packet_ts: u64,
    frames_decoded: u64,
    frames_dropped: u64,
}

impl Mp3StreamDecoder {
    pub fn new() -> Self {
        Self {
            scanner: FrameScanner::default(),
            codec: None,
            sample_rate: None,
            packet_ts: 0,
            frames_decoded: 0,
            frames_dropped: 0,
        }
    }

    /// Sample rate reported by the stream header, once parsed.
    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    /// Bytes buffered awaiting a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.scanner.pending()
    }

    /// Feed payload bytes and decode every complete frame now available.
    ///
    /// Returns the decoded mono samples and their header-reported rate, or
    /// None when no complete frame was available. A malformed frame is
    /// dropped and counted; an unrecoverable codec error poisons the stream
    /// and is surfaced so the session can discard this decoder instance.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Option<(Vec<f32>, u32)>> {
        self.scanner.push(bytes);

        let mut samples = Vec::new();
        while let Some((frame, info)) = self.scanner.next_frame() {
            if self.codec.is_none() {
                self.codec = Some(make_codec(&info)?);
            }
            let Some(codec) = self.codec.as_mut() else {
                return Err(Error::Decode("MP3 codec unavailable".to_string()));
            };

            let packet = Packet::new_from_slice(
                0,
                self.packet_ts,
                info.samples_per_frame as u64,
                &frame,
            );
            self.packet_ts += info.samples_per_frame as u64;

            match codec.decode(&packet) {
                Ok(decoded) => {
                    append_mono(&decoded, &mut samples);
                    self.sample_rate = Some(info.sample_rate);
                    self.frames_decoded += 1;
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    // Recoverable: drop this frame, continue with the next.
                    self.frames_dropped += 1;
                    debug!(error = %e, "dropping malformed MP3 frame");
                }
                Err(e) => {
                    warn!(error = %e, "MP3 decoder desynchronized");
                    return Err(Error::Decode(format!("MP3 decoder desynchronized: {}", e)));
                }
            }
        }

        if samples.is_empty() {
            Ok(None)
        } else {
            // sample_rate is always set once a frame has decoded.
            let rate = self.sample_rate.unwrap_or(44_100);
            Ok(Some((samples, rate)))
        }
    }
}

impl Default for Mp3StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn make_codec(info: &FrameInfo) -> Result<Box<dyn Decoder>> {
    let channels = if info.channels == 1 {
        Channels::FRONT_LEFT
    } else {
        Channels::FRONT_LEFT | Channels::FRONT_RIGHT
    };

    let mut params = CodecParameters::new();
    params
        .for_codec(CODEC_TYPE_MP3)
        .with_sample_rate(info.sample_rate)
        .with_channels(channels);

    symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(format!("Failed to create MP3 codec: {}", e)))
}

/// Downmix a decoded symphonia buffer to mono f32, appending to `out`.
fn append_mono(buffer: &AudioBufferRef, out: &mut Vec<f32>) {
    match buffer {
        AudioBufferRef::F32(buf) => {
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            out.reserve(frames);
            if channels == 1 {
                out.extend_from_slice(buf.chan(0));
            } else {
                for frame_idx in 0..frames {
                    let mut sum = 0.0f32;
                    for ch in 0..channels {
                        sum += buf.chan(ch)[frame_idx];
                    }
                    out.push(sum / channels as f32);
                }
            }
        }
        AudioBufferRef::S16(buf) => {
            let channels = buf.spec().channels.count();
            let frames = buf.frames();
            out.reserve(frames);
            for frame_idx in 0..frames {
                let mut sum = 0.0f32;
                for ch in 0..channels {
                    sum += buf.chan(ch)[frame_idx] as f32 / 32_768.0;
                }
                out.push(sum / channels as f32);
            }
        }
        other => {
            // The bundled MP3 codec emits f32; anything else is dropped.
            warn!(format = ?other.spec(), "unsupported decoded sample format");
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// Four consecutive MPEG-2 Layer III frames (mono, 22.05 kHz, 64 kbps)
    /// taken from a real encoded stream, so the codec sees genuine side
    /// info and bit-reservoir data.
    pub fn mono_stream() -> Vec<u8> {
        const HEX: &str = concat!(
            "fff380c40000000348000000004c414d45332e39382e3255555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "55555555554c414d45332e39382e32555555555555555555555555555555555555555555",
            "55555555555555555555555555555555555555555555555555555555fff382c4c3000003",
            "480000000055555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555554c41",
            "4d45332e39382e3255555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555fff382c4ff00000348000000005555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "5555555555555555555555555555555555555555555555555555554c414d45332e39382e",
            "325555555555555555555555555555555555555555555555555555555555555555555555",
            "5555555555555555555555555555fff382c4ff0000034800000000555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "55555555555555555555555555555555555555554c414d45332e39382e32555555555555",
            "555555555555555555555555555555555555555555555555555555555555555555555555",
            "55555555555555",
        );
        (0..HEX.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&HEX[i..i + 2], 16).unwrap())
            .collect()
    }
}
