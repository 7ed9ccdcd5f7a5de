//! RTCM3 Stream Parser
//!
//! Restartable scanner over an accumulated byte stream. Complete frames are
//! consumed, a trailing partial frame stays buffered until more bytes arrive.

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tracing::trace;

use super::frame::{crc24q, declared_length, RtcmFrame, CRC_LEN, HEADER_LEN, PREAMBLE};
use crate::error::FrameDecodeError;
use crate::metrics::Statistics;

/// Incremental RTCM3 frame parser
#[derive(Debug, Default)]
pub struct FrameParser {
    buffer: BytesMut,
    stats: Option<Arc<Statistics>>,
    resyncs: u64,
    crc_failures: u64,
    noise_bytes: u64,
    // Set after a CRC failure so the noise skipped while searching for the
    // next preamble is not counted as a second resync.
    resyncing: bool,
    // Bytes of the last invalid frame still at the head of the buffer.
    // Candidates starting inside it are noise, not further failures.
    invalid_span: usize,
}

impl FrameParser {
    /// Create a parser without a statistics sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a parser that reports frames and resyncs into `stats`
    pub fn with_statistics(stats: Arc<Statistics>) -> Self {
        Self {
            stats: Some(stats),
            ..Self::default()
        }
    }

    /// Append stream bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Iterate over the frames that can be decoded from what is buffered
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { parser: self }
    }

    /// Bytes buffered but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Resync events so far (noise runs and CRC failures)
    pub fn resync_count(&self) -> u64 {
        self.resyncs
    }

    /// CRC failures so far
    pub fn crc_failures(&self) -> u64 {
        self.crc_failures
    }

    /// Bytes discarded while searching for a preamble
    pub fn noise_bytes(&self) -> u64 {
        self.noise_bytes
    }

    /// Drop buffered bytes. Used when the upstream stream restarts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.resyncing = false;
        self.invalid_span = 0;
    }

    /// Decode the next frame, or `None` if more bytes are needed.
    ///
    /// Frames failing the CRC check are returned with `valid == false`; the
    /// scan then resumes one byte after their preamble.
    pub fn next_frame(&mut self) -> Option<RtcmFrame> {
        loop {
            match self.buffer.iter().position(|&b| b == PREAMBLE) {
                None => {
                    if !self.buffer.is_empty() {
                        let skipped = self.buffer.len();
                        self.consume(skipped);
                        self.record_error(FrameDecodeError::NoiseDiscarded(skipped));
                    }
                    return None;
                }
                Some(0) => {}
                Some(offset) => {
                    self.consume(offset);
                    self.record_error(FrameDecodeError::NoiseDiscarded(offset));
                }
            }

            if self.buffer.len() < HEADER_LEN {
                return None;
            }

            let length = declared_length(&self.buffer);
            let total = HEADER_LEN + length + CRC_LEN;
            if self.buffer.len() < total {
                return None;
            }

            let body_end = HEADER_LEN + length;
            let computed = crc24q(&self.buffer[..body_end]);
            let trailer = &self.buffer[body_end..total];
            let received = u32::from_be_bytes([0, trailer[0], trailer[1], trailer[2]]);

            if computed == received {
                let raw = self.buffer.split_to(total).freeze();
                self.invalid_span = self.invalid_span.saturating_sub(total);
                let frame = RtcmFrame::from_raw(raw, length, true);
                self.resyncing = false;
                if let Some(stats) = &self.stats {
                    stats.record_frame(&frame);
                }
                trace!(message_type = frame.message_type, length, "Decoded RTCM3 frame");
                return Some(frame);
            }

            if self.invalid_span > 0 {
                // False preamble inside the frame already reported invalid
                self.consume(1);
                self.record_error(FrameDecodeError::NoiseDiscarded(1));
                continue;
            }

            // A bad CRC means the declared length is untrustworthy, so only
            // the preamble byte is consumed.
            let raw = self.buffer[..total].to_vec().into();
            self.buffer.advance(1);
            self.invalid_span = total - 1;
            self.record_error(FrameDecodeError::CrcMismatch { computed, received });
            return Some(RtcmFrame::from_raw(raw, length, false));
        }
    }

    fn consume(&mut self, count: usize) {
        self.buffer.advance(count);
        self.invalid_span = self.invalid_span.saturating_sub(count);
    }

    fn record_error(&mut self, error: FrameDecodeError) {
        trace!(%error, "RTCM3 resync");
        match error {
            FrameDecodeError::NoiseDiscarded(skipped) => {
                self.noise_bytes += skipped as u64;
                let new_event = !self.resyncing;
                if new_event {
                    self.resyncs += 1;
                }
                if let Some(stats) = &self.stats {
                    stats.record_noise(skipped, new_event);
                }
            }
            FrameDecodeError::CrcMismatch { .. } => {
                self.crc_failures += 1;
                self.resyncs += 1;
                self.resyncing = true;
                if let Some(stats) = &self.stats {
                    stats.record_crc_failure();
                }
            }
        }
    }
}

/// Iterator returned by [`FrameParser::frames`]
pub struct Frames<'a> {
    parser: &'a mut FrameParser,
}

impl Iterator for Frames<'_> {
    type Item = RtcmFrame;

    fn next(&mut self) -> Option<Self::Item> {
        self.parser.next_frame()
    }
}
