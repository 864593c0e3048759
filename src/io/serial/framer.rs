// src/io/serial/framer.rs
//
// ASCII-hex framing used by TWELITE serial output:
//   ':' <hex byte pairs> <LRC byte as hex> CR LF
// The framer is fed one byte at a time and yields the binary payload of each
// complete frame. Bad frames are dropped and parsing resumes at the next ':'.

use crate::checksums::{lrc8_checksum, lrc8_valid, sum8_checksum};
use crate::error::FrameError;

// =============================================================================
// Constants
// =============================================================================

const START_MARKER: u8 = b':';
const CR: u8 = 0x0D;
const LF: u8 = 0x0A;
/// Terminates a frame that carries no LRC byte.
const NO_CHECKSUM_TERMINATOR: u8 = b'X';

/// Longest payload accepted before the frame is abandoned.
pub const MAX_PAYLOAD_LEN: usize = 1024;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for ':'
    Idle,
    /// Inside a frame, accumulating hex digits
    Reading,
}

/// Byte-at-a-time ASCII frame parser.
#[derive(Debug)]
pub struct AsciiFramer {
    state: State,
    buffer: Vec<u8>,
    /// High nibble waiting for its low half
    pending_nibble: Option<u8>,
    nibbles: usize,
    frames_ok: u64,
    frames_dropped: u64,
}

impl Default for AsciiFramer {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl AsciiFramer {
    pub fn new() -> Self {
        AsciiFramer {
            state: State::Idle,
            buffer: Vec::with_capacity(128),
            pending_nibble: None,
            nibbles: 0,
            frames_ok: 0,
            frames_dropped: 0,
        }
    }

    /// Feed a buffer of raw serial bytes, returning every frame outcome in order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>, FrameError>> {
        data.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Feed one byte. Returns `Some` when a frame finished, successfully or not.
    pub fn push(&mut self, byte: u8) -> Option<Result<Vec<u8>, FrameError>> {
        if byte == START_MARKER {
            // A new start marker always restarts, even mid-frame.
            self.begin();
            return None;
        }

        if self.state == State::Idle {
            return None;
        }

        let outcome = match byte {
            CR | LF => self.finish_checked(),
            NO_CHECKSUM_TERMINATOR => self.finish_unchecked(),
            _ => match hex_value(byte) {
                Some(nibble) => return self.accept_nibble(nibble),
                None => Err(FrameError::InvalidHex(byte)),
            },
        };

        self.reset();
        match &outcome {
            Ok(_) => self.frames_ok += 1,
            Err(_) => self.frames_dropped += 1,
        }
        Some(outcome)
    }

    /// Discard any partial frame.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buffer.clear();
        self.pending_nibble = None;
        self.nibbles = 0;
    }

    /// True while a frame is being accumulated.
    pub fn in_frame(&self) -> bool {
        self.state == State::Reading
    }

    /// Counts of (completed, dropped) frames since construction.
    pub fn stats(&self) -> (u64, u64) {
        (self.frames_ok, self.frames_dropped)
    }

    fn begin(&mut self) {
        self.reset();
        self.state = State::Reading;
    }

    fn accept_nibble(&mut self, nibble: u8) -> Option<Result<Vec<u8>, FrameError>> {
        self.nibbles += 1;
        match self.pending_nibble.take() {
            None => self.pending_nibble = Some(nibble),
            Some(high) => {
                if self.buffer.len() >= MAX_PAYLOAD_LEN {
                    self.reset();
                    self.frames_dropped += 1;
                    return Some(Err(FrameError::Overflow(MAX_PAYLOAD_LEN)));
                }
                self.buffer.push((high << 4) | nibble);
            }
        }
        None
    }

    fn finish_checked(&mut self) -> Result<Vec<u8>, FrameError> {
        // Payload plus LRC byte, both complete.
        if self.nibbles < 4 || self.nibbles % 2 != 0 {
            return Err(FrameError::Malformed { nibbles: self.nibbles });
        }

        if !lrc8_valid(&self.buffer) {
            return Err(FrameError::Checksum {
                sum: sum8_checksum(&self.buffer),
            });
        }

        let mut payload = std::mem::take(&mut self.buffer);
        payload.pop();
        Ok(payload)
    }

    fn finish_unchecked(&mut self) -> Result<Vec<u8>, FrameError> {
        if self.nibbles < 2 || self.nibbles % 2 != 0 {
            return Err(FrameError::Malformed { nibbles: self.nibbles });
        }
        Ok(std::mem::take(&mut self.buffer))
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode a payload as an ASCII frame: `:` + hex + LRC + CR LF.
pub fn encode_ascii_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2 + 5);
    out.push(START_MARKER);
    out.extend_from_slice(hex::encode_upper(payload).as_bytes());
    out.extend_from_slice(hex::encode_upper([lrc8_checksum(payload)]).as_bytes());
    out.push(CR);
    out.push(LF);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const APP_TWELITE_LINE: &[u8] = b":7881150175810000380026C9000C04220000FFFFFFFFFFA7\r\n";

    fn ok_frames(results: Vec<Result<Vec<u8>, FrameError>>) -> Vec<Vec<u8>> {
        results.into_iter().filter_map(Result::ok).collect()
    }

    #[test]
    fn test_parses_captured_line() {
        let mut framer = AsciiFramer::new();
        let results = framer.feed(APP_TWELITE_LINE);

        // CR completes the frame, the trailing LF is ignored while idle
        assert_eq!(results.len(), 1);
        let payload = results[0].as_ref().unwrap();
        assert_eq!(payload.len(), 23);
        assert_eq!(payload[0], 0x78);
        assert_eq!(payload[22], 0xFF);
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_checksum_error_then_resync() {
        let mut framer = AsciiFramer::new();
        let mut data = APP_TWELITE_LINE.to_vec();
        data[10] = b'0'; // LQI 0x75 -> 0x70
        data.extend_from_slice(APP_TWELITE_LINE);

        let results = framer.feed(&data);
        assert_eq!(results.len(), 2);
        // the payload plus LRC now sums to -5
        assert_eq!(results[0], Err(FrameError::Checksum { sum: 0xFB }));
        assert_eq!(results[1].as_ref().unwrap().len(), 23);
        assert_eq!(framer.stats(), (1, 1));
    }

    #[test]
    fn test_lowercase_hex_drops_frame() {
        let mut framer = AsciiFramer::new();
        let results = framer.feed(b":78a1\r\n");
        assert_eq!(results, vec![Err(FrameError::InvalidHex(b'a'))]);
    }

    #[test]
    fn test_odd_digit_count_is_malformed() {
        let mut framer = AsciiFramer::new();
        let results = framer.feed(b":12345\r\n");
        assert_eq!(results, vec![Err(FrameError::Malformed { nibbles: 5 })]);
    }

    #[test]
    fn test_restart_on_start_marker_mid_frame() {
        let mut framer = AsciiFramer::new();
        let mut data = b":1234".to_vec();
        data.extend_from_slice(APP_TWELITE_LINE);
        assert_eq!(ok_frames(framer.feed(&data)).len(), 1);
    }

    #[test]
    fn test_noise_between_frames_is_ignored() {
        let mut framer = AsciiFramer::new();
        let mut data = b"garbage\x00\xFF ".to_vec();
        data.extend_from_slice(APP_TWELITE_LINE);
        data.extend_from_slice(b"\r\n\r\n");
        data.extend_from_slice(APP_TWELITE_LINE);
        assert_eq!(ok_frames(framer.feed(&data)).len(), 2);
    }

    #[test]
    fn test_x_terminator_skips_checksum() {
        let mut framer = AsciiFramer::new();
        let results = framer.feed(b":0102X");
        assert_eq!(results, vec![Ok(vec![0x01, 0x02])]);
    }

    #[test]
    fn test_overflow_is_dropped() {
        let mut framer = AsciiFramer::new();
        let mut data = vec![b':'];
        data.extend(std::iter::repeat(b'A').take((MAX_PAYLOAD_LEN + 1) * 2));
        let results = framer.feed(&data);
        assert_eq!(results, vec![Err(FrameError::Overflow(MAX_PAYLOAD_LEN))]);
        assert!(!framer.in_frame());
    }

    #[test]
    fn test_encode_matches_captured_line() {
        let payload = hex::decode("7881150175810000380026C9000C04220000FFFFFFFFFF").unwrap();
        assert_eq!(encode_ascii_frame(&payload), APP_TWELITE_LINE.to_vec());
    }

    proptest! {
        #[test]
        fn test_encoded_frames_parse_back(payload in prop::collection::vec(any::<u8>(), 1..200)) {
            let mut framer = AsciiFramer::new();
            let results = framer.feed(&encode_ascii_frame(&payload));
            prop_assert_eq!(results, vec![Ok(payload)]);
        }

        #[test]
        fn test_single_corruption_only_drops_its_frame(
            payload in prop::collection::vec(any::<u8>(), 1..64),
            pos in any::<prop::sample::Index>(),
            replacement in prop::sample::select(b"0123456789ABCDEF".to_vec()),
        ) {
            let mut bad = encode_ascii_frame(&payload);
            // Corrupt one hex digit (skip ':' and the CR LF tail).
            let idx = 1 + pos.index(bad.len() - 3);
            prop_assume!(bad[idx] != replacement);
            bad[idx] = replacement;

            let mut stream = bad;
            stream.extend_from_slice(&encode_ascii_frame(&payload));

            let mut framer = AsciiFramer::new();
            let results = framer.feed(&stream);
            prop_assert_eq!(results.len(), 2);
            prop_assert!(results[0].is_err());
            prop_assert_eq!(results[1].clone(), Ok(payload));
        }
    }
}
