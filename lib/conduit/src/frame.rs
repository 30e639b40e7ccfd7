use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, WriteBytesExt};
use bytes::{Buf, BytesMut};

/// Size of the length prefix preceding every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encodes one frame as a single chunk: big-endian length prefix followed by
/// the payload. Keeping the frame in one chunk is what makes emission atomic
/// with respect to other senders.
#[inline]
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());

    frame
        .write_u32::<BigEndian>(payload.len() as u32)
        .expect("Error writing length prefix");
    frame.extend_from_slice(payload);

    frame
}

/// Incremental frame parser. Bytes are accumulated as they arrive off the
/// stream; complete frames are cut out one at a time. The parser is always in
/// one of two states: waiting for the 4-byte length prefix, or waiting for
/// the announced number of payload bytes.
pub struct Assembler {
    acc: BytesMut,
    next_len: Option<usize>,
    max_frame: usize,
}

impl Assembler {
    #[inline]
    pub fn new(max_frame: usize) -> Assembler {
        Assembler {
            acc: BytesMut::new(),
            next_len: None,
            max_frame,
        }
    }

    /// Appends raw stream bytes to the accumulator.
    #[inline]
    pub fn feed(&mut self, bytes: &[u8]) {
        self.acc.extend_from_slice(bytes);
    }

    /// Number of accumulated bytes not yet cut into a frame.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.acc.len()
    }

    /// True when the accumulator holds part of an unfinished frame. Used to
    /// distinguish a clean end-of-stream from one that truncates a frame.
    #[inline]
    pub fn is_mid_frame(&self) -> bool {
        self.next_len.is_some() || !self.acc.is_empty()
    }

    /// Cuts out at most one complete frame. The length prefix is parsed as
    /// soon as four bytes are buffered; a prefix above the configured cap is
    /// a protocol violation. Call in a loop to drain all complete frames.
    pub fn try_pop(&mut self) -> NetworkResult<Option<Vec<u8>>> {
        if self.next_len.is_none() && self.acc.len() >= LENGTH_PREFIX_SIZE {
            let len = self.acc.get_u32() as usize;

            if len > self.max_frame {
                return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
            }

            self.next_len = Some(len);
        }

        match self.next_len {
            Some(len) if self.acc.len() >= len => {
                self.next_len = None;
                Ok(Some(self.acc.split_to(len).to_vec()))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut assembler = Assembler::new(1024);

        assembler.feed(&encode(b"hello"));

        assert_eq!(assembler.try_pop().unwrap().unwrap(), b"hello");
        assert!(assembler.try_pop().unwrap().is_none());
        assert!(!assembler.is_mid_frame());
    }

    #[test]
    fn test_empty_frame() {
        let mut assembler = Assembler::new(1024);
        let frame = encode(b"");

        assert_eq!(frame.len(), LENGTH_PREFIX_SIZE);

        assembler.feed(&frame);

        assert_eq!(assembler.try_pop().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_header_parsed_at_four_bytes() {
        // A bare zero-length prefix must be enough to emit the empty frame.
        let mut assembler = Assembler::new(1024);

        assembler.feed(&[0, 0, 0, 0]);

        assert_eq!(assembler.try_pop().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut assembler = Assembler::new(1024);
        let frame = encode(b"fragmented");
        let mut popped = Vec::new();

        for byte in &frame {
            assembler.feed(&[*byte]);

            if let Some(payload) = assembler.try_pop().unwrap() {
                popped.push(payload);
            }
        }

        assert_eq!(popped, vec![b"fragmented".to_vec()]);
    }

    #[test]
    fn test_multiple_frames_single_feed() {
        let mut assembler = Assembler::new(1024);
        let mut wire = Vec::new();

        wire.extend_from_slice(&encode(b"one"));
        wire.extend_from_slice(&encode(b""));
        wire.extend_from_slice(&encode(b"three"));

        assembler.feed(&wire);

        assert_eq!(assembler.try_pop().unwrap().unwrap(), b"one");
        assert_eq!(assembler.try_pop().unwrap().unwrap(), b"");
        assert_eq!(assembler.try_pop().unwrap().unwrap(), b"three");
        assert!(assembler.try_pop().unwrap().is_none());
    }

    #[test]
    fn test_arbitrary_split() {
        let mut assembler = Assembler::new(1024);
        let mut wire = Vec::new();

        for index in 0..10u8 {
            wire.extend_from_slice(&encode(&vec![index; index as usize]));
        }

        let mut popped = Vec::new();

        for chunk in wire.chunks(7) {
            assembler.feed(chunk);

            while let Some(payload) = assembler.try_pop().unwrap() {
                popped.push(payload);
            }
        }

        assert_eq!(popped.len(), 10);

        for (index, payload) in popped.iter().enumerate() {
            assert_eq!(payload, &vec![index as u8; index]);
        }
    }

    #[test]
    fn test_oversize_frame_fatal() {
        let mut assembler = Assembler::new(8);

        assembler.feed(&encode(&[0; 9]));

        assert_eq!(
            assembler.try_pop().unwrap_err(),
            NetworkError::Fatal(ErrorType::FrameTooLarge)
        );
    }

    #[test]
    fn test_mid_frame_detection() {
        let mut assembler = Assembler::new(1024);
        let frame = encode(b"partial");

        assembler.feed(&frame[..frame.len() - 1]);

        assert!(assembler.try_pop().unwrap().is_none());
        assert!(assembler.is_mid_frame());
    }
}
