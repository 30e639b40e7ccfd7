use std::collections::VecDeque;
use std::io;

/// Ordered queue of pending outbound byte chunks. Chunks are appended at the
/// tail and drained from the head, so the wire sees bytes in exactly the
/// order they were queued. The byte counter always equals the sum of the
/// queued chunk lengths and doubles as the back-pressure signal.
pub struct SendQueue {
    chunks: VecDeque<Vec<u8>>,
    size: usize,
}

impl SendQueue {
    #[inline]
    pub fn new() -> SendQueue {
        SendQueue {
            chunks: VecDeque::new(),
            size: 0,
        }
    }

    /// Total number of queued bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Appends a chunk at the tail. Empty chunks are dropped.
    #[inline]
    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        self.size += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Writes queued chunks to the supplied writer until the queue is empty
    /// or the writer refuses more data. On a short write the remainder is put
    /// back at the head, preserving order. Returns the number of bytes
    /// written; a would-block error terminates the drain and is left to the
    /// caller to fold.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let mut total = 0;

        while let Some(chunk) = self.chunks.pop_front() {
            let mut offset = 0;

            while offset < chunk.len() {
                match writer.write(&chunk[offset..]) {
                    Ok(0) => {
                        self.restore(chunk, offset);
                        return Err(io::ErrorKind::WriteZero.into());
                    }
                    Ok(count) => {
                        offset += count;
                        total += count;
                        self.size -= count;
                    }
                    Err(err) => {
                        self.restore(chunk, offset);
                        return Err(err);
                    }
                }
            }
        }

        Ok(total)
    }

    /// Puts the unwritten remainder of a chunk back at the head.
    #[inline]
    fn restore(&mut self, chunk: Vec<u8>, offset: usize) {
        if offset == 0 {
            self.chunks.push_front(chunk);
        } else {
            self.chunks.push_front(chunk[offset..].to_vec());
        }
    }
}
