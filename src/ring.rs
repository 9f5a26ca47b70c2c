//! Bounded byte ring buffer backing every participant's output side.
//!
//! Mirrors `boost::circular_buffer<char>` as used by the source's
//! `Pollable::outputBuffer`: a fixed-capacity FIFO of bytes with
//! nonblocking drain via `write`. `VecDeque` already gives us the
//! contiguous-slice access the source got from `array_one()`/`array_two()`,
//! via `as_slices()`.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::unix::io::RawFd;

/// Default ring capacity for command-reply connections.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;
/// Capacity for connections streaming raw decimated/FM audio.
pub const RAW_AUDIO_CAPACITY: usize = 512 * 1024;
/// Capacity for WAV file writers, which buffer whole capture periods.
pub const WAV_WRITER_CAPACITY: usize = 16 * 1024 * 1024;

pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append `bytes`, failing if doing so would exceed capacity. The
    /// caller owns dropping the data on failure -- this never truncates.
    pub fn queue(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.capacity - self.buf.len() {
            return false;
        }
        self.buf.extend(bytes.iter().copied());
        true
    }

    /// Write up to `min(max_bytes, first contiguous slice)` bytes to `fd`
    /// with a single nonblocking write, advancing the read cursor by
    /// however much was actually accepted. Returns the number of bytes
    /// written, or a negative-signaling `io::Error` on failure (callers
    /// otherwise treat `EWOULDBLOCK`/`EAGAIN` as "wrote zero, try later").
    pub fn write_some(&mut self, fd: RawFd, max_bytes: usize) -> io::Result<usize> {
        let (first, _second) = self.buf.as_slices();
        if first.is_empty() {
            return Ok(0);
        }
        let to_write = max_bytes.min(first.len());
        let slice = &first[..to_write];

        // SAFETY: `fd` is owned by the caller and known open; this mirrors
        // a raw `write(2)` without taking ownership of the descriptor.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let result = file.write(slice);
        std::mem::forget(file);

        match result {
            Ok(n) => {
                self.buf.drain(..n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drain every queued byte out, in order. Used when a participant
    /// swaps to a differently-sized ring (e.g. a connection toggling raw
    /// audio streaming) and wants to carry over whatever was pending.
    pub fn drain_all(&mut self) -> Vec<u8> {
        self.buf.drain(..).collect()
    }
}

use std::os::unix::io::FromRawFd;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_rejects_overflow() {
        let mut r = RingBuffer::new(4);
        assert!(r.queue(&[1, 2, 3, 4]));
        assert!(!r.queue(&[5]));
        assert_eq!(r.len(), 4);
    }

    #[test]
    fn queue_accepts_up_to_capacity_after_drain() {
        let mut r = RingBuffer::new(4);
        assert!(r.queue(&[1, 2]));
        r.buf.drain(..2);
        assert!(r.queue(&[3, 4, 5, 6]));
    }
}
