//! One accepted client of the control socket.
//!
//! Reads newline-terminated commands off a bounded input buffer, forwards
//! each complete line to the command dispatcher (via the registry's
//! pending-command queue, see [`crate::registry`]), and writes replies
//! plus any subscribed feature/raw-audio output through its bounded
//! output ring.

use std::any::Any;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use mio::Interest;
use serde_json::json;

use crate::registry::{OutputSink, PollContext, PollEvent, Pollable};
use crate::ring::{RingBuffer, DEFAULT_CAPACITY, RAW_AUDIO_CAPACITY};

/// Input is trimmed to this many bytes from the front whenever a newline
/// has not yet arrived, so a client that never sends `\n` cannot grow the
/// buffer without bound.
pub const MAX_CMD_STRING_LENGTH: usize = 512;

pub struct Connection {
    label: String,
    stream: UnixStream,
    input: Vec<u8>,
    output: RingBuffer,
    raw_output: bool,
    closed: bool,
}

impl Connection {
    pub fn new(label: String, stream: UnixStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Connection {
            label,
            stream,
            input: Vec::new(),
            output: RingBuffer::new(DEFAULT_CAPACITY),
            raw_output: false,
            closed: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Switch this connection's output ring to the larger raw-audio tier
    /// (or back to the default reply tier). Queued replies are expected
    /// to have drained before a stream mode switch; any leftover bytes
    /// that still fit the new capacity are carried over, the rest dropped.
    pub fn set_raw_output(&mut self, raw: bool) {
        if raw == self.raw_output {
            return;
        }
        self.raw_output = raw;
        let capacity = if raw { RAW_AUDIO_CAPACITY } else { DEFAULT_CAPACITY };
        let carried = self.output.drain_all();
        let mut replacement = RingBuffer::new(capacity);
        replacement.queue(&carried);
        self.output = replacement;
    }

    fn read_available(&mut self) -> std::io::Result<bool> {
        use std::io::Read;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    if !self.input.contains(&b'\n') && self.input.len() > MAX_CMD_STRING_LENGTH {
                        let excess = self.input.len() - MAX_CMD_STRING_LENGTH;
                        self.input.drain(..excess);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn drain_commands(&mut self, ctx: &mut PollContext) {
        loop {
            let Some(pos) = self.input.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !line.trim().is_empty() {
                ctx.submit_command(self.label.clone(), line);
            }
        }
    }
}

impl OutputSink for Connection {
    fn queue_output(&mut self, bytes: &[u8], _batch_ts: f64) -> bool {
        self.output.queue(bytes)
    }
}

impl Pollable for Connection {
    fn poll_fds(&self) -> Vec<(RawFd, Interest)> {
        if self.closed {
            return Vec::new();
        }
        let mut interests = Interest::READABLE;
        if !self.output.is_empty() {
            interests = interests.add(Interest::WRITABLE);
        }
        vec![(self.stream.as_raw_fd(), interests)]
    }

    fn handle_events(&mut self, events: &[PollEvent], _timed_out: bool, _now: f64, ctx: &mut PollContext) {
        let mut should_close = false;
        for ev in events {
            if ev.error || ev.read_closed {
                should_close = true;
            }
        }

        if !should_close {
            match self.read_available() {
                Ok(true) => {}
                Ok(false) => should_close = true,
                Err(_) => should_close = true,
            }
        }

        self.drain_commands(ctx);

        if !self.output.is_empty() {
            match self.output.write_some(self.stream.as_raw_fd(), 64 * 1024) {
                Ok(_) => {}
                Err(_) => should_close = true,
            }
        }

        let _ = ctx.resync(&self.label);

        if should_close {
            self.closed = true;
            ctx.remove(&self.label);
        }
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "type": "Connection",
            "label": self.label,
            "rawOutput": self.raw_output,
            "outputQueued": self.output.len(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_output_sink_mut(&mut self) -> Option<&mut dyn OutputSink> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PollableRegistry;
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;
    use std::time::Duration;

    fn insert_connection(reg: &mut PollableRegistry, stream: UnixStream) -> String {
        let label = format!("Socket#{}", stream.as_raw_fd());
        let conn = Connection::new(label.clone(), stream).unwrap();
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(conn));
        reg.insert(label.clone(), shared).unwrap();
        label
    }

    #[test]
    fn complete_line_is_submitted_as_a_command() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let label = insert_connection(&mut reg, local);

        peer.write_all(b"status\n").unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        let cmds = reg.take_pending_commands();
        assert_eq!(cmds, vec![(label, "status".to_string())]);
    }

    #[test]
    fn partial_line_is_not_submitted_until_newline_arrives() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        insert_connection(&mut reg, local);

        peer.write_all(b"stat").unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();
        assert!(reg.take_pending_commands().is_empty());

        peer.write_all(b"us\n").unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();
        assert_eq!(reg.take_pending_commands().len(), 1);
    }

    #[test]
    fn peer_hangup_removes_the_connection() {
        let (local, peer) = UnixStream::pair().unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let label = insert_connection(&mut reg, local);

        drop(peer);
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        assert!(reg.lookup(&label).is_none());
    }

    #[test]
    fn oversized_input_without_newline_is_trimmed() {
        let (local, mut peer) = UnixStream::pair().unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let label = insert_connection(&mut reg, local);

        let junk = vec![b'x'; MAX_CMD_STRING_LENGTH * 3];
        peer.write_all(&junk).unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        let shared = reg.lookup(&label).unwrap();
        let any = shared.borrow();
        let conn = any.as_any().downcast_ref::<Connection>().unwrap();
        assert!(conn.input.len() <= MAX_CMD_STRING_LENGTH);
    }
}
