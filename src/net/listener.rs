//! The control socket: a Unix-domain stream listener that accepts client
//! connections and hands each one to the registry under a fresh label.

use std::any::Any;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::cell::RefCell;

use mio::Interest;
use serde_json::json;

use crate::net::connection::Connection;
use crate::registry::{PollContext, PollEvent, Pollable};

/// Backlog passed to `listen(2)`; the source used a small fixed backlog
/// since the control socket is a low-volume local admin interface, not a
/// public-facing service.
const BACKLOG: i32 = 5;

pub struct Listener {
    label: String,
    socket: StdUnixListener,
    path: PathBuf,
    next_conn_id: u64,
    quiet: bool,
}

impl Listener {
    pub fn bind(label: String, path: impl AsRef<Path>) -> std::io::Result<Self> {
        Self::bind_with_quiet(label, path, false)
    }

    pub fn bind_with_quiet(label: String, path: impl AsRef<Path>, quiet: bool) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let socket = StdUnixListener::bind(&path)?;
        socket.set_nonblocking(true)?;
        // `std::os::unix::net::UnixListener` has no direct backlog knob;
        // the OS default is ample for a local admin socket, but set it
        // explicitly via the raw fd to match the source's fixed backlog.
        unsafe {
            libc::listen(socket.as_raw_fd(), BACKLOG);
        }
        Ok(Listener {
            label,
            socket,
            path,
            next_conn_id: 0,
            quiet,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn accept_all(&mut self, ctx: &mut PollContext) {
        loop {
            match self.socket.accept() {
                Ok((stream, _addr)) => {
                    let fd = stream.as_raw_fd();
                    let label = format!("Socket#{}", fd);
                    self.next_conn_id += 1;
                    let conn = match Connection::new(label.clone(), stream) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(conn));
                    if ctx.insert(label.clone(), shared.clone()).is_err() {
                        continue;
                    }
                    if !self.quiet {
                        let banner = json!({
                            "welcome": "sigflowd",
                            "version": env!("CARGO_PKG_VERSION"),
                        });
                        let mut line = banner.to_string();
                        line.push('\n');
                        if let Some(sink) = shared.borrow_mut().as_output_sink_mut() {
                            sink.queue_output(line.as_bytes(), 0.0);
                        }
                        let _ = ctx.resync(&label);
                    }
                    // Only takes effect if no control connection is
                    // designated yet.
                    ctx.set_control_connection(label);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Pollable for Listener {
    fn poll_fds(&self) -> Vec<(RawFd, Interest)> {
        vec![(self.socket.as_raw_fd(), Interest::READABLE)]
    }

    fn handle_events(&mut self, _events: &[PollEvent], _timed_out: bool, _now: f64, ctx: &mut PollContext) {
        self.accept_all(ctx);
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "type": "Listener",
            "label": self.label,
            "path": self.path.display().to_string(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PollableRegistry;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    fn sock_path() -> PathBuf {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut p = std::env::temp_dir();
        p.push(format!("sigflowd-test-{}-{}.sock", std::process::id(), n));
        p
    }

    #[test]
    fn accepted_connection_becomes_the_control_connection() {
        let path = sock_path();
        let listener = Listener::bind("Listener".to_string(), &path).unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(listener));
        reg.insert("Listener".to_string(), shared).unwrap();

        let _client = UnixStream::connect(&path).unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        assert!(reg.control_connection().is_some());
    }

    #[test]
    fn welcome_banner_is_sent_unless_quiet() {
        use std::io::Read;

        let path = sock_path();
        let listener = Listener::bind_with_quiet("Listener".to_string(), &path, false).unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(listener));
        reg.insert("Listener".to_string(), shared).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();
        // One more cycle drains the connection's ring onto the wire.
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("\"welcome\""));
    }

    #[test]
    fn quiet_suppresses_the_welcome_banner() {
        use std::io::Read;

        let path = sock_path();
        let listener = Listener::bind_with_quiet("Listener".to_string(), &path, true).unwrap();
        let mut reg = PollableRegistry::new().unwrap();
        let shared: Rc<RefCell<dyn Pollable>> = Rc::new(RefCell::new(listener));
        reg.insert("Listener".to_string(), shared).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();
        reg.poll_once(Some(Duration::from_millis(200))).unwrap();

        client.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 256];
        let err = client.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn bind_removes_a_stale_socket_file() {
        let path = sock_path();
        std::fs::write(&path, b"stale").unwrap();
        let listener = Listener::bind("Listener".to_string(), &path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}
