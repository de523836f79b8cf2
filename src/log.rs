//! The diagnostic line sink.
//!
//! A small mutex-guarded writer, disjoint from all protocol state, that
//! serializes tagged diagnostic lines: a short prefix (`"< "`, `">>"`,
//! `"<<"`, `"= "`, `"? "`), the peer's address in dotted-quad form (or
//! blank), and a relative timestamp in seconds with millisecond precision
//! since the sink was created.
//!
//! Its lock must never be held at the same time as
//! [`crate::state::CommandLog`]'s: a slow log sink must not stall the
//! command path, and holding both at once would open a deadlock if a log
//! write ever blocked on something downstream of the command path.

use std::io::Write;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Instant;

/// Serializes diagnostic lines to a shared sink.
pub struct LogSink {
    start: Instant,
    out: Mutex<Box<dyn Write + Send>>,
    /// Verbosity threshold; a call to [`LogSink::at`] below this level is a
    /// no-op. Mirrors the original's `DEBUGL(n)` gate: level 1 covers
    /// resends and timeouts, level 2 adds new/lost slave notices and the
    /// first line of every reply, level 3 logs every line of every reply.
    level: u8,
}

impl LogSink {
    pub fn new(out: impl Write + Send + 'static, level: u8) -> Self {
        Self {
            start: Instant::now(),
            out: Mutex::new(Box::new(out)),
            level,
        }
    }

    /// A sink writing to stderr, the default used outside of tests.
    pub fn stderr(level: u8) -> Self {
        Self::new(std::io::stderr(), level)
    }

    pub fn enabled(&self, level: u8) -> bool {
        level <= self.level
    }

    fn addr_str(peer: Option<SocketAddr>) -> String {
        match peer {
            Some(SocketAddr::V4(v4)) => v4.ip().to_string(),
            Some(SocketAddr::V6(v6)) => v6.ip().to_string(),
            None => String::new(),
        }
    }

    /// Writes one diagnostic line unconditionally. `msg` should end with
    /// `\n`; multi-line messages (e.g. a full reply at level 3) are written
    /// as-is.
    pub fn line(&self, tag: &str, peer: Option<SocketAddr>, msg: &str) {
        let elapsed = self.start.elapsed().as_secs_f64();
        let addr = Self::addr_str(peer);
        let mut out = self.out.lock().expect("log sink poisoned");
        let _ = write!(out, "{tag}{addr:>15} {elapsed:9.3}: {msg}");
    }

    /// As [`LogSink::line`], but a no-op unless `level <= self.level`.
    pub fn at(&self, level: u8, tag: &str, peer: Option<SocketAddr>, msg: &str) {
        if self.enabled(level) {
            self.line(tag, peer, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn formats_tag_addr_and_message() {
        let cap = Capture::default();
        let sink = LogSink::new(cap.clone(), 3);
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        sink.line(">>", Some(peer), "3 genmove\n");

        let written = String::from_utf8(cap.0.lock().unwrap().clone()).unwrap();
        assert!(written.starts_with(">>"));
        assert!(written.contains("127.0.0.1"));
        assert!(written.trim_end().ends_with("3 genmove"));
    }

    #[test]
    fn respects_verbosity_level() {
        let cap = Capture::default();
        let sink = LogSink::new(cap.clone(), 1);
        sink.at(2, "= ", None, "new slave\n");
        assert!(cap.0.lock().unwrap().is_empty());

        sink.at(1, "? ", None, "resend all\n");
        assert!(!cap.0.lock().unwrap().is_empty());
    }
}
