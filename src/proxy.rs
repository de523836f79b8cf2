//! The logging-proxy listener: one thread per connection, each simply
//! copying whatever lines it reads straight into [`LogSink`]. Exists only
//! to give the proxy port somewhere to go; it holds no protocol state and
//! never touches [`crate::state::CommandLog`].

use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::log::LogSink;

/// Accepts connections on `listener` forever, spawning a detached thread
/// per connection that forwards its lines to `log` under the `"< "` tag
/// until EOF or a read error.
pub fn run(listener: &TcpListener, log: &Arc<LogSink>) -> ! {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(e) => {
                log.at(1, "? ", None, &format!("proxy accept failed: {e}\n"));
                continue;
            }
        };
        let log = Arc::clone(log);
        thread::spawn(move || forward(stream, peer, &log));
    }
}

fn forward(stream: TcpStream, peer: SocketAddr, log: &LogSink) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => return,
            Ok(_) => log.line("< ", Some(peer), &line),
        }
    }
}

/// Spawns `max_workers` threads each independently accepting connections
/// from a clone of `listener`, mirroring [`crate::worker::spawn_pool`]'s
/// one-listener-many-acceptors pattern.
pub fn spawn_pool(listener: TcpListener, log: Arc<LogSink>, max_workers: usize) -> Vec<thread::JoinHandle<()>> {
    (0..max_workers)
        .map(|_| {
            let listener = listener.try_clone().expect("failed to clone proxy listener");
            let log = Arc::clone(&log);
            thread::spawn(move || run(&listener, &log))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use std::time::Duration;

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
    fn forwarded_lines_reach_the_log_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let cap = Capture::default();
        let log = Arc::new(LogSink::new(cap.clone(), 3));

        let handles = spawn_pool(listener, Arc::clone(&log), 1);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"hello from a slave's stderr\n").unwrap();
        drop(client);

        thread::sleep(Duration::from_millis(100));
        let written = String::from_utf8(cap.0.lock().unwrap().clone()).unwrap();
        assert!(written.contains("hello from a slave's stderr"));
        drop(handles);
    }
}
