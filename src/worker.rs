//! One long-lived thread per accepted slave connection: identity handshake,
//! then the send/receive/resync loop against [`CommandLog`].

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::log::LogSink;
use crate::reply::{self, Reply};
use crate::state::{CommandLog, ReplyOutcome};

/// The literal identity banner a slave must send in response to `name\n`.
/// Part of the wire contract (see spec §6); changing it would break
/// compatibility with existing slaves.
const IDENTITY_PREFIX: &str = "= Pachi";

#[derive(Debug)]
enum HandshakeError {
    Io(std::io::Error),
    BadBanner,
}

impl From<std::io::Error> for HandshakeError {
    fn from(value: std::io::Error) -> Self {
        HandshakeError::Io(value)
    }
}

/// Sends the literal `name\n` and requires the two-line identity banner
/// back: a line beginning (case-insensitively) with `"= Pachi"`, then an
/// empty terminator line. Any deviation is treated as a bad slave; the
/// connection is not entered into the inner loop.
fn handshake(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>) -> Result<(), HandshakeError> {
    stream.write_all(b"name\n")?;
    stream.flush()?;

    let mut first = String::new();
    reader.read_line(&mut first)?;
    let matches_banner = first
        .as_bytes()
        .get(..IDENTITY_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(IDENTITY_PREFIX.as_bytes()));
    if !matches_banner {
        return Err(HandshakeError::BadBanner);
    }

    let mut second = String::new();
    reader.read_line(&mut second)?;
    if second != "\n" {
        return Err(HandshakeError::BadBanner);
    }

    Ok(())
}

/// Runs one slave-accepting worker forever: accept, handshake, then loop
/// sending commands and reading replies until the connection drops, at
/// which point it goes back to accept. `resend` starts `true` and is
/// carried across reconnects by the caller (see [`spawn_pool`]): every
/// connection, first or reconnect, starts out trying to catch up on
/// whatever history already exists, falling back to waiting for the first
/// command only when there's nothing yet to catch up to (see
/// [`CommandLog::has_any_command`](crate::state::ProtocolGuard::has_any_command)
/// in [`inner_loop`]).
pub fn run(listener: &TcpListener, log_state: &Arc<CommandLog>, log: &Arc<LogSink>, mut resend: bool) -> ! {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(v) => v,
            Err(e) => {
                log.at(1, "? ", None, &format!("accept failed: {e}\n"));
                continue;
            }
        };
        log.at(2, "= ", Some(peer), "new slave\n");

        let read_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                log.at(1, "? ", Some(peer), &format!("failed to clone socket: {e}\n"));
                continue;
            }
        };
        let mut write_half = stream;
        let mut reader = BufReader::new(read_half);

        if let Err(e) = handshake(&mut write_half, &mut reader) {
            match e {
                HandshakeError::BadBanner => log.at(0, "? ", Some(peer), "bad slave\n"),
                HandshakeError::Io(err) => log.at(0, "? ", Some(peer), &format!("handshake failed: {err}\n")),
            }
            continue;
        }

        let mut guard = log_state.protocol_lock();
        guard.register_slave();

        inner_loop(&mut guard, &mut write_half, &mut reader, peer, log, &mut resend);

        guard.deregister_slave();
        drop(guard);

        log.at(2, "= ", Some(peer), "lost slave\n");
        resend = true;
    }
}

/// Spawns `max_slaves` threads, each independently accepting connections
/// from a clone of `listener` and running [`run`]. Mirrors the original's
/// one-socket-many-acceptor-threads pattern: the kernel arbitrates
/// concurrent `accept()` calls on clones of the same listening socket.
pub fn spawn_pool(
    listener: TcpListener,
    log_state: Arc<CommandLog>,
    log: Arc<LogSink>,
    max_slaves: usize,
) -> Vec<std::thread::JoinHandle<()>> {
    (0..max_slaves)
        .map(|_| {
            let listener = listener.try_clone().expect("failed to clone slave listener");
            let log_state = Arc::clone(&log_state);
            let log = Arc::clone(&log);
            std::thread::spawn(move || run(&listener, &log_state, &log, true))
        })
        .collect()
}

/// With the lock held, repeatedly chooses what to send (the current
/// command, or a catch-up tail if `resend`), releases the lock to perform
/// blocking I/O, then reacquires it to process the reply. Returns (without
/// the lock released) once the connection fails.
fn inner_loop(
    guard: &mut crate::state::ProtocolGuard<'_>,
    stream: &mut TcpStream,
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    log: &LogSink,
    resend: &mut bool,
) {
    // Seeded from the live counter, not a sentinel: a connection that
    // arrives before any command has ever been published must block in
    // `wait_for_command` rather than race ahead on a value that could
    // never equal the real counter.
    let mut last_cmd_sent = guard.command_counter();
    let mut last_reply_id: i64 = -1;
    let mut reply_slot: Option<usize> = None;

    loop {
        let send_offset = if *resend && guard.has_any_command() {
            guard.next_command_offset(last_reply_id)
        } else {
            guard.wait_for_command(last_cmd_sent);
            guard.current_command_start()
        };

        let to_send = guard.tail_from(send_offset).to_vec();
        let is_current = send_offset == guard.current_command_start();
        *resend = !is_current;
        last_cmd_sent = guard.command_counter();

        let io_result: std::io::Result<Reply> = guard.unlocked(|| {
            if log.enabled(1) && !is_current {
                let msg = if send_offset == 0 { "resend all\n" } else { "partial resend\n" };
                log.at(1, "? ", Some(peer), msg);
            }
            stream.write_all(&to_send)?;
            stream.flush()?;
            if log.enabled(2) {
                log_sent(log, peer, &to_send);
            }
            let reply = reply::parse_reply(reader).map_err(|e| match e {
                reply::Error::Io(e) => e,
                reply::Error::Eof => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "reply missing terminator"),
            })?;
            if log.enabled(3) {
                log.line("<<", Some(peer), &String::from_utf8_lossy(&reply.raw));
            } else if log.enabled(2) {
                log.line("<<", Some(peer), &String::from_utf8_lossy(reply.first_line()));
            }
            Ok(reply)
        });

        let reply = match io_result {
            Ok(r) => r,
            Err(_) => return,
        };

        let success = reply.is_success();
        match guard.process_reply(reply.id, &reply.raw, success, &mut last_reply_id, &mut reply_slot) {
            ReplyOutcome::Resend => {
                *resend = true;
            }
            ReplyOutcome::Published => {
                *resend = false;
                guard.signal_reply();
                // Defends against a command arriving between the send and
                // the reply being processed: force the next iteration to
                // wait for a genuinely new command.
                last_cmd_sent = guard.command_counter();
            }
        }
    }
}

fn log_sent(log: &LogSink, peer: SocketAddr, bytes: &[u8]) {
    let text = String::from_utf8_lossy(bytes);
    log.line(">>", Some(peer), &text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MarkerWords;
    use std::net::TcpListener as StdListener;
    use std::thread;

    fn spawn_echo_slave(addr: SocketAddr, banner_ok: bool) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            // consume "name\n"
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();

            if banner_ok {
                stream.write_all(b"= Pachi 1.0\n\n").unwrap();
            } else {
                stream.write_all(b"nope\n\n").unwrap();
                return;
            }

            // Read one command line, reply with a matching id.
            let mut cmd_line = String::new();
            reader.read_line(&mut cmd_line).unwrap();
            let id = cmd_line.split_whitespace().next().unwrap();
            let reply = format!("={id}\n\n");
            stream.write_all(reply.as_bytes()).unwrap();
        })
    }

    #[test]
    fn bad_banner_is_rejected_without_registering_a_slave() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let log_state = Arc::new(CommandLog::default());
        let log = Arc::new(LogSink::new(std::io::sink(), 0));

        let log_state2 = Arc::clone(&log_state);
        let log2 = Arc::clone(&log);
        let worker = thread::spawn(move || {
            let (stream, peer) = listener.accept().unwrap();
            let mut stream = stream;
            let read_half = stream.try_clone().unwrap();
            let mut reader = BufReader::new(read_half);
            let result = handshake(&mut stream, &mut reader);
            assert!(result.is_err());
            assert_eq!(log_state2.protocol_lock().active_slaves(), 0);
            let _ = (log2, peer);
        });

        spawn_echo_slave(addr, false).join().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn a_command_is_sent_and_the_reply_is_collected() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let log_state = Arc::new(CommandLog::new(MarkerWords::default(), crate::id::Xorshift32::new()));
        let log = Arc::new(LogSink::new(std::io::sink(), 3));

        {
            let mut guard = log_state.protocol_lock();
            guard.new_cmd("boardsize", "19", 0);
        }

        let handles = spawn_pool(listener, Arc::clone(&log_state), Arc::clone(&log), 1);
        let slave = spawn_echo_slave(addr, true);
        slave.join().unwrap();

        // Give the worker thread a moment to process the reply.
        thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(log_state.protocol_lock().reply_count(), 1);
        drop(handles);
    }
}
