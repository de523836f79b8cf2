//! `CommandLog`: the process-wide shared state, and the Driver API used to
//! publish commands and harvest replies.
//!
//! The buffer, cursor, command counter, history ring, and reply buffer are
//! all protected by one exclusive lock (see [`CommandLog::protocol_lock`]);
//! per the design notes, that lock is never split, since every invariant
//! here couples every field to every other one.

mod history;

use std::net::SocketAddr;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::id::{self, EntropySource, MarkerWords, CMDS_SIZE, DIST_GAMELEN, MAX_CMDS_PER_MOVE, MAX_GAMELEN};
use crate::log::LogSink;
use history::History;

/// Outcome of feeding one parsed reply through [`ProtocolGuard::process_reply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The reply matched the current command id; it was published into the
    /// reply buffer and the caller should signal the reply condition.
    Published,
    /// The reply was either an error or didn't match the current id; the
    /// caller must resend history starting from the slave's last
    /// acknowledged id.
    Resend,
}

struct Inner {
    buf: Vec<u8>,
    /// Offset of the start of the current command within `buf`.
    cur_start: usize,
    /// Offset one past the last byte written so far; also where the next
    /// freshly-appended command will begin.
    end: usize,
    command_counter: u64,
    current_id: i64,
    round_started: bool,
    history: History,
    active_slaves: usize,
    reply_count: usize,
    replies: Vec<Vec<u8>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            buf: vec![0u8; CMDS_SIZE],
            cur_start: 0,
            end: 0,
            command_counter: 0,
            current_id: -1,
            round_started: false,
            history: History::new(MAX_GAMELEN),
            active_slaves: 0,
            reply_count: 0,
            replies: Vec::new(),
        }
    }

    fn current_command(&self) -> &[u8] {
        &self.buf[self.cur_start..self.end]
    }

    fn tail_from(&self, offset: usize) -> &[u8] {
        &self.buf[offset..self.end]
    }

    /// Rewrites the id token of the current command in place to
    /// `id::prevent_reply(current_id)`, zero-padded to the same decimal
    /// width so the byte length of the (already appended) command line
    /// doesn't change.
    fn demote_current_in_place(&mut self) {
        if self.cur_start == self.end {
            return;
        }
        let line = &self.buf[self.cur_start..self.end];
        let width = line.iter().position(|&b| b == b' ').unwrap_or(line.len());
        let demoted = id::prevent_reply(self.current_id);
        let text = format!("{demoted:0width$}");
        let text = text.into_bytes();
        let n = text.len().min(width);
        self.buf[self.cur_start..self.cur_start + n].copy_from_slice(&text[..n]);
    }

    fn write_command_line(&mut self, word: &str, args: &str) {
        let line = if args.is_empty() {
            format!("{} {}\n", self.current_id, word)
        } else {
            format!("{} {} {}\n", self.current_id, word, args)
        };
        let bytes = line.as_bytes();
        assert!(
            self.cur_start + bytes.len() <= self.buf.len(),
            "command buffer exhausted: a round issued more than CMDS_SIZE bytes of commands"
        );
        self.buf[self.cur_start..self.cur_start + bytes.len()].copy_from_slice(bytes);
        self.end = self.cur_start + bytes.len();
    }

    fn update_cmd(&mut self, word: &str, args: &str, new_id: bool, moves: i64, entropy: &dyn EntropySource) {
        if new_id {
            self.current_id = id::force_reply(moves, entropy.next_u32());
            self.reply_count = 0;
            self.replies.clear();
        }
        self.write_command_line(word, args);
        self.command_counter += 1;
        if new_id {
            let mv = (moves.rem_euclid(MAX_GAMELEN as i64)) as usize;
            self.history.push(mv, self.current_id, self.cur_start);
        }
    }

    fn new_cmd(&mut self, word: &str, args: &str, moves: i64, markers: &MarkerWords, entropy: &dyn EntropySource) {
        if !self.round_started || markers.is_gamestart(word) {
            self.cur_start = 0;
            self.end = 0;
            self.history.clear();
            self.round_started = true;
        } else {
            self.demote_current_in_place();
            self.cur_start = self.end;
        }
        self.update_cmd(word, args, true, moves, entropy);
    }

    /// Returns the byte offset a slave reporting `reply_id` should resume
    /// sending from, to catch up. `-1` (never replied) and a move number
    /// ahead of the current command both mean "resend everything"; a miss
    /// in the history table (overwritten by the ring, or a stale id from a
    /// previous round) degrades the same way.
    fn next_command_offset(&self, reply_id: i64) -> usize {
        if reply_id == -1 {
            return 0;
        }
        let mv = id::move_number(reply_id);
        let last_mv = id::move_number(self.current_id);
        if mv > last_mv {
            return 0;
        }
        match self.history.find(mv as usize, reply_id) {
            Some(slot) => slot.next_cmd.unwrap_or(0),
            None => 0,
        }
    }

    fn process_reply(
        &mut self,
        reply_id: i64,
        raw: &[u8],
        success: bool,
        last_reply_id: &mut i64,
        reply_slot: &mut Option<usize>,
    ) -> ReplyOutcome {
        if !success {
            *last_reply_id = -1;
            return ReplyOutcome::Resend;
        }
        let outcome = if reply_id == self.current_id {
            let slot = if Some(reply_id) == Some(*last_reply_id) && reply_slot.is_some() {
                reply_slot.unwrap()
            } else {
                let s = self.reply_count;
                self.reply_count += 1;
                s
            };
            if self.replies.len() <= slot {
                self.replies.resize(slot + 1, Vec::new());
            }
            self.replies[slot] = raw.to_vec();
            *reply_slot = Some(slot);
            ReplyOutcome::Published
        } else {
            ReplyOutcome::Resend
        };
        *last_reply_id = reply_id;
        outcome
    }
}

/// The shared command/reply state: buffer, cursor, counter, history ring,
/// reply buffer, and active-slave count, all behind one exclusive lock, plus
/// the two condition variables that share it.
pub struct CommandLog {
    inner: Mutex<Inner>,
    cmd_available: Condvar,
    reply_available: Condvar,
    markers: MarkerWords,
    entropy: Box<dyn EntropySource>,
}

impl CommandLog {
    pub fn new(markers: MarkerWords, entropy: impl EntropySource + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            cmd_available: Condvar::new(),
            reply_available: Condvar::new(),
            markers,
            entropy: Box::new(entropy),
        }
    }

    /// Exclusive acquisition of the shared lock. All other driver and
    /// worker operations require the returned guard; dropping it (or
    /// calling [`ProtocolGuard::unlock`]) is `protocol_unlock`.
    pub fn protocol_lock(&self) -> ProtocolGuard<'_> {
        ProtocolGuard {
            log: self,
            guard: Some(self.inner.lock().expect("command log poisoned")),
        }
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new(MarkerWords::default(), id::Xorshift32::new())
    }
}

/// A held exclusive lock on the [`CommandLog`], exposing the Driver API
/// (`new_cmd`, `update_cmd`, `get_replies`) and the operations the
/// [`crate::worker::SlaveWorker`] loop needs while holding the lock.
pub struct ProtocolGuard<'a> {
    log: &'a CommandLog,
    guard: Option<MutexGuard<'a, Inner>>,
}

impl<'a> ProtocolGuard<'a> {
    fn inner(&self) -> &Inner {
        self.guard.as_ref().expect("guard taken")
    }

    fn inner_mut(&mut self) -> &mut Inner {
        self.guard.as_mut().expect("guard taken")
    }

    /// `protocol_unlock()`. Equivalent to dropping the guard; spelled out
    /// for readers looking for the spec's named operation.
    pub fn unlock(self) {}

    /// Publishes a fresh command, minting a new id. If no round is in
    /// progress, or `word` is the round-start marker, the buffer and
    /// history are reset first. Otherwise the previous current command is
    /// demoted in place (its id rewritten to suppress further replies)
    /// before the new one is appended. `moves` is the move number the new
    /// command belongs to, supplied by the caller (this layer doesn't
    /// track game state itself).
    pub fn new_cmd(&mut self, word: &str, args: &str, moves: i64) {
        let markers = self.log.markers.clone();
        let entropy: &dyn EntropySource = self.log.entropy.as_ref();
        self.inner_mut().new_cmd(word, args, moves, &markers, entropy);
        self.log.cmd_available.notify_all();
    }

    /// Publishes a command at the current cursor. If `new_id`, mints a
    /// fresh id and resets the reply count (a new round of replies is now
    /// expected); otherwise the id stays the same and slaves already past
    /// the previous version merely notice `command_counter` has moved and
    /// resend, picking up the new payload without a new reply round.
    pub fn update_cmd(&mut self, word: &str, args: &str, new_id: bool, moves: i64) {
        let entropy: &dyn EntropySource = self.log.entropy.as_ref();
        self.inner_mut().update_cmd(word, args, new_id, moves, entropy);
        self.log.cmd_available.notify_all();
    }

    /// Blocks until either every active slave has replied to the current
    /// command, or `deadline` passes — but the wait only becomes
    /// deadline-bounded once at least one reply has arrived. A deadline
    /// that passes with zero replies does not return; this is deliberate
    /// (see crate docs / DESIGN.md): it tolerates slow global start-up
    /// without letting one slow slave's absence penalize a fast anchor
    /// reply that hasn't arrived yet either.
    pub fn get_replies(&mut self, deadline: Instant, log: &LogSink, peer_context: Option<SocketAddr>) -> usize {
        loop {
            let guard = self.guard.take().expect("guard taken");
            let reply_count = guard.reply_count;
            let (new_guard, timed_out) = if reply_count > 0 {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let remaining = remaining.max(Duration::from_millis(1));
                let (g, wr) = self
                    .log
                    .reply_available
                    .wait_timeout(guard, remaining)
                    .expect("command log poisoned");
                (g, wr.timed_out())
            } else {
                (
                    self.log.reply_available.wait(guard).expect("command log poisoned"),
                    false,
                )
            };
            self.guard = Some(new_guard);

            let inner = self.inner();
            if inner.reply_count == 0 {
                continue;
            }
            if inner.reply_count >= inner.active_slaves {
                return inner.reply_count;
            }
            if timed_out || Instant::now() >= deadline {
                let reply_count = inner.reply_count;
                let active_slaves = inner.active_slaves;
                // LogSink's lock must never be acquired while this one is
                // held (see crate docs / DESIGN.md): release before logging,
                // then reacquire so the guard invariant holds for the caller.
                let guard = self.guard.take().expect("guard taken");
                drop(guard);
                let msg = format!("get_replies timeout, replies {reply_count} < active {active_slaves}\n");
                log.at(1, "? ", peer_context, &msg);
                self.guard = Some(self.log.inner.lock().expect("command log poisoned"));
                return reply_count;
            }
        }
    }

    /// The replies collected for the current command,
    /// `replies[0..reply_count]`.
    pub fn replies(&self) -> &[Vec<u8>] {
        &self.inner().replies[..self.inner().reply_count.min(self.inner().replies.len())]
    }

    pub fn command_counter(&self) -> u64 {
        self.inner().command_counter
    }

    pub fn active_slaves(&self) -> usize {
        self.inner().active_slaves
    }

    pub fn reply_count(&self) -> usize {
        self.inner().reply_count
    }

    pub(crate) fn current_command_start(&self) -> usize {
        self.inner().cur_start
    }

    /// True once at least one command has ever been published this round.
    /// Used to tell a fresh connection's initial catch-up attempt apart
    /// from the case where no command exists yet to catch up to (in which
    /// case the worker must wait for the first command instead of sending
    /// an empty burst).
    pub(crate) fn has_any_command(&self) -> bool {
        self.inner().end > 0
    }

    pub(crate) fn current_command(&self) -> &[u8] {
        self.inner().current_command()
    }

    pub(crate) fn tail_from(&self, offset: usize) -> &[u8] {
        self.inner().tail_from(offset)
    }

    pub(crate) fn next_command_offset(&self, reply_id: i64) -> usize {
        self.inner().next_command_offset(reply_id)
    }

    pub(crate) fn process_reply(
        &mut self,
        reply_id: i64,
        raw: &[u8],
        success: bool,
        last_reply_id: &mut i64,
        reply_slot: &mut Option<usize>,
    ) -> ReplyOutcome {
        self.inner_mut().process_reply(reply_id, raw, success, last_reply_id, reply_slot)
    }

    /// Registers one more active slave (a worker past handshake, about to
    /// enter its send/receive loop).
    pub(crate) fn register_slave(&mut self) {
        self.inner_mut().active_slaves += 1;
    }

    /// Deregisters a slave whose connection dropped, and wakes any
    /// `get_replies` call that might have been waiting on this slave's
    /// reply, so it can reassess the (now smaller) active count.
    pub(crate) fn deregister_slave(&mut self) {
        let inner = self.inner_mut();
        assert!(inner.active_slaves > 0);
        inner.active_slaves -= 1;
        self.log.reply_available.notify_all();
    }

    pub(crate) fn signal_reply(&self) {
        self.log.reply_available.notify_all();
    }

    /// Blocks on the command-available condition until `command_counter`
    /// differs from `last_seen`. Releases the lock while waiting, as
    /// `Condvar::wait` always does; spurious wakeups are tolerated by the
    /// caller's predicate loop.
    pub(crate) fn wait_for_command(&mut self, last_seen: u64) {
        let mut guard = self.guard.take().expect("guard taken");
        while guard.command_counter == last_seen {
            guard = self.log.cmd_available.wait(guard).expect("command log poisoned");
        }
        self.guard = Some(guard);
    }

    /// Releases the lock for the duration of `f` (used to perform blocking
    /// socket I/O outside the critical section), then reacquires it.
    /// Holding the lock across I/O would serialize every slave on the
    /// slowest one's network round trip.
    pub(crate) fn unlocked<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let g = self.guard.take().expect("guard taken");
        drop(g);
        let r = f();
        self.guard = Some(self.log.inner.lock().expect("command log poisoned"));
        r
    }
}
