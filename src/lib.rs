//! Master-side coordination core for a distributed compute engine.
//!
//! One master dispatches a stream of line-oriented text commands to a pool
//! of remote slave workers over TCP, collects their replies, and keeps every
//! slave's state tracking the master's command history across transient
//! disconnections, restarts, late joiners, and slow responders.
//!
//! This crate is deliberately agnostic to the textual command grammar itself
//! (treated as opaque `"<word> <args>"` pairs), to the application logic
//! deciding which commands to issue, and to slave authentication beyond a
//! name banner. See [`state`] for the shared command/reply state, [`worker`]
//! for the per-slave send/receive/resync loop, and [`id`] for the identifier
//! scheme that lets slaves self-diagnose drift.

pub mod id;
pub mod log;
pub mod proxy;
pub mod reply;
pub mod state;
pub mod transport;
pub mod worker;

pub use id::{DIST_GAMELEN, MAX_CMDS_PER_MOVE, MAX_GAMELEN};
pub use log::LogSink;
pub use state::CommandLog;
