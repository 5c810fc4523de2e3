//! tether-pty: one OS pseudo-terminal-backed shell process per session.
//!
//! A [`ProcessHost`] owns the spawned process end to end: it writes input,
//! resizes the PTY, kills the process, and fans its output out over a
//! broadcast channel. Reads are blocking, so each host runs a dedicated
//! I/O thread; everything downstream consumes the async channels.
//!
//! The environment handed to the spawned shell is restricted to a fixed
//! allow-list so host secrets never leak into a user-controlled process.

pub mod host;

pub use host::{ProcessHost, PtyError};
