//! tether-proto: wire types shared by the gateway and its clients.
//!
//! A live connection carries structured control envelopes as tagged JSON
//! text frames; everything that does not decode into a known tag is a
//! protocol error at the boundary, never silently trusted.
//!
//! - [`ClientFrame`] / [`ServerFrame`] — the control envelopes.
//! - [`Session`] — the durable session record as it crosses the API.

pub mod frame;
pub mod session;

pub use frame::{ClientFrame, ServerFrame};
pub use session::{Session, SessionStatus};
