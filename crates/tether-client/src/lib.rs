//! tether-client: the client side of a persistent terminal session.
//!
//! - [`machine`] — the connect/reconnect lifecycle as one enum with a
//!   single transition function; illegal flag combinations are
//!   unrepresentable.
//! - [`controller`] — one async driver per visible terminal view, executing
//!   the machine's side effects against a pluggable transport.
//! - [`transport`] — the transport traits plus the WebSocket implementation.
//! - [`tabs`] — maps visible tabs to sessions, enforces the tab cap, and
//!   runs the takeover flow.

pub mod controller;
pub mod machine;
pub mod tabs;
pub mod transport;

pub use controller::{Command, Controller, ControllerEvent};
pub use machine::{Action, ConnState, Event, Machine};
pub use tabs::{BackendControl, OpenOutcome, SessionStore, Tab, TabMultiplexer};
pub use transport::{CloseReason, ConnEvent, Connection, Connector, WsConnector};
