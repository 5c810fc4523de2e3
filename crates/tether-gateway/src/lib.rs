//! tether-gateway: binds inbound connections to PTY-backed processes.
//!
//! The gateway owns two tables behind one lock: the live process hosts and
//! the bindings from backend id to the single connection currently holding
//! it. Binds fail fast on conflict; the only path that displaces a live
//! binder is an explicit force-unbind (takeover). Bind and unbind events
//! are reported to the session registry so durable status tracks reality.

pub mod gateway;

pub use gateway::{AttachError, Attachment, DetachReason, Gateway, GatewayConfig};
