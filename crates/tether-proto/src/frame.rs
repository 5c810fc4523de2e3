use serde::{Deserialize, Serialize};

/// Control envelopes sent from a client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Keystrokes or pasted input, written verbatim to the process.
    Data { data: String },
    /// The client's terminal view changed size.
    Resize { cols: u16, rows: u16 },
}

/// Control envelopes sent from the gateway to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Process output bytes, forwarded as they arrive.
    Data { data: String },
    /// The backing process exited. The binding is torn down after this.
    Exit { code: i32 },
}

/// Close code sent to a binder displaced by an explicit takeover.
pub const CLOSE_TAKEOVER: u16 = 4001;

/// Close code sent when a backend id is already bound to another connection.
pub const CLOSE_BIND_CONFLICT: u16 = 4002;

/// Close code sent when no live process exists for the named backend id.
pub const CLOSE_BACKEND_NOT_FOUND: u16 = 4004;
