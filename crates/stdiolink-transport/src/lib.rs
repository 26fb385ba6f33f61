//! Subprocess-backed stream transport for reaching a daemon over
//! helper stdio
//!
//! Lets a client reach a daemon that only speaks a byte-stream
//! protocol over the stdin/stdout of a remote helper process (an
//! ssh-spawned remote command) rather than a dialable socket.
//!
//! # Architecture
//!
//! - **Half-close capability**: duplex streams whose read and write
//!   sides close independently ([`traits`])
//! - **Subprocess transport**: a helper process's stdio as such a
//!   stream, with the process lifetime tied to both directions
//!   ([`subprocess`])
//! - **Connection helpers**: URL scheme dispatch producing a dialer
//!   ([`connhelper`])
//! - **Bridge**: the bidirectional copy engine and its termination
//!   policy ([`bridge`])

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod connhelper;
pub mod error;
pub mod subprocess;
pub mod traits;

// Re-export commonly used types
pub use bridge::{TerminationPolicy, bridge, dial_half_close, proxy_stdio};
pub use connhelper::{ConnectionHelper, get_connection_helper};
pub use error::{Result, TransportError};
pub use subprocess::CommandConn;
pub use traits::{
    CancelFlag, Connection, Dialer, HalfCloseRead, HalfCloseStream, HalfCloseWrite, PipeStream,
};
