//! Subprocess-backed transport
//!
//! Runs an external helper program and exposes its stdin/stdout as a
//! half-closable duplex stream. The helper's lifetime is tied to the
//! stream: it is killed once both directions have closed, never
//! before, and never more than once.

pub mod conn;

pub use conn::CommandConn;
