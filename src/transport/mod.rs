//! Transport module - raw TCP sockets.
//!
//! Provides:
//! - dialing with a timeout and `TCP_NODELAY`
//! - listener binding for the server
//! - the [`Connector`] seam the client dials through

mod tcp;

pub use tcp::{bind, configure, default_connector, dial, Connector};
