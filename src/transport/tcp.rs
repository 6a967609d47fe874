//! TCP dial and listen.
//!
//! # Example
//!
//! ```ignore
//! use rawrpc::transport::{bind, dial};
//! use std::time::Duration;
//!
//! let listener = bind("127.0.0.1:0").await?;
//! let stream = dial(&listener.local_addr()?.to_string(), Duration::from_secs(2)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::error::{Result, RpcError};
use crate::BoxFuture;

/// Async dial function used by the client to open sockets.
///
/// The default is [`dial`]; tests and callers that need custom socket setup
/// supply their own.
pub type Connector = Arc<dyn Fn(String) -> BoxFuture<'static, Result<TcpStream>> + Send + Sync>;

/// Connect to `addr` within `timeout` and configure the socket.
///
/// # Errors
///
/// [`RpcError::DialTimeout`] if the connect does not finish in time,
/// [`RpcError::Io`] if it fails.
pub async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            debug!(addr, ?timeout, "Dial timed out");
            RpcError::DialTimeout {
                addr: addr.to_string(),
                timeout,
            }
        })??;

    configure(&stream)?;
    debug!(addr, "Dialed");
    Ok(stream)
}

/// The default [`Connector`]: [`dial`] with the given timeout.
pub fn default_connector(timeout: Duration) -> Connector {
    Arc::new(move |addr: String| -> BoxFuture<'static, Result<TcpStream>> {
        Box::pin(async move { dial(&addr, timeout).await })
    })
}

/// Bind a listener on `addr`.
pub async fn bind(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

/// Socket options applied to every stream, dialed or accepted.
pub fn configure(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    Ok(())
}
