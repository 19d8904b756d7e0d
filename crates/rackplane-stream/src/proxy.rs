//! One-shot TCP splice.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{StreamError, StreamResult};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Splice `client` onto `host:port` until both directions reach EOF.
///
/// Returns bytes sent upstream and bytes sent back to the client.
pub async fn proxy<S>(mut client: S, host: &str, port: u16) -> StreamResult<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let address = format!("{host}:{port}");

    let mut upstream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
        .await
        .map_err(|_| StreamError::ConnectTimeout(address.clone()))?
        .map_err(|e| StreamError::Connect {
            address: address.clone(),
            reason: e.to_string(),
        })?;

    debug!(%address, "proxy connected");
    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(%address, sent, received, "proxy closed");
    Ok((sent, received))
}
