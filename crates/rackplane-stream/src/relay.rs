//! Exec/attach relay.
//!
//! ```text
//!   client ──read──▶ input   (container stdin)
//!   client ◀─write── output  (container stdout+stderr)
//!   client ◀─write── trailer (after output EOF and exit)
//! ```

use std::fmt::Display;
use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{StreamError, StreamResult};
use crate::trailer::trailer;

/// Relay `client` to a running session until the session exits.
///
/// Client bytes are copied into `input`; client EOF shuts `input` down.
/// Session output is copied back until it ends. Once both the output has
/// drained and `exit` resolved, one trailer line carrying the exit code is
/// written and the code is returned. A client that hangs up does not end
/// the session early.
pub async fn relay<C, I, O, F, E>(client: C, mut input: I, mut output: O, exit: F) -> StreamResult<i32>
where
    C: AsyncRead + AsyncWrite + Unpin,
    I: AsyncWrite + Unpin,
    O: AsyncRead + Unpin,
    F: Future<Output = Result<i32, E>>,
    E: Display,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);

    let (copied, status) = {
        let pump_in = async {
            let sent = tokio::io::copy(&mut client_rd, &mut input).await;
            let _ = input.shutdown().await;
            sent
        };
        let finish = async {
            let copied = tokio::io::copy(&mut output, &mut client_wr).await;
            let status = exit.await;
            (copied, status)
        };
        tokio::pin!(pump_in, finish);

        let mut input_open = true;
        loop {
            tokio::select! {
                sent = &mut pump_in, if input_open => {
                    input_open = false;
                    match sent {
                        Ok(bytes) => debug!(bytes, "client input closed"),
                        Err(e) => debug!(error = %e, "client input failed"),
                    }
                }
                done = &mut finish => break done,
            }
        }
    };

    let copied = copied?;
    let code = status.map_err(|e| StreamError::NoExit(e.to_string()))?;
    debug!(bytes = copied, code, "session finished");

    client_wr.write_all(trailer(code).as_bytes()).await?;
    client_wr.flush().await?;
    Ok(code)
}
