use std::sync::Arc;
use std::time::Duration;

use tokio::{
    task::JoinHandle,
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    io::{AsyncReadExt, AsyncWriteExt},
    time::timeout,
};

use crate::lifecycle::ServerRuntime;

/// Reads that stall longer than this end the session. Live Minecraft
/// connections exchange keepalives every second, so only a dead peer can
/// trip it.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Forwards data from `reader` to `writer` until EOF, error, or idle
/// timeout, then shuts down the writer (sends TCP FIN to the remote end).
///
/// Each direction of a proxied connection gets its own spawned task
/// so the tokio scheduler can interleave them with the accept loop
/// and other connections freely.
///
/// Every successfully forwarded chunk refreshes the runtime's activity
/// timestamp, which is what keeps the idle reaper away from a backend with
/// live traffic.
pub fn forward_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    buffer_size: usize,
    runtime: Arc<ServerRuntime>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0; buffer_size];
        loop {
            match timeout(READ_IDLE_TIMEOUT, reader.read(&mut buf)).await {
                Err(_) | Ok(Ok(0)) | Ok(Err(_)) => break,
                Ok(Ok(n)) => {
                    if writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    runtime.touch();
                }
            }
        }
        // Shut down the write half so the remote end receives FIN.
        // The other forwarding task (opposite direction) will then
        // naturally read EOF and terminate on its own — no signaling needed.
        _ = writer.shutdown().await;
    })
}
