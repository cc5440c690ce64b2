//! JSON-lines TCP transport.
//!
//! Each connection carries newline-delimited request frames. Every frame is
//! answered on its own task, so a long WAIT never blocks later requests on the
//! same connection; replies carry the request `id` and may arrive out of order.
//! At most [`MAX_IN_FLIGHT`] frames per connection are in progress; past that the
//! connection stops being read until one completes.

use std::net::SocketAddr;
use std::sync::Arc;

use limitd::{JsonLines, KvStore, LimitdService};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

/// Replies buffered per connection before request tasks back off.
const REPLY_QUEUE: usize = 256;
/// Frames one connection may have in progress at once.
pub const MAX_IN_FLIGHT: usize = 64;

/// Accept connections on `listener` until `shutdown` resolves.
pub async fn serve<S, F>(
    listener: TcpListener,
    service: LimitdService<S>,
    shutdown: F,
) -> std::io::Result<()>
where
    S: KvStore,
    F: std::future::Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(target: "limitd::server", "shutting down listener");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection(stream, peer, service).await {
                        warn!(target: "limitd::server", %peer, error = %err, "connection error");
                    }
                });
            }
        }
    }
}

async fn connection<S: KvStore>(
    stream: TcpStream,
    peer: SocketAddr,
    service: LimitdService<S>,
) -> std::io::Result<()> {
    debug!(target: "limitd::server", %peer, "connection opened");
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(REPLY_QUEUE);

    let writer = tokio::spawn(async move {
        while let Some(mut reply) = rx.recv().await {
            reply.push(b'\n');
            write.write_all(&reply).await?;
        }
        write.shutdown().await
    });

    let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
    let mut reader = BufReader::new(read);
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let Ok(permit) = in_flight.clone().acquire_owned().await else {
            break;
        };
        let frame = std::mem::take(&mut line);
        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = service.handle_frame(&JsonLines, &frame).await;
            // The writer only goes away with the connection.
            let _ = tx.send(reply).await;
            drop(permit);
        });
    }
    drop(tx);

    debug!(target: "limitd::server", %peer, "connection closed by peer");
    match writer.await {
        Ok(result) => result,
        Err(err) => Err(std::io::Error::new(std::io::ErrorKind::Other, err)),
    }
}
