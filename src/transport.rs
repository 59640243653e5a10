//! Byte-stream transport. A reader task pushes raw socket chunks into a
//! bounded queue; a writer task drains encoded frames into the socket.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const READ_SIZE: usize = 64 * 1024;

/// One side of an established connection.
pub struct Connection {
    pub peer: String,
    /// Raw chunks as they arrive; closed on EOF or read error.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Complete frames to send; dropping every sender closes the write side.
    pub outbound: mpsc::Sender<Bytes>,
}

pub async fn connect(addr: impl ToSocketAddrs, capacity: usize) -> io::Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    spawn(stream, capacity)
}

pub async fn listen(addr: impl ToSocketAddrs) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

pub fn spawn(stream: TcpStream, capacity: usize) -> io::Result<Connection> {
    let peer = stream.peer_addr()?.to_string();
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(capacity);

    let label = peer.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!(peer = %label, "peer closed the stream");
                    break;
                }
                Ok(n) => {
                    if inbound_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = %label, "read failed: {e}");
                    break;
                }
            }
        }
    });

    let label = peer.clone();
    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                warn!(peer = %label, "write failed: {e}");
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    Ok(Connection {
        peer,
        inbound: inbound_rx,
        outbound: outbound_tx,
    })
}

/// Two connections wired back to back in memory. Frames arrive whole.
pub fn pair(capacity: usize) -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    (
        Connection {
            peer: "memory:b".to_string(),
            inbound: b_rx,
            outbound: a_tx,
        },
        Connection {
            peer: "memory:a".to_string(),
            inbound: a_rx,
            outbound: b_tx,
        },
    )
}
