//! Multipart framing over TCP.
//!
//! Each multipart message is length-prefixed on the stream:
//!
//! ```text
//! ┌──────────────────┬───────────────────────────────────────────┐
//! │ 4 bytes BE u32   │ per frame: 4 bytes BE u32 length + bytes  │
//! │ (frame count)    │ repeated `count` times                    │
//! └──────────────────┴───────────────────────────────────────────┘
//! ```
//!
//! [`connect`] yields the DEALER-style end (one connection).  [`bind`]
//! yields the ROUTER-style end: it accepts any number of connections,
//! assigns each an opaque peer identity, prepends that identity to every
//! inbound multipart, and routes outbound multiparts by their leading peer
//! frame.  A multipart addressed to a peer that is gone is dropped, as a
//! routing socket would.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use super::Transport;
use crate::errors::{Error, Result};

/// Maximum size of a single frame (64 MiB), to bound allocations driven by
/// a buggy or hostile peer.
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Maximum frames per multipart.  RPC messages use at most five.
const MAX_FRAMES: u32 = 16;

// ---------------------------------------------------------------------------
// Stream framing
// ---------------------------------------------------------------------------

/// Read one multipart message.  `Ok(None)` signals clean EOF at a message
/// boundary.
async fn read_multipart<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<Bytes>>> {
    let mut count_buf = [0u8; 4];
    match reader.read_exact(&mut count_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let count = u32::from_be_bytes(count_buf);
    if count == 0 || count > MAX_FRAMES {
        return Err(Error::Frame(format!("invalid frame count: {count}")));
    }

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(Error::Frame(format!(
                "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).await?;
        frames.push(Bytes::from(buf));
    }
    Ok(Some(frames))
}

/// Write one multipart message and flush it.
async fn write_multipart<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Bytes]) -> Result<()> {
    writer
        .write_all(&(frames.len() as u32).to_be_bytes())
        .await?;
    for frame in frames {
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// DEALER end
// ---------------------------------------------------------------------------

/// The connecting end: one TCP stream, no peer frames.
pub struct TcpDealer {
    out_tx: Mutex<Option<mpsc::UnboundedSender<Vec<Bytes>>>>,
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    closed_tx: watch::Sender<bool>,
}

/// Connect a DEALER-style transport to `addr` (passed verbatim to the
/// socket layer).
pub async fn connect(addr: &str) -> Result<TcpDealer> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
    tokio::spawn(async move {
        while let Some(frames) = out_rx.recv().await {
            if let Err(e) = write_multipart(&mut write_half, &frames).await {
                warn!(error = %e, "transport write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    Ok(TcpDealer {
        out_tx: Mutex::new(Some(out_tx)),
        reader: tokio::sync::Mutex::new(read_half),
        closed_tx: watch::channel(false).0,
    })
}

#[async_trait]
impl Transport for TcpDealer {
    fn send(&self, frames: Vec<Bytes>) -> Result<()> {
        let guard = self.out_tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(frames).map_err(|_| Error::ConnectionClosed),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn recv(&self) -> Option<Vec<Bytes>> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = read_multipart(&mut *reader) => match result {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    None
                }
            },
            _ = closed.changed() => None,
        }
    }

    fn close(&self) {
        // Dropping the outbound queue ends the writer task, which shuts the
        // write half down and lets the peer observe EOF.
        self.out_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.closed_tx.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// ROUTER end
// ---------------------------------------------------------------------------

type PeerMap = Arc<Mutex<HashMap<Bytes, mpsc::UnboundedSender<Vec<Bytes>>>>>;

/// The listening end: many connections behind peer-identity frames.
pub struct TcpRouter {
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Bytes>>>,
    peers: PeerMap,
    closed_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// Bind a ROUTER-style transport on `addr` (passed verbatim to the socket
/// layer).  Bind to port 0 and read [`TcpRouter::local_addr`] to discover
/// the ephemeral port.
pub async fn bind(addr: &str) -> Result<TcpRouter> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    debug!(addr = %local_addr, "listening");

    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let peers: PeerMap = Arc::new(Mutex::new(HashMap::new()));
    let closed_tx = watch::channel(false).0;

    let mut closed = closed_tx.subscribe();
    let accept_peers = Arc::clone(&peers);
    tokio::spawn(async move {
        let mut next_peer: u32 = 0;
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = closed.changed() => break,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            next_peer = next_peer.wrapping_add(1);
            let peer = Bytes::copy_from_slice(&next_peer.to_be_bytes());
            debug!(peer = next_peer, remote = %remote, "connection accepted");
            spawn_connection(stream, peer, Arc::clone(&accept_peers), in_tx.clone());
        }
    });

    Ok(TcpRouter {
        inbound: tokio::sync::Mutex::new(in_rx),
        peers,
        closed_tx,
        local_addr,
    })
}

/// Wire one accepted connection into the router: a writer task fed from
/// the peer map, and a reader task that tags inbound multiparts with the
/// peer identity.
fn spawn_connection(
    stream: TcpStream,
    peer: Bytes,
    peers: PeerMap,
    in_tx: mpsc::UnboundedSender<Vec<Bytes>>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
    peers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(peer.clone(), out_tx);

    tokio::spawn(async move {
        while let Some(frames) = out_rx.recv().await {
            if let Err(e) = write_multipart(&mut write_half, &frames).await {
                warn!(error = %e, "transport write failed");
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            match read_multipart(&mut read_half).await {
                Ok(Some(mut frames)) => {
                    frames.insert(0, peer.clone());
                    if in_tx.send(frames).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    break;
                }
            }
        }
        peers.lock().unwrap_or_else(|e| e.into_inner()).remove(&peer);
    });
}

impl TcpRouter {
    /// The address actually bound, for ephemeral-port discovery.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Transport for TcpRouter {
    fn send(&self, mut frames: Vec<Bytes>) -> Result<()> {
        if *self.closed_tx.borrow() {
            return Err(Error::ConnectionClosed);
        }
        if frames.len() < 2 {
            return Err(Error::Frame(
                "router multipart requires a peer frame and a body".into(),
            ));
        }
        let peer = frames.remove(0);
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        match peers.get(&peer) {
            Some(tx) => {
                // A send error means the connection died under us; treat it
                // like an already-departed peer.
                let _ = tx.send(frames);
            }
            None => warn!("dropping multipart addressed to unknown peer"),
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<Bytes>> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            frames = inbound.recv() => frames,
            _ = closed.changed() => None,
        }
    }

    fn close(&self) {
        self.closed_tx.send_replace(true);
        // Dropping the per-connection senders ends the writer tasks and
        // shuts every connection's write half down.
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn multipart_framing_round_trip() {
        let mut buf = Vec::new();
        let frames = vec![Bytes::from_static(b"one"), Bytes::from_static(b""),
            Bytes::from_static(b"three")];
        write_multipart(&mut buf, &frames).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read = read_multipart(&mut cursor).await.unwrap().unwrap();
        assert_eq!(read, frames);

        // The cursor is exhausted; the next read is a clean EOF.
        assert!(read_multipart(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_multipart(&mut cursor).await,
            Err(Error::Frame(_))
        ));
    }

    #[tokio::test]
    async fn zero_frame_count_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_multipart(&mut cursor).await,
            Err(Error::Frame(_))
        ));
    }

    #[tokio::test]
    async fn dealer_router_round_trip() {
        let router = bind("127.0.0.1:0").await.unwrap();
        let dealer = connect(&router.local_addr().to_string()).await.unwrap();

        dealer
            .send(vec![Bytes::from_static(b"hello"), Bytes::from_static(b"world")])
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(5), router.recv())
            .await
            .expect("router recv timed out")
            .unwrap();
        assert_eq!(inbound.len(), 3);
        assert_eq!(&inbound[1][..], b"hello");
        assert_eq!(&inbound[2][..], b"world");

        // Echo back through the peer frame.
        router
            .send(vec![inbound[0].clone(), Bytes::from_static(b"pong")])
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), dealer.recv())
            .await
            .expect("dealer recv timed out")
            .unwrap();
        assert_eq!(reply, vec![Bytes::from_static(b"pong")]);

        dealer.close();
        router.close();
    }

    #[tokio::test]
    async fn dealer_sees_eof_when_router_closes() {
        let router = bind("127.0.0.1:0").await.unwrap();
        let dealer = connect(&router.local_addr().to_string()).await.unwrap();

        // Make sure the connection is established before tearing down.
        dealer.send(vec![Bytes::from_static(b"ping")]).unwrap();
        tokio::time::timeout(Duration::from_secs(5), router.recv())
            .await
            .expect("router recv timed out")
            .unwrap();

        router.close();
        let end = tokio::time::timeout(Duration::from_secs(5), dealer.recv())
            .await
            .expect("dealer recv timed out");
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn responses_to_departed_peers_are_dropped() {
        let router = bind("127.0.0.1:0").await.unwrap();
        let ghost = Bytes::from_static(b"\x00\x00\x00\x63");
        router
            .send(vec![ghost, Bytes::from_static(b"late reply")])
            .unwrap();
        router.close();
    }
}
