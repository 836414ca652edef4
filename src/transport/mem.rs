//! In-process transport pair over unbounded channels.
//!
//! [`pair`] yields a connected DEALER/ROUTER couple: whatever one end
//! sends, the other receives, in order.  The ROUTER end observes a
//! synthetic `peer` frame prepended to every inbound multipart and strips
//! the leading peer frame from outbound multiparts, mirroring what a real
//! routing socket does for a single connection.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use super::Transport;
use crate::errors::{Error, Result};

/// The one peer identity a pair ever carries.
const PEER: &[u8] = b"\x00mem-peer";

/// One end of an in-process transport pair.
pub struct MemTransport {
    router: bool,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<Bytes>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<Bytes>>>,
    closed_tx: watch::Sender<bool>,
}

/// Create a connected (dealer, router) transport couple.
pub fn pair() -> (MemTransport, MemTransport) {
    let (c2s_tx, c2s_rx) = mpsc::unbounded_channel();
    let (s2c_tx, s2c_rx) = mpsc::unbounded_channel();
    let dealer = MemTransport {
        router: false,
        tx: Mutex::new(Some(c2s_tx)),
        rx: tokio::sync::Mutex::new(s2c_rx),
        closed_tx: watch::channel(false).0,
    };
    let router = MemTransport {
        router: true,
        tx: Mutex::new(Some(s2c_tx)),
        rx: tokio::sync::Mutex::new(c2s_rx),
        closed_tx: watch::channel(false).0,
    };
    (dealer, router)
}

impl MemTransport {
    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<Bytes>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn send(&self, mut frames: Vec<Bytes>) -> Result<()> {
        let Some(tx) = self.sender() else {
            return Err(Error::ConnectionClosed);
        };
        if self.router {
            // First frame addresses the peer; this pair only has one.
            if frames.first().map(|f| f.as_ref()) != Some(PEER) {
                tracing::warn!("dropping multipart addressed to unknown peer");
                return Ok(());
            }
            frames.remove(0);
        }
        tx.send(frames).map_err(|_| Error::ConnectionClosed)
    }

    async fn recv(&self) -> Option<Vec<Bytes>> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frames = rx.recv() => frames.map(|mut frames| {
                if self.router {
                    frames.insert(0, Bytes::from_static(PEER));
                }
                frames
            }),
            _ = closed.changed() => None,
        }
    }

    fn close(&self) {
        // Dropping the sender lets the peer's recv drain to None.
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.closed_tx.send_replace(true);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
