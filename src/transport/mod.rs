//! The narrow transport interface the protocol core consumes.
//!
//! The core neither connects nor routes; it hands ordered lists of opaque
//! byte frames to a [`Transport`] and receives the same shape back.  On the
//! ROUTER-style (server) end the transport prepends an opaque `peer` frame
//! to every inbound multipart and expects it back as the first outbound
//! frame, which is how replies find their originating connection.
//!
//! Two carriers ship with the crate:
//!
//! - [`mem`] — an in-process DEALER/ROUTER pair over unbounded channels,
//!   used by the protocol tests and for loop-back wiring.
//! - [`tcp`] — length-prefixed multipart framing over TCP, with a
//!   connecting DEALER end and a listening ROUTER end.
//!
//! Addressing strings are passed to the carrier constructors verbatim; the
//! protocol core never parses them.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::Result;

pub mod mem;
pub mod tcp;

/// An ordered-multipart frame carrier.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Queue one multipart message for delivery.  Does not suspend; frames
    /// are flushed by the carrier in order.
    fn send(&self, frames: Vec<Bytes>) -> Result<()>;

    /// Receive the next inbound multipart message, or `None` once the
    /// connection is closed (locally or by the peer).
    async fn recv(&self) -> Option<Vec<Bytes>>;

    /// Tear the connection down.  Idempotent.
    fn close(&self);
}
