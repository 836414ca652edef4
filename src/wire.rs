//! Wire framing — fixed-layout binary headers and multipart shapes.
//!
//! Every RPC message is a multipart frame list.  The first content frame is
//! a fixed-layout header packed native-endian with no padding:
//!
//! ```text
//! request header (16 bytes)            response header (17 bytes)
//! ┌─────┬─────┬────────┬───────────┐   ┌─────┬─────┬────────┬───────────┬──────────┐
//! │ pid │ rnd │ req_id │ timestamp │   │ pid │ rnd │ req_id │ timestamp │ is_error │
//! │ u16 │ u16 │  u32   │    f64    │   │ u16 │ u16 │  u32   │    f64    │    u8    │
//! └─────┴─────┴────────┴───────────┘   └─────┴─────┴────────┴───────────┴──────────┘
//! ```
//!
//! `pid` and `rnd` form the sender's 4-byte instance prefix; they identify a
//! protocol instance in logs and are not consulted when matching responses.
//! `timestamp` is the sender's clock in seconds since the epoch,
//! informational only.  `req_id` alone keys the client's call registry.
//!
//! Multipart shapes:
//!
//! | Message               | Frames                                      |
//! |-----------------------|---------------------------------------------|
//! | request (client out)  | `[header, name, args_blob, kwargs_blob]`    |
//! | request (server in)   | `[peer, header, name, args_blob, kwargs_blob]` |
//! | response (server out) | `[peer, header, payload_blob]`              |
//! | response (client in)  | `[header, payload_blob]`                    |
//!
//! The `peer` frame is the transport's opaque routing identifier; the
//! ROUTER-style end observes it inbound and must echo it back outbound.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};

pub const REQUEST_HEADER_LEN: usize = 16;
pub const RESPONSE_HEADER_LEN: usize = 17;

/// Frames in a request as written by the client.
pub const REQUEST_FRAMES: usize = 4;
/// Frames in a response as received by the client.
pub const RESPONSE_FRAMES: usize = 2;
/// Frames in a request as received by the server (leading peer frame).
pub const SERVER_REQUEST_FRAMES: usize = 5;

// ---------------------------------------------------------------------------
// Instance prefix
// ---------------------------------------------------------------------------

/// The 4-byte `(pid_low16, random16)` pair chosen once per protocol
/// instance and stamped into every header it writes.
///
/// Purely observational: it distinguishes concurrent instances in logs and
/// has no role in response matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancePrefix {
    pub pid: u16,
    pub rnd: u16,
}

impl InstancePrefix {
    pub fn new() -> Self {
        Self {
            pid: std::process::id() as u16,
            rnd: rand::random::<u16>(),
        }
    }
}

impl Default for InstancePrefix {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Decoded request header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestHeader {
    pub prefix: InstancePrefix,
    pub req_id: u32,
    pub timestamp: f64,
}

impl RequestHeader {
    pub fn new(prefix: InstancePrefix, req_id: u32) -> Self {
        Self {
            prefix,
            req_id,
            timestamp: now_timestamp(),
        }
    }

    pub fn encode(&self) -> [u8; REQUEST_HEADER_LEN] {
        let mut buf = [0u8; REQUEST_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.prefix.pid.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.prefix.rnd.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.req_id.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_ne_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != REQUEST_HEADER_LEN {
            return Err(Error::Frame(format!(
                "request header is {} bytes, expected {REQUEST_HEADER_LEN}",
                bytes.len()
            )));
        }
        Ok(Self {
            prefix: InstancePrefix {
                pid: u16::from_ne_bytes([bytes[0], bytes[1]]),
                rnd: u16::from_ne_bytes([bytes[2], bytes[3]]),
            },
            req_id: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            timestamp: f64::from_ne_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
        })
    }
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResponseHeader {
    pub prefix: InstancePrefix,
    pub req_id: u32,
    pub timestamp: f64,
    pub is_error: bool,
}

impl ResponseHeader {
    pub fn new(prefix: InstancePrefix, req_id: u32, is_error: bool) -> Self {
        Self {
            prefix,
            req_id,
            timestamp: now_timestamp(),
            is_error,
        }
    }

    pub fn encode(&self) -> [u8; RESPONSE_HEADER_LEN] {
        let mut buf = [0u8; RESPONSE_HEADER_LEN];
        buf[0..2].copy_from_slice(&self.prefix.pid.to_ne_bytes());
        buf[2..4].copy_from_slice(&self.prefix.rnd.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.req_id.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_ne_bytes());
        buf[16] = self.is_error as u8;
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RESPONSE_HEADER_LEN {
            return Err(Error::Frame(format!(
                "response header is {} bytes, expected {RESPONSE_HEADER_LEN}",
                bytes.len()
            )));
        }
        Ok(Self {
            prefix: InstancePrefix {
                pid: u16::from_ne_bytes([bytes[0], bytes[1]]),
                rnd: u16::from_ne_bytes([bytes[2], bytes[3]]),
            },
            req_id: u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            timestamp: f64::from_ne_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            is_error: bytes[16] != 0,
        })
    }
}

/// Seconds since the epoch on this host's clock.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
