//! Client protocol — the DEALER side of the RPC core.
//!
//! The protocol owns the outstanding-call registry: every `call` allocates
//! a fresh request id, parks a oneshot sender under it, and writes the
//! request multipart.  When a response multipart arrives, the id in its
//! header selects the registry entry to resolve; responses may arrive in
//! any order relative to their requests.
//!
//! Malformed responses and responses for ids the registry does not know
//! are logged at error severity and dropped — a bad frame is a peer bug,
//! not a recoverable condition for any particular caller.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use bytes::Bytes;
use rmpv::Value;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error};

use crate::codec::{Packer, Unpacker};
use crate::errors::{CallError, Error, ErrorTable, Result};
use crate::handler::Kwargs;
use crate::transport::Transport;
use crate::wire::{self, InstancePrefix, RequestHeader, ResponseHeader};

// ---------------------------------------------------------------------------
// Protocol state
// ---------------------------------------------------------------------------

pub(crate) struct ClientProtocol {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    prefix: InstancePrefix,
    error_table: ErrorTable,
    state: Mutex<ClientState>,
    closed_tx: watch::Sender<bool>,
}

struct ClientState {
    calls: HashMap<u32, oneshot::Sender<Result<Value>>>,
    counter: u32,
    packer: Packer,
    unpacker: Unpacker,
}

/// What a decoded response resolves its call with.
enum Outcome {
    Success(Value),
    Failure(CallError),
}

impl ClientProtocol {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            prefix: InstancePrefix::new(),
            error_table: ErrorTable::new(),
            state: Mutex::new(ClientState {
                calls: HashMap::new(),
                counter: 0,
                packer: Packer::new(),
                unpacker: Unpacker::new(),
            }),
            closed_tx: watch::channel(false).0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Advance the counter (wrapping past `0xFFFF_FFFF` to zero) and build
    /// the request header for the new id.
    ///
    /// An id colliding with an outstanding call means the caller managed to
    /// keep 2^32 calls in flight; that is a programming error, not a
    /// recoverable condition.
    fn allocate_id(
        &self,
        state: &mut ClientState,
    ) -> ([u8; wire::REQUEST_HEADER_LEN], u32) {
        state.counter = state.counter.wrapping_add(1);
        let req_id = state.counter;
        assert!(
            !state.calls.contains_key(&req_id),
            "request id {req_id} already has a call in flight"
        );
        (RequestHeader::new(self.prefix, req_id).encode(), req_id)
    }

    /// Issue a call.  Serializes the arguments, registers a pending entry,
    /// writes the request multipart, and returns the pending future without
    /// suspending.
    pub(crate) fn call(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<PendingCall> {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::ConnectionClosed)?;

        let (frames, req_id, rx) = {
            let mut state = self.lock_state();
            let args_blob = state.packer.pack(&Value::Array(args))?;
            let kwargs_blob = state.packer.pack(&Value::Map(kwargs))?;
            let (header, req_id) = self.allocate_id(&mut state);
            let (tx, rx) = oneshot::channel();
            state.calls.insert(req_id, tx);
            (
                vec![
                    Bytes::copy_from_slice(&header),
                    Bytes::copy_from_slice(name.as_bytes()),
                    args_blob,
                    kwargs_blob,
                ],
                req_id,
                rx,
            )
        };

        if let Err(e) = transport.send(frames) {
            self.lock_state().calls.remove(&req_id);
            return Err(e);
        }
        Ok(PendingCall { rx })
    }

    /// Feed one inbound response multipart through the matching machinery.
    pub(crate) fn msg_received(&self, frames: Vec<Bytes>) {
        let (header, outcome) = match self.decode_response(&frames) {
            Ok(decoded) => decoded,
            Err(e) => {
                error!(error = %e, "cannot decode response, dropping");
                return;
            }
        };

        let Some(sender) = self.lock_state().calls.remove(&header.req_id) else {
            error!(
                req_id = header.req_id,
                pid = header.prefix.pid,
                rnd = header.prefix.rnd,
                is_error = header.is_error,
                "unknown answer id, dropping"
            );
            return;
        };

        let result = match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(err) => Err(Error::Remote(err)),
        };
        if sender.send(result).is_err() {
            debug!(req_id = header.req_id, "caller dropped before the response arrived");
        }
    }

    /// Decode a `[header, payload]` multipart fully before touching the
    /// registry, so a malformed response leaves its call pending.
    fn decode_response(&self, frames: &[Bytes]) -> Result<(ResponseHeader, Outcome)> {
        if frames.len() != wire::RESPONSE_FRAMES {
            return Err(Error::Frame(format!(
                "response has {} frames, expected {}",
                frames.len(),
                wire::RESPONSE_FRAMES
            )));
        }
        let header = ResponseHeader::decode(&frames[0])?;
        let payload = {
            let mut state = self.lock_state();
            state.unpacker.feed(&frames[1]);
            state.unpacker.unpack()?
        };

        if !header.is_error {
            return Ok((header, Outcome::Success(payload)));
        }

        let items = payload
            .as_array()
            .ok_or_else(|| Error::Frame("error payload is not a sequence".into()))?;
        if items.len() != 2 {
            return Err(Error::Frame(format!(
                "error payload has {} elements, expected 2",
                items.len()
            )));
        }
        let identifier = items[0]
            .as_str()
            .ok_or_else(|| Error::Frame("error identifier is not a string".into()))?;
        let args = items[1]
            .as_array()
            .cloned()
            .ok_or_else(|| Error::Frame("error args is not a sequence".into()))?;
        let err = self.error_table.translate(identifier, args);
        Ok((header, Outcome::Failure(err)))
    }

    /// The transport is gone: reject everything outstanding and release
    /// `wait_closed` waiters.
    pub(crate) fn connection_lost(&self) {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let calls = std::mem::take(&mut self.lock_state().calls);
        if !calls.is_empty() {
            debug!(count = calls.len(), "rejecting pending calls on connection loss");
        }
        for (_, sender) in calls {
            let _ = sender.send(Err(Error::ConnectionClosed));
        }
        self.closed_tx.send_replace(true);
    }

    pub(crate) fn close(&self) {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(transport) = transport {
            transport.close();
        }
    }

    pub(crate) async fn wait_closed(&self) {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return;
        }
        let _ = closed.changed().await;
    }

    #[cfg(test)]
    fn force_counter(&self, value: u32) {
        self.lock_state().counter = value;
    }
}

// ---------------------------------------------------------------------------
// Pending call future
// ---------------------------------------------------------------------------

/// The caller's handle on an in-flight call.  Resolves when the matching
/// response arrives; resolves to [`Error::ConnectionClosed`] if the
/// transport is lost first.
pub struct PendingCall {
    rx: oneshot::Receiver<Result<Value>>,
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionClosed),
        })
    }
}

// ---------------------------------------------------------------------------
// Dynamic call builder
// ---------------------------------------------------------------------------

/// An immutable dotted-name accumulator.
///
/// Each [`name`](MethodCall::name) call appends a segment;
/// [`call`](MethodCall::call) joins the segments with `.` and issues the
/// request.  Invoking with no accumulated segments is an argument error.
///
/// ```no_run
/// # async fn demo(client: zrpc::RpcClient) -> zrpc::Result<()> {
/// use zrpc::codec::val_u64;
///
/// let sum = client
///     .rpc()
///     .name("math")
///     .name("add")
///     .call(vec![val_u64(2), val_u64(3)], vec![])?
///     .await?;
/// # let _ = sum;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MethodCall {
    proto: Arc<ClientProtocol>,
    names: Vec<String>,
}

impl MethodCall {
    pub(crate) fn new(proto: Arc<ClientProtocol>) -> Self {
        Self {
            proto,
            names: Vec::new(),
        }
    }

    /// Append one name segment.
    pub fn name(mut self, segment: &str) -> Self {
        self.names.push(segment.to_string());
        self
    }

    /// Issue the accumulated call.
    pub fn call(&self, args: Vec<Value>, kwargs: Kwargs) -> Result<PendingCall> {
        if self.names.is_empty() {
            return Err(Error::EmptyMethodName);
        }
        self.proto.call(&self.names.join("."), args, kwargs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
