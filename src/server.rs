//! Server protocol — the ROUTER side of the RPC core.
//!
//! Inbound requests arrive as `[peer, header, name, args, kwargs]`
//! multiparts.  The dotted name is resolved through the handler tree;
//! the resolved method's future is spawned, and its outcome — success
//! value or [`CallError`] — is framed into the response multipart and
//! routed back through the retained `(peer, req_id)` pair.
//!
//! Handler failures always travel as response payloads; they never close
//! the connection.  Requests the server cannot even decode are logged at
//! error severity and dropped.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rmpv::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::codec::{Packer, Unpacker};
use crate::errors::CallError;
use crate::handler::{Handler, MethodFuture, Node, RpcMethod};
use crate::transport::Transport;
use crate::wire::{self, InstancePrefix, RequestHeader, ResponseHeader};

// ---------------------------------------------------------------------------
// Protocol state
// ---------------------------------------------------------------------------

pub(crate) struct ServerProtocol {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    handler: Arc<dyn Handler>,
    prefix: InstancePrefix,
    state: Mutex<ServerState>,
    closed_tx: watch::Sender<bool>,
}

struct ServerState {
    packer: Packer,
    unpacker: Unpacker,
}

impl ServerProtocol {
    pub(crate) fn new(handler: Arc<dyn Handler>, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            handler,
            prefix: InstancePrefix::new(),
            state: Mutex::new(ServerState {
                packer: Packer::new(),
                unpacker: Unpacker::new(),
            }),
            closed_tx: watch::channel(false).0,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle one inbound request multipart.
    pub(crate) fn msg_received(self: &Arc<Self>, frames: Vec<Bytes>) {
        if frames.len() != wire::SERVER_REQUEST_FRAMES {
            error!(
                frames = frames.len(),
                expected = wire::SERVER_REQUEST_FRAMES,
                "cannot unpack request multipart, dropping"
            );
            return;
        }
        let peer = frames[0].clone();
        let header = match RequestHeader::decode(&frames[1]) {
            Ok(header) => header,
            Err(e) => {
                error!(error = %e, "cannot unpack request header, dropping");
                return;
            }
        };
        let name = match std::str::from_utf8(&frames[2]) {
            Ok(name) => name,
            Err(e) => {
                error!(error = %e, "request name is not utf-8, dropping");
                return;
            }
        };

        let future: MethodFuture = match self.dispatch(name) {
            Err(not_found) => Box::pin(std::future::ready(Err(not_found))),
            Ok(method) => {
                let (args, kwargs) = {
                    let mut state = self.lock_state();
                    state.unpacker.feed(&frames[3]);
                    let args = match state.unpacker.unpack().map(|v| v.as_array().cloned()) {
                        Ok(Some(args)) => args,
                        _ => {
                            error!(name, "cannot unpack positional args, dropping");
                            return;
                        }
                    };
                    state.unpacker.feed(&frames[4]);
                    let kwargs = match state.unpacker.unpack().map(|v| v.as_map().cloned()) {
                        Ok(Some(kwargs)) => kwargs,
                        _ => {
                            error!(name, "cannot unpack keyword args, dropping");
                            return;
                        }
                    };
                    (args, kwargs)
                };
                method.invoke(args, kwargs)
            }
        };

        let proto = Arc::clone(self);
        let req_id = header.req_id;
        tokio::spawn(async move {
            let result = future.await;
            proto.process_call_result(result, peer, req_id);
        });
    }

    /// Frame a completed call into its response multipart and route it back
    /// to the originating peer.
    fn process_call_result(
        &self,
        result: std::result::Result<Value, CallError>,
        peer: Bytes,
        req_id: u32,
    ) {
        let transport = self
            .transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(transport) = transport else {
            debug!(req_id, "transport gone, dropping response");
            return;
        };

        let (is_error, payload_value) = match result {
            Ok(value) => (false, value),
            Err(err) => (
                true,
                Value::Array(vec![
                    Value::String(err.identifier().into()),
                    Value::Array(err.wire_args()),
                ]),
            ),
        };
        let payload = match self.lock_state().packer.pack(&payload_value) {
            Ok(payload) => payload,
            Err(e) => {
                error!(req_id, error = %e, "cannot pack response payload");
                return;
            }
        };

        let header = ResponseHeader::new(self.prefix, req_id, is_error).encode();
        let multipart = vec![peer, Bytes::copy_from_slice(&header), payload];
        if let Err(e) = transport.send(multipart) {
            warn!(req_id, error = %e, "cannot write response");
        }
    }

    /// Resolve a dotted name through the handler tree.
    ///
    /// Every intermediate segment must resolve to a sub-handler and the
    /// final segment to a registered method; anything else — a missing key,
    /// a method in namespace position, a sub-handler in leaf position — is
    /// `NotFound` for the full name.
    fn dispatch(&self, name: &str) -> std::result::Result<Arc<RpcMethod>, CallError> {
        if name.is_empty() {
            return Err(CallError::NotFound(name.to_string()));
        }
        let (namespaces, leaf) = match name.rsplit_once('.') {
            Some((namespaces, leaf)) if !namespaces.is_empty() => (Some(namespaces), leaf),
            Some((_, leaf)) => (None, leaf),
            None => (None, name),
        };

        let mut handler = Arc::clone(&self.handler);
        if let Some(namespaces) = namespaces {
            for part in namespaces.split('.') {
                match handler.lookup(part) {
                    Some(Node::Sub(sub)) => handler = sub,
                    _ => return Err(CallError::NotFound(name.to_string())),
                }
            }
        }
        match handler.lookup(leaf) {
            Some(Node::Method(method)) => Ok(method),
            _ => Err(CallError::NotFound(name.to_string())),
        }
    }

    /// The transport is gone: release `wait_closed` waiters.  In-flight
    /// handler futures still run; their responses are dropped.
    pub(crate) fn connection_lost(&self) {
        self.transport
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
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
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::val_u64;
    use crate::errors::identifier;
    use crate::handler::{Kwargs, Namespace};
    use crate::transport::{mem, Transport as _};
    use std::time::Duration;

    fn add_method() -> RpcMethod {
        RpcMethod::sync(|args, _kwargs| {
            let a = args.first().and_then(Value::as_u64).unwrap_or(0);
            let b = args.get(1).and_then(Value::as_u64).unwrap_or(0);
            Ok(Value::from(a + b))
        })
    }

    fn tree() -> Namespace {
        Namespace::new()
            .method("root_add", add_method())
            .sub("ns", Namespace::new().method("add", add_method()))
    }

    fn proto_over(handler: Namespace) -> (Arc<ServerProtocol>, Arc<dyn Transport>, mem::MemTransport) {
        let (dealer, router) = mem::pair();
        let router: Arc<dyn Transport> = Arc::new(router);
        let proto = Arc::new(ServerProtocol::new(
            Arc::new(handler),
            Arc::clone(&router),
        ));
        (proto, router, dealer)
    }

    fn request_frames(req_id: u32, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Vec<Bytes> {
        let header = RequestHeader::new(InstancePrefix::new(), req_id);
        let mut packer = Packer::new();
        vec![
            Bytes::copy_from_slice(&header.encode()),
            Bytes::copy_from_slice(name.as_bytes()),
            packer.pack(&Value::Array(args)).unwrap(),
            packer.pack(&Value::Map(kwargs)).unwrap(),
        ]
    }

    /// Push a request through the dealer end, feed it to the protocol, and
    /// decode the response multipart.
    async fn round_trip(
        proto: &Arc<ServerProtocol>,
        router: &Arc<dyn Transport>,
        dealer: &mem::MemTransport,
        request: Vec<Bytes>,
    ) -> (ResponseHeader, Value) {
        dealer.send(request).unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(5), router.recv())
            .await
            .expect("request timed out")
            .unwrap();
        proto.msg_received(inbound);

        let reply = tokio::time::timeout(Duration::from_secs(5), dealer.recv())
            .await
            .expect("response timed out")
            .unwrap();
        assert_eq!(reply.len(), wire::RESPONSE_FRAMES);
        let header = ResponseHeader::decode(&reply[0]).unwrap();
        let mut unpacker = Unpacker::new();
        unpacker.feed(&reply[1]);
        (header, unpacker.unpack().unwrap())
    }

    // -- dispatch -----------------------------------------------------------

    #[test]
    fn dispatch_resolves_exact_paths() {
        let (proto, _router, _dealer) = proto_over(tree());
        assert!(proto.dispatch("ns.add").is_ok());
        assert!(proto.dispatch("root_add").is_ok());
    }

    #[test]
    fn dispatch_rejects_missing_and_extra_segments() {
        let (proto, _router, _dealer) = proto_over(tree());
        for name in ["", "ns", "ns.missing", "nope.add", "ns.add.extra", "missing"] {
            match proto.dispatch(name) {
                Err(CallError::NotFound(reported)) => assert_eq!(reported, name),
                other => panic!("{name:?} resolved unexpectedly: {other:?}"),
            }
        }
    }

    #[test]
    fn dispatch_rejects_namespace_in_leaf_position() {
        // "ns" resolves, but it is a sub-handler, not a registered method.
        let (proto, _router, _dealer) = proto_over(tree());
        assert!(matches!(
            proto.dispatch("ns"),
            Err(CallError::NotFound(_))
        ));
    }

    // -- request handling ---------------------------------------------------

    #[tokio::test]
    async fn request_invokes_method_and_frames_result() {
        let (proto, router, dealer) = proto_over(tree());
        let (header, value) = round_trip(
            &proto,
            &router,
            &dealer,
            request_frames(7, "ns.add", vec![val_u64(2), val_u64(3)], vec![]),
        )
        .await;
        assert_eq!(header.req_id, 7);
        assert!(!header.is_error);
        assert_eq!(value, val_u64(5));
    }

    #[tokio::test]
    async fn unresolved_name_produces_not_found_response() {
        let (proto, router, dealer) = proto_over(tree());
        let (header, value) = round_trip(
            &proto,
            &router,
            &dealer,
            request_frames(8, "ns.missing", vec![], vec![]),
        )
        .await;
        assert!(header.is_error);
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_str(), Some(identifier::NOT_FOUND));
        assert_eq!(
            items[1].as_array().unwrap()[0].as_str(),
            Some("ns.missing")
        );
    }

    #[tokio::test]
    async fn handler_error_travels_as_error_payload() {
        let handler = Namespace::new().method(
            "fail",
            RpcMethod::sync(|_, _| Err(CallError::Io("boom".into()))),
        );
        let (proto, router, dealer) = proto_over(handler);
        let (header, value) = round_trip(
            &proto,
            &router,
            &dealer,
            request_frames(9, "fail", vec![], vec![]),
        )
        .await;
        assert!(header.is_error);
        let items = value.as_array().unwrap();
        assert_eq!(items[0].as_str(), Some(identifier::IO));
        assert_eq!(items[1].as_array().unwrap()[0].as_str(), Some("boom"));
    }

    #[tokio::test]
    async fn async_method_completes_and_responds() {
        let handler = Namespace::new().method(
            "slow",
            RpcMethod::new(|_args, _kwargs| async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(Value::from(42))
            }),
        );
        let (proto, router, dealer) = proto_over(handler);
        let (header, value) = round_trip(
            &proto,
            &router,
            &dealer,
            request_frames(10, "slow", vec![], vec![]),
        )
        .await;
        assert!(!header.is_error);
        assert_eq!(value, Value::from(42));
    }

    #[tokio::test]
    async fn undecodable_request_is_dropped_without_response() {
        let (proto, router, dealer) = proto_over(tree());

        // Garbage header.
        dealer
            .send(vec![
                Bytes::from_static(b"bad"),
                Bytes::from_static(b"ns.add"),
                Bytes::new(),
                Bytes::new(),
            ])
            .unwrap();
        let inbound = router.recv().await.unwrap();
        proto.msg_received(inbound);

        // Args blob that is not an array.
        let header = RequestHeader::new(InstancePrefix::new(), 11);
        let mut packer = Packer::new();
        dealer
            .send(vec![
                Bytes::copy_from_slice(&header.encode()),
                Bytes::from_static(b"ns.add"),
                packer.pack(&val_u64(5)).unwrap(),
                packer.pack(&Value::Map(vec![])).unwrap(),
            ])
            .unwrap();
        let inbound = router.recv().await.unwrap();
        proto.msg_received(inbound);

        assert!(
            tokio::time::timeout(Duration::from_millis(50), dealer.recv())
                .await
                .is_err(),
            "no response should have been written"
        );
    }

    #[tokio::test]
    async fn wait_closed_returns_after_connection_lost() {
        let (proto, _router, _dealer) = proto_over(tree());
        proto.connection_lost();
        tokio::time::timeout(Duration::from_secs(1), proto.wait_closed())
            .await
            .expect("wait_closed should return immediately");
    }
}
