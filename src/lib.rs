//! Asynchronous ZeroMQ-style RPC over multipart frame transports.
//!
//! A DEALER-style client issues namespaced calls against a ROUTER-style
//! server; requests and responses travel as multipart frame lists with
//! fixed-layout binary headers and MsgPack payloads, matched by a 32-bit
//! request id.  Method names are dotted paths resolved through a tree of
//! [`Handler`]s whose leaves are [`RpcMethod`] endpoints; handler errors
//! round-trip to the caller as typed [`CallError`]s.
//!
//! The protocol core is transport-agnostic: anything implementing
//! [`Transport`] carries it.  The crate ships an in-process pair
//! ([`transport::mem`]) and a TCP carrier ([`transport::tcp`]).
//!
//! ```no_run
//! use rmpv::Value;
//! use zrpc::codec::val_u64;
//! use zrpc::{Namespace, RpcMethod, open_client, start_server, transport::mem};
//!
//! # async fn demo() -> zrpc::Result<()> {
//! let (dealer, router) = mem::pair();
//!
//! let handler = Namespace::new().sub(
//!     "math",
//!     Namespace::new().method(
//!         "add",
//!         RpcMethod::sync(|args, _kwargs| {
//!             let a = args[0].as_u64().unwrap_or(0);
//!             let b = args[1].as_u64().unwrap_or(0);
//!             Ok(Value::from(a + b))
//!         }),
//!     ),
//! );
//! let server = start_server(handler, router);
//! let client = open_client(dealer);
//!
//! let sum = client
//!     .rpc()
//!     .name("math")
//!     .name("add")
//!     .call(vec![val_u64(2), val_u64(3)], vec![])?
//!     .await?;
//! assert_eq!(sum.as_u64(), Some(5));
//!
//! client.close();
//! client.wait_closed().await;
//! server.close();
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod errors;
pub mod handler;
pub mod transport;
pub mod wire;

mod client;
mod server;

pub use client::{MethodCall, PendingCall};
pub use errors::{CallError, Error, ErrorTable, Result};
pub use handler::{Handler, Kwargs, MethodFuture, Namespace, Node, RpcMethod};
pub use transport::Transport;

use std::sync::Arc;

use rmpv::Value;

use client::ClientProtocol;
use server::ServerProtocol;

// ---------------------------------------------------------------------------
// Client handle
// ---------------------------------------------------------------------------

/// A connected RPC client.
///
/// Created by [`open_client`].  Cheap to use from many tasks: calls only
/// touch the internal registry and the transport's outbound queue.
pub struct RpcClient {
    proto: Arc<ClientProtocol>,
}

impl RpcClient {
    /// The dynamic call builder rooted at this client.
    pub fn rpc(&self) -> MethodCall {
        MethodCall::new(Arc::clone(&self.proto))
    }

    /// Issue a call by its full dotted name.
    pub fn call(&self, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<PendingCall> {
        self.proto.call(name, args, kwargs)
    }

    /// Tear the transport down.  Idempotent; a no-op once the connection
    /// is already gone.
    pub fn close(&self) {
        self.proto.close();
    }

    /// Suspend until the transport reports disconnect.  Returns
    /// immediately if the connection is already closed.
    pub async fn wait_closed(&self) {
        self.proto.wait_closed().await;
    }
}

/// Connect an RPC client over `transport`.
///
/// Spawns the receive loop onto the current Tokio runtime, so this must be
/// called from within one.
pub fn open_client(transport: impl Transport) -> RpcClient {
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let proto = Arc::new(ClientProtocol::new(Arc::clone(&transport)));

    let loop_proto = Arc::clone(&proto);
    tokio::spawn(async move {
        while let Some(frames) = transport.recv().await {
            loop_proto.msg_received(frames);
        }
        loop_proto.connection_lost();
    });

    RpcClient { proto }
}

// ---------------------------------------------------------------------------
// Server handle
// ---------------------------------------------------------------------------

/// A running RPC server.
///
/// Created by [`start_server`].  Dropping the handle does not stop the
/// server; call [`close`](RpcServer::close).
pub struct RpcServer {
    proto: Arc<ServerProtocol>,
}

impl RpcServer {
    /// Tear the transport down.  Idempotent.
    pub fn close(&self) {
        self.proto.close();
    }

    /// Suspend until the transport reports disconnect.
    pub async fn wait_closed(&self) {
        self.proto.wait_closed().await;
    }
}

/// Serve `handler` over `transport`.
///
/// Spawns the receive loop onto the current Tokio runtime, so this must be
/// called from within one.
pub fn start_server(handler: impl Handler + 'static, transport: impl Transport) -> RpcServer {
    let handler: Arc<dyn Handler> = Arc::new(handler);
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let proto = Arc::new(ServerProtocol::new(handler, Arc::clone(&transport)));

    let loop_proto = Arc::clone(&proto);
    tokio::spawn(async move {
        while let Some(frames) = transport.recv().await {
            loop_proto.msg_received(frames);
        }
        loop_proto.connection_lost();
    });

    RpcServer { proto }
}

// ---------------------------------------------------------------------------
// End-to-end tests
// ---------------------------------------------------------------------------
