//! Server-side handler tree — namespaces, endpoints and the lookup contract.
//!
//! Dispatch walks a tree of [`Handler`]s keyed by the segments of a dotted
//! method name.  Interior nodes are handlers; leaves are [`RpcMethod`]s.
//! Wrapping a function in `RpcMethod` is what marks it as callable over
//! RPC — a handler may expose arbitrary sub-nodes, but dispatch only ever
//! invokes `RpcMethod` leaves, so nothing is reachable by accident.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmpv::Value;

use crate::errors::CallError;

/// Keyword arguments as decoded from the wire: a MsgPack map.
pub type Kwargs = Vec<(Value, Value)>;

/// The future every method invocation resolves through.  Synchronous
/// methods are wrapped in an already-completed future so the dispatcher
/// never needs to distinguish the two.
pub type MethodFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, CallError>> + Send>>;

// ---------------------------------------------------------------------------
// Lookup contract
// ---------------------------------------------------------------------------

/// A node in the handler tree: either a nested handler or an endpoint.
#[derive(Clone)]
pub enum Node {
    Sub(Arc<dyn Handler>),
    Method(Arc<RpcMethod>),
}

/// The single capability dispatch needs: resolve one name segment.
///
/// Returning `None` reports the key as missing.  A custom implementation
/// can back this with anything — a struct's fields, a database, a
/// generated service table.
pub trait Handler: Send + Sync {
    fn lookup(&self, key: &str) -> Option<Node>;
}

// ---------------------------------------------------------------------------
// Endpoint marker
// ---------------------------------------------------------------------------

/// A function registered as an RPC endpoint.
///
/// Holds the uniform invocation signature: positional arguments and keyword
/// arguments in, a [`MethodFuture`] out.
pub struct RpcMethod {
    func: Box<dyn Fn(Vec<Value>, Kwargs) -> MethodFuture + Send + Sync>,
}

impl RpcMethod {
    /// Register an asynchronous method.
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, CallError>> + Send + 'static,
    {
        Self {
            func: Box::new(move |args, kwargs| Box::pin(func(args, kwargs))),
        }
    }

    /// Register a synchronous method; its result is delivered through an
    /// already-completed future.
    pub fn sync<F>(func: F) -> Self
    where
        F: Fn(Vec<Value>, Kwargs) -> std::result::Result<Value, CallError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(move |args, kwargs| {
                let result = func(args, kwargs);
                Box::pin(std::future::ready(result))
            }),
        }
    }

    pub fn invoke(&self, args: Vec<Value>, kwargs: Kwargs) -> MethodFuture {
        (self.func)(args, kwargs)
    }
}

impl std::fmt::Debug for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RpcMethod")
    }
}

// ---------------------------------------------------------------------------
// Map-backed handler
// ---------------------------------------------------------------------------

/// The standard handler: a registration table of named methods and nested
/// namespaces.
///
/// ```
/// use zrpc::{Namespace, RpcMethod};
/// use rmpv::Value;
///
/// let root = Namespace::new().sub(
///     "math",
///     Namespace::new().method(
///         "add",
///         RpcMethod::sync(|args, _kwargs| {
///             let a = args[0].as_u64().unwrap_or(0);
///             let b = args[1].as_u64().unwrap_or(0);
///             Ok(Value::from(a + b))
///         }),
///     ),
/// );
/// # let _ = root;
/// ```
#[derive(Default)]
pub struct Namespace {
    entries: HashMap<String, Node>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under `name`.
    pub fn method(mut self, name: &str, method: RpcMethod) -> Self {
        self.entries
            .insert(name.to_string(), Node::Method(Arc::new(method)));
        self
    }

    /// Register a nested handler under `name`.
    pub fn sub(mut self, name: &str, handler: impl Handler + 'static) -> Self {
        self.entries
            .insert(name.to_string(), Node::Sub(Arc::new(handler)));
        self
    }
}

impl Handler for Namespace {
    fn lookup(&self, key: &str) -> Option<Node> {
        self.entries.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_method() -> RpcMethod {
        RpcMethod::sync(|args, _| Ok(Value::Array(args)))
    }

    #[test]
    fn namespace_resolves_methods_and_subs() {
        let ns = Namespace::new()
            .method("echo", echo_method())
            .sub("inner", Namespace::new().method("echo", echo_method()));

        assert!(matches!(ns.lookup("echo"), Some(Node::Method(_))));
        assert!(matches!(ns.lookup("inner"), Some(Node::Sub(_))));
        assert!(ns.lookup("absent").is_none());
    }

    #[tokio::test]
    async fn sync_method_completes_immediately() {
        let method = RpcMethod::sync(|args, _| Ok(args.into_iter().next().unwrap()));
        let out = method.invoke(vec![Value::from(7)], vec![]).await.unwrap();
        assert_eq!(out, Value::from(7));
    }

    #[tokio::test]
    async fn async_method_runs_to_completion() {
        let method = RpcMethod::new(|args, _kwargs| async move {
            tokio::task::yield_now().await;
            Ok(Value::Array(args))
        });
        let out = method.invoke(vec![Value::from(1)], vec![]).await.unwrap();
        assert_eq!(out, Value::Array(vec![Value::from(1)]));
    }

    #[tokio::test]
    async fn sync_method_errors_propagate() {
        let method = RpcMethod::sync(|_, _| Err(CallError::InvalidArgs("nope".into())));
        let err = method.invoke(vec![], vec![]).await.unwrap_err();
        assert_eq!(err, CallError::InvalidArgs("nope".into()));
    }
}
