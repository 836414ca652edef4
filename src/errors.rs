//! Error taxonomy for the RPC core.
//!
//! Two families of errors live here:
//!
//! - [`Error`] — local failures observed by the caller: transport loss,
//!   framing violations, codec failures.  These never travel on the wire.
//! - [`CallError`] — failures raised by (or on behalf of) an RPC method on
//!   the server.  A `CallError` is serialized into the response payload as a
//!   `(identifier, args)` pair and reconstructed on the client through the
//!   [`ErrorTable`].
//!
//! ## Wire identifiers
//!
//! Every `CallError` kind has a stable dotted identifier of the form
//! `<origin>.<Name>`:
//!
//! | Variant        | Identifier              |
//! |----------------|-------------------------|
//! | `NotFound`     | `zrpc.NotFoundError`    |
//! | `InvalidArgs`  | `zrpc.InvalidArgsError` |
//! | `Io`           | `std.io.Error`          |
//! | `Utf8`         | `std.str.Utf8Error`     |
//! | `Parse`        | `std.num.ParseError`    |
//! | `Generic`      | `zrpc.GenericError`     |
//!
//! The identifier string is opaque to the transport; the receiving client
//! looks it up in its error table.  An identifier the table does not know
//! reconstructs as [`CallError::Generic`] carrying the foreign identifier
//! and the original argument list verbatim.

use std::collections::HashMap;

use rmpv::Value;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Local errors
// ---------------------------------------------------------------------------

/// Errors surfaced to the local caller (never serialized).
#[derive(Debug, Error)]
pub enum Error {
    /// The transport reported disconnect, or was already gone when a call
    /// was attempted.
    #[error("connection closed")]
    ConnectionClosed,

    /// A multipart message violated the framing contract (wrong frame
    /// count, short header, malformed payload structure).
    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    /// Typed value conversion through the serde bridge failed.
    #[error("value conversion error: {0}")]
    Convert(#[from] rmpv::ext::Error),

    /// A call was invoked through the builder with no name segments.
    #[error("RPC method name is empty")]
    EmptyMethodName,

    /// The remote method failed; carries the reconstructed error.
    #[error(transparent)]
    Remote(#[from] CallError),
}

// ---------------------------------------------------------------------------
// Remote (handler) errors
// ---------------------------------------------------------------------------

/// An error raised by an RPC method, or by dispatch on its behalf.
///
/// Handlers return `Result<Value, CallError>`; the server serializes the
/// failure into the response payload and the client reconstructs it here.
/// The closed variants cover the standard kinds the framework knows how to
/// rebuild; everything else round-trips as [`CallError::Generic`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// Dispatch could not resolve the dotted method name.
    #[error("method not found: {0}")]
    NotFound(String),

    /// The method rejected its positional or keyword arguments.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("invalid utf-8: {0}")]
    Utf8(String),

    #[error("parse error: {0}")]
    Parse(String),

    /// A remote error whose identifier is not in the local table, or a
    /// handler error raised without a more specific kind.  Carries the
    /// wire identifier and the original argument list.
    #[error("remote error {identifier}: {args:?}")]
    Generic {
        identifier: String,
        args: Vec<Value>,
    },
}

/// Wire identifiers for the error kinds the framework registers.
pub mod identifier {
    pub const NOT_FOUND: &str = "zrpc.NotFoundError";
    pub const INVALID_ARGS: &str = "zrpc.InvalidArgsError";
    pub const GENERIC: &str = "zrpc.GenericError";
    pub const IO: &str = "std.io.Error";
    pub const UTF8: &str = "std.str.Utf8Error";
    pub const PARSE: &str = "std.num.ParseError";
}

impl CallError {
    /// The dotted identifier written into an error response payload.
    ///
    /// `Generic` keeps whatever identifier it was built with, so a foreign
    /// error relayed through a handler keeps its origin.
    pub fn identifier(&self) -> &str {
        match self {
            CallError::NotFound(_) => identifier::NOT_FOUND,
            CallError::InvalidArgs(_) => identifier::INVALID_ARGS,
            CallError::Io(_) => identifier::IO,
            CallError::Utf8(_) => identifier::UTF8,
            CallError::Parse(_) => identifier::PARSE,
            CallError::Generic { identifier, .. } => identifier,
        }
    }

    /// The argument list written next to the identifier.
    pub fn wire_args(&self) -> Vec<Value> {
        match self {
            CallError::NotFound(msg)
            | CallError::InvalidArgs(msg)
            | CallError::Io(msg)
            | CallError::Utf8(msg)
            | CallError::Parse(msg) => vec![Value::String(msg.as_str().into())],
            CallError::Generic { args, .. } => args.clone(),
        }
    }

    /// Build a `Generic` error under the framework's own identifier.
    pub fn generic(args: Vec<Value>) -> Self {
        CallError::Generic {
            identifier: identifier::GENERIC.to_string(),
            args,
        }
    }
}

impl From<std::io::Error> for CallError {
    fn from(err: std::io::Error) -> Self {
        CallError::Io(err.to_string())
    }
}

impl From<std::str::Utf8Error> for CallError {
    fn from(err: std::str::Utf8Error) -> Self {
        CallError::Utf8(err.to_string())
    }
}

impl From<std::num::ParseIntError> for CallError {
    fn from(err: std::num::ParseIntError) -> Self {
        CallError::Parse(err.to_string())
    }
}

impl From<std::num::ParseFloatError> for CallError {
    fn from(err: std::num::ParseFloatError) -> Self {
        CallError::Parse(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Error table
// ---------------------------------------------------------------------------

type Constructor = fn(Vec<Value>) -> CallError;

/// Registry mapping wire identifiers to error constructors.
///
/// Built once at client construction and read-only thereafter.  A lookup
/// miss falls back to [`CallError::Generic`] with the foreign identifier.
pub struct ErrorTable {
    entries: HashMap<&'static str, Constructor>,
}

/// Pull the leading string argument out of a wire argument list.
fn first_arg_message(args: &[Value]) -> String {
    args.first()
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

impl ErrorTable {
    pub fn new() -> Self {
        let mut entries: HashMap<&'static str, Constructor> = HashMap::new();
        entries.insert(identifier::NOT_FOUND, |args| {
            CallError::NotFound(first_arg_message(&args))
        });
        entries.insert(identifier::INVALID_ARGS, |args| {
            CallError::InvalidArgs(first_arg_message(&args))
        });
        entries.insert(identifier::IO, |args| {
            CallError::Io(first_arg_message(&args))
        });
        entries.insert(identifier::UTF8, |args| {
            CallError::Utf8(first_arg_message(&args))
        });
        entries.insert(identifier::PARSE, |args| {
            CallError::Parse(first_arg_message(&args))
        });
        entries.insert(identifier::GENERIC, CallError::generic);
        Self { entries }
    }

    /// Reconstruct a `CallError` from its wire form.
    pub fn translate(&self, identifier: &str, args: Vec<Value>) -> CallError {
        match self.entries.get(identifier) {
            Some(ctor) => ctor(args),
            None => CallError::Generic {
                identifier: identifier.to_string(),
                args,
            },
        }
    }
}

impl Default for ErrorTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
