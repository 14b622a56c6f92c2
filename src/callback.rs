//! Script-facing callbacks and the arguments they are invoked with
//!
//! A [`Callback`] is created on the host thread but travels with queued events, so
//! it must be `Send + Sync`. It is only ever *invoked* on the thread that owns the
//! [`Context`], which is passed in as the first argument.

use std::{fmt, sync::Arc};

use crate::{
    context::Context,
    messages::ErrorCondition,
    server::{ReadRequest, WriteRequest},
    value::{Metadata, Value},
};

/// Error raised by a host callback; it is reported, never propagated
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct CallbackError(pub String);

impl From<String> for CallbackError {
    fn from(value: String) -> Self {
        CallbackError(value)
    }
}
impl From<&str> for CallbackError {
    fn from(value: &str) -> Self {
        CallbackError(value.to_string())
    }
}
impl From<crate::client::ClientError> for CallbackError {
    fn from(value: crate::client::ClientError) -> Self {
        CallbackError(value.to_string())
    }
}
impl From<crate::server::ServerError> for CallbackError {
    fn from(value: crate::server::ServerError) -> Self {
        CallbackError(value.to_string())
    }
}

type CallbackFn<A> = dyn Fn(&Context, A) -> Result<(), CallbackError> + Send + Sync;

/// A host closure to be run from the event pump
pub struct Callback<A>(Arc<CallbackFn<A>>);

impl<A> Callback<A> {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Context, A) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        Callback(Arc::new(f))
    }

    pub(crate) fn invoke(&self, context: &Context, argument: A) -> Result<(), CallbackError> {
        (self.0)(context, argument)
    }
}

impl<A> Clone for Callback<A> {
    fn clone(&self) -> Self {
        Callback(self.0.clone())
    }
}

impl<A> fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

/// A client PV connected or disconnected
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionChange {
    pub name: String,
    pub connected: bool,
}

/// The value and metadata delivered by a get or a monitor update
///
/// On failure `value` is [`Value::Empty`] and `metadata.request_status` says why.
#[derive(Clone, Debug, PartialEq)]
pub struct GetResult {
    pub value: Value,
    pub metadata: Metadata,
}

/// Completion status of a put
#[derive(Clone, Debug, PartialEq)]
pub struct PutResult {
    pub code: ErrorCondition,
}

impl PutResult {
    pub fn message(&self) -> String {
        self.code.message()
    }
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

pub type ConnectionCallback = Callback<ConnectionChange>;
pub type GetCallback = Callback<GetResult>;
pub type PutCallback = Callback<PutResult>;
pub type ReadCallback = Callback<ReadRequest>;
pub type WriteCallback = Callback<WriteRequest>;
