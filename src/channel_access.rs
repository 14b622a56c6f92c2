//! The client half of the Channel Access library, as the bridge consumes it
//!
//! Implementations deliver every handler on their own threads. A handler is never
//! invoked from inside the call that registered it, so callers may hold their own
//! locks while registering.

use std::{fmt, sync::Arc};

use crate::{
    dbr::{DbrBasicType, DbrType},
    messages::{ErrorCondition, MonitorMask},
};

/// Opaque protocol-layer identifier of one client channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chid:{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionOp {
    Up,
    Down,
}

/// Arguments of a get completion or subscription update
///
/// `data` holds the raw big-endian record of `dbr_type` and is only present when
/// `status` is a success.
#[derive(Debug, Clone, PartialEq)]
pub struct EventArgs {
    pub status: ErrorCondition,
    pub dbr_type: DbrType,
    pub count: usize,
    pub data: Option<Vec<u8>>,
}

impl EventArgs {
    pub fn failed(status: ErrorCondition, dbr_type: DbrType, count: usize) -> Self {
        EventArgs {
            status,
            dbr_type,
            count,
            data: None,
        }
    }
}

pub type ConnectionHandler = Arc<dyn Fn(ConnectionOp) + Send + Sync>;
pub type EventHandler = Box<dyn FnOnce(EventArgs) + Send>;
pub type PutHandler = Box<dyn FnOnce(ErrorCondition) + Send>;
pub type SubscriptionHandler = Arc<dyn Fn(EventArgs) + Send + Sync>;

/// Client-side Channel Access operations
pub trait ChannelAccess: Send + Sync {
    /// Start searching for a channel; `on_connection` fires on every transition
    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelId, ErrorCondition>;

    /// Tear down a channel, its subscriptions, and any outstanding requests
    ///
    /// No handler registered against the channel fires once this returns.
    fn clear_channel(&self, channel: ChannelId) -> Result<(), ErrorCondition>;

    /// Native type of a connected channel
    fn field_type(&self, channel: ChannelId) -> Option<DbrBasicType>;

    /// Native element count, or zero when never connected
    fn element_count(&self, channel: ChannelId) -> usize;

    fn array_get(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        on_complete: EventHandler,
    ) -> Result<(), ErrorCondition>;

    /// Write a raw record; without a handler the put is fire-and-forget
    fn array_put(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        data: Vec<u8>,
        on_complete: Option<PutHandler>,
    ) -> Result<(), ErrorCondition>;

    fn create_subscription(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        mask: MonitorMask,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionId, ErrorCondition>;

    fn clear_subscription(&self, subscription: SubscriptionId) -> Result<(), ErrorCondition>;

    /// Push any buffered requests out
    fn flush_io(&self) -> Result<(), ErrorCondition>;
}
