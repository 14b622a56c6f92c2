//! Interface between the server half of the CA library and published variables
//!
//! The library calls a [`Provider`] to resolve names and to serve reads and writes.
//! A provider may answer immediately, or hand back a [`PendingIo`] token and finish
//! the request later through the [`AsyncIoCompleter`] it was given.

use std::{io, os::fd::OwnedFd, sync::Arc, time::Duration};

use crate::{
    dbr::{Dbr, DbrBasicType, DbrType},
    messages::{ErrorCondition, MonitorMask},
};

pub use crate::server::PendingIo;

/// Identifies one provider attached to a [`ServerLibrary`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProviderId(pub u64);

/// Identifies one readable descriptor registered with a [`Multiplexer`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FdRegistration(pub u64);

/// What a client learns about a PV when it attaches
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AttachInfo {
    pub native_type: DbrBasicType,
    pub count: usize,
}

/// Outcome of an asynchronous read or write, posted back to the library
#[derive(Debug, Clone, PartialEq)]
pub enum IoCompletion {
    Read(Result<Dbr, ErrorCondition>),
    Write(Result<(), ErrorCondition>),
    /// The request was abandoned without a result
    Canceled,
}

/// Posts the completion of one deferred request; consumed by use
pub trait AsyncIoCompleter: Send {
    fn post_io_completion(self: Box<Self>, completion: IoCompletion);
}

pub enum ReadReturn {
    Complete(Dbr),
    /// The provider will post an [`IoCompletion::Read`] later
    Pending(PendingIo),
}

pub enum WriteReturn {
    Complete,
    /// The provider will post an [`IoCompletion::Write`] later
    Pending(PendingIo),
}

/// Resolves and serves PVs for the server library
pub trait Provider: Send + Sync {
    /// Does this provider serve the given PV name?
    fn pv_exist_test(&self, name: &str) -> bool;

    fn pv_attach(&self, name: &str) -> Result<AttachInfo, ErrorCondition>;

    /// Read a value in the requested type
    ///
    /// `completer` is only used when [`ReadReturn::Pending`] is returned; otherwise
    /// it is dropped.
    fn read_value(
        &self,
        name: &str,
        requested: DbrType,
        completer: Box<dyn AsyncIoCompleter>,
    ) -> Result<ReadReturn, ErrorCondition>;

    fn write_value(
        &self,
        name: &str,
        value: Dbr,
        completer: Box<dyn AsyncIoCompleter>,
    ) -> Result<WriteReturn, ErrorCondition>;

    /// Convert a posted value for a subscriber that asked for `requested`
    #[allow(unused_variables)]
    fn convert_for_client(
        &self,
        name: &str,
        value: &Dbr,
        requested: DbrType,
    ) -> Result<Dbr, ErrorCondition> {
        value.convert_to(requested)
    }
}

/// The library's I/O wait loop
pub trait Multiplexer: Send + Sync {
    /// Service pending I/O, waiting at most `max_wait` for something to happen
    fn process(&self, max_wait: Duration);

    /// Call `on_readable` from [`Multiplexer::process`] whenever `fd` is readable
    fn register_readable(
        &self,
        fd: OwnedFd,
        on_readable: Box<dyn FnMut() + Send>,
    ) -> io::Result<FdRegistration>;

    fn unregister_readable(&self, registration: FdRegistration);
}

/// The server half of the CA library
pub trait ServerLibrary: Send + Sync {
    fn attach_provider(&self, provider: Arc<dyn Provider>) -> ProviderId;

    /// Detach a provider; channels attached through it are disconnected
    fn detach_provider(&self, provider: ProviderId);

    /// A PV went away; channels attached to it are disconnected
    fn pv_destroyed(&self, provider: ProviderId, name: &str);

    /// Notify subscribers of a value change
    fn post_event(&self, provider: ProviderId, name: &str, mask: MonitorMask, value: Dbr);

    fn multiplexer(self: Arc<Self>) -> Arc<dyn Multiplexer>;
}
