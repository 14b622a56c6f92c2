//! Deferred reads and writes: the two-sided handshake between library and host
//!
//! When a published variable has a read or write callback, the provider answers
//! the library with a [`PendingIo`] token and hands the host a [`ReadRequest`] or
//! [`WriteRequest`]. Both halves share one [`Handshake`]. Exactly one of these wins
//! the transition out of the pending state:
//! - the host completes or fails the request,
//! - the host drops the request (a cancellation is posted),
//! - the variable is destroyed (a cancellation is posted),
//! - the library drops its token because the client went away (nothing is posted).
//!
//! Whoever loses finds the state already settled and does nothing.

use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
};

use tracing::{debug, trace, warn};

use crate::{
    dbr::{DbrType, DbrValue},
    messages::ErrorCondition,
    provider::{AsyncIoCompleter, IoCompletion},
    server::{ServerError, Variable},
    value::{Value, dbr_value_to_host},
    wakeup::WakeupSender,
};

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELED: u8 = 2;
const ABANDONED: u8 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum IoKind {
    Read,
    Write,
}

pub(crate) struct Handshake {
    kind: IoKind,
    state: AtomicU8,
    completer: Mutex<Option<Box<dyn AsyncIoCompleter>>>,
    wakeup: WakeupSender,
}

impl Handshake {
    pub(crate) fn new(
        kind: IoKind,
        completer: Box<dyn AsyncIoCompleter>,
        wakeup: WakeupSender,
    ) -> Arc<Self> {
        Arc::new(Handshake {
            kind,
            state: AtomicU8::new(PENDING),
            completer: Mutex::new(Some(completer)),
            wakeup,
        })
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Move out of the pending state, taking the completer if we won
    fn claim(&self, next: u8) -> Option<Box<dyn AsyncIoCompleter>> {
        self.state
            .compare_exchange(PENDING, next, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.completer.lock().unwrap().take()
    }

    /// Hand a completion to the library and wake its loop to flush it
    fn post(&self, completer: Box<dyn AsyncIoCompleter>, completion: IoCompletion) {
        completer.post_io_completion(completion);
        if let Err(e) = self.wakeup.wake() {
            warn!("Failed to wake server loop after {:?} completion: {e}", self.kind);
        }
    }

    fn finish(&self, next: u8, completion: IoCompletion) -> bool {
        match self.claim(next) {
            Some(completer) => {
                self.post(completer, completion);
                true
            }
            None => false,
        }
    }

    /// Settle as canceled, posting the cancellation; false if already settled
    pub(crate) fn cancel(&self) -> bool {
        self.finish(CANCELED, IoCompletion::Canceled)
    }

    /// The library side went away first; nothing may be posted any more
    fn abandon(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            let completer = self.completer.lock().unwrap().take();
            drop(completer);
        }
        won
    }
}

impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("kind", &self.kind)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

/// The library's half of a deferred request
///
/// Dropping it tells the host side that nobody is waiting for the answer.
#[derive(Debug)]
pub struct PendingIo {
    handshake: Arc<Handshake>,
}

impl PendingIo {
    pub(crate) fn new(handshake: Arc<Handshake>) -> Self {
        PendingIo { handshake }
    }
    pub fn is_pending(&self) -> bool {
        self.handshake.is_pending()
    }
}

impl Drop for PendingIo {
    fn drop(&mut self) {
        if self.handshake.abandon() {
            debug!("Deferred {:?} abandoned by the library", self.handshake.kind);
        }
    }
}

/// A client read waiting for the host to supply the value
///
/// Dropping the request without completing it cancels the read.
pub struct ReadRequest {
    handshake: Arc<Handshake>,
    variable: Variable,
    requested: DbrType,
}

impl ReadRequest {
    pub(crate) fn new(handshake: Arc<Handshake>, variable: Variable, requested: DbrType) -> Self {
        ReadRequest {
            handshake,
            variable,
            requested,
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    /// The record type the client asked for
    pub fn requested_type(&self) -> DbrType {
        self.requested
    }

    pub fn is_pending(&self) -> bool {
        self.handshake.is_pending()
    }

    /// Answer the read with `value`, converted strictly to the variable's type
    ///
    /// The variable itself is not changed.
    pub fn complete(&self, value: &Value) -> Result<(), ServerError> {
        if !self.is_pending() {
            return Err(ServerError::NotPending);
        }
        let reply = self.variable.reply_with(value, self.requested)?;
        let completer = self
            .handshake
            .claim(COMPLETED)
            .ok_or(ServerError::NotPending)?;
        self.handshake
            .post(completer, IoCompletion::Read(Ok(reply)));
        trace!("Completed deferred read of {}", self.variable.name());
        Ok(())
    }

    /// Answer the read with an error status
    pub fn fail(&self, status: ErrorCondition) -> Result<(), ServerError> {
        if self
            .handshake
            .finish(COMPLETED, IoCompletion::Read(Err(status)))
        {
            Ok(())
        } else {
            Err(ServerError::NotPending)
        }
    }
}

impl Drop for ReadRequest {
    fn drop(&mut self) {
        if self.handshake.cancel() {
            debug!("Deferred read of {} canceled", self.variable.name());
        }
    }
}

impl fmt::Debug for ReadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadRequest")
            .field("variable", &self.variable.name())
            .field("requested", &self.requested)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// A client write waiting for the host to accept it
///
/// Dropping the request without completing it cancels the write.
pub struct WriteRequest {
    handshake: Arc<Handshake>,
    variable: Variable,
    incoming: DbrValue,
    value: Value,
}

impl WriteRequest {
    pub(crate) fn new(handshake: Arc<Handshake>, variable: Variable, incoming: DbrValue) -> Self {
        let value = dbr_value_to_host(&incoming);
        WriteRequest {
            handshake,
            variable,
            incoming,
            value,
        }
    }

    pub fn variable(&self) -> &Variable {
        &self.variable
    }

    /// The value the client is writing, as a host value
    pub fn incoming_value(&self) -> &Value {
        &self.value
    }

    pub fn is_pending(&self) -> bool {
        self.handshake.is_pending()
    }

    /// Accept the write: store the incoming value and report success
    pub fn complete(&self) -> Result<(), ServerError> {
        if !self.is_pending() {
            return Err(ServerError::NotPending);
        }
        let data = self.variable.convert_incoming(&self.incoming)?;
        let completer = self
            .handshake
            .claim(COMPLETED)
            .ok_or(ServerError::NotPending)?;
        self.variable.store(data);
        self.handshake.post(completer, IoCompletion::Write(Ok(())));
        trace!("Completed deferred write of {}", self.variable.name());
        Ok(())
    }

    /// Refuse the write with an error status, leaving the variable unchanged
    pub fn fail(&self, status: ErrorCondition) -> Result<(), ServerError> {
        if self
            .handshake
            .finish(COMPLETED, IoCompletion::Write(Err(status)))
        {
            Ok(())
        } else {
            Err(ServerError::NotPending)
        }
    }
}

impl Drop for WriteRequest {
    fn drop(&mut self) {
        if self.handshake.cancel() {
            debug!("Deferred write of {} canceled", self.variable.name());
        }
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("variable", &self.variable.name())
            .field("incoming", &self.value)
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::wakeup_pair;
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<IoCompletion>>>);

    impl AsyncIoCompleter for Recorder {
        fn post_io_completion(self: Box<Self>, completion: IoCompletion) {
            self.0.lock().unwrap().push(completion);
        }
    }

    fn handshake() -> (Arc<Handshake>, Arc<Mutex<Vec<IoCompletion>>>) {
        let posted = Arc::new(Mutex::new(Vec::new()));
        let (tx, _rx) = wakeup_pair().unwrap();
        let handshake = Handshake::new(IoKind::Read, Box::new(Recorder(posted.clone())), tx);
        (handshake, posted)
    }

    #[test]
    fn cancel_posts_once() {
        let (handshake, posted) = handshake();
        assert!(handshake.cancel());
        assert!(!handshake.cancel());
        assert!(!handshake.finish(COMPLETED, IoCompletion::Write(Ok(()))));
        assert_eq!(posted.lock().unwrap().as_slice(), [IoCompletion::Canceled]);
    }

    #[test]
    fn abandoned_token_suppresses_cancellation() {
        let (handshake, posted) = handshake();
        drop(PendingIo::new(handshake.clone()));
        assert!(!handshake.is_pending());
        assert!(!handshake.cancel());
        assert!(posted.lock().unwrap().is_empty());
    }

    #[test]
    fn token_dropped_after_completion_is_quiet() {
        let (handshake, posted) = handshake();
        let token = PendingIo::new(handshake.clone());
        assert!(handshake.finish(COMPLETED, IoCompletion::Write(Ok(()))));
        assert!(!token.is_pending());
        drop(token);
        assert_eq!(
            posted.lock().unwrap().as_slice(),
            [IoCompletion::Write(Ok(()))]
        );
    }
}
