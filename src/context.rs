//! The host-thread side of the bridge: event queue, dispatch, and background errors
//!
//! A [`Context`] belongs to exactly one thread. Protocol threads never touch it; they
//! construct an [`Event`] that owns its payload and push it to the context's queue.
//! The owning thread drains the queue with [`Context::process_events`] (or one of
//! the async helpers built on it) and every callback runs there.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    marker::PhantomData,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use tracing::{debug, error, trace, warn};

use crate::{
    callback::{
        CallbackError, ConnectionChange, GetCallback, GetResult, PutCallback, PutResult,
        ReadCallback, WriteCallback,
    },
    channel_access::{ChannelAccess, ConnectionOp},
    client::{ClientPv, MonitorTable, PvId},
    queue::EventQueue,
    server::{ReadRequest, VariableId, WriteRequest},
};

/// One unit of work crossing from a protocol thread to the owning thread
pub(crate) enum Event {
    Connection {
        pv: PvId,
        op: ConnectionOp,
    },
    /// A get completion, or a monitor update when `generation` is set
    Get {
        pv: PvId,
        callback: GetCallback,
        result: GetResult,
        generation: Option<u64>,
    },
    Put {
        pv: PvId,
        callback: PutCallback,
        result: PutResult,
    },
    Read {
        variable: VariableId,
        callback: ReadCallback,
        request: ReadRequest,
    },
    Write {
        variable: VariableId,
        callback: WriteCallback,
        request: WriteRequest,
    },
}

impl Event {
    pub(crate) fn pv(&self) -> Option<PvId> {
        match self {
            Event::Connection { pv, .. } | Event::Get { pv, .. } | Event::Put { pv, .. } => {
                Some(*pv)
            }
            _ => None,
        }
    }
    pub(crate) fn variable(&self) -> Option<VariableId> {
        match self {
            Event::Read { variable, .. } | Event::Write { variable, .. } => Some(*variable),
            _ => None,
        }
    }
}

type ErrorHandler = Box<dyn Fn(&str, &CallbackError)>;

/// Owner of client PVs and dispatcher of every callback, bound to one thread
pub struct Context {
    pub(crate) access: Arc<dyn ChannelAccess>,
    pub(crate) queue: EventQueue<Event>,
    pub(crate) pvs: RefCell<HashMap<PvId, ClientPv>>,
    pub(crate) next_pv: Cell<u64>,
    pub(crate) monitors: MonitorTable,
    error_handler: RefCell<ErrorHandler>,
    _not_send: PhantomData<Rc<()>>,
}

impl Context {
    pub fn new(access: Arc<dyn ChannelAccess>) -> Self {
        Context {
            access,
            queue: EventQueue::new(),
            pvs: RefCell::new(HashMap::new()),
            next_pv: Cell::new(1),
            monitors: MonitorTable::default(),
            error_handler: RefCell::new(Box::new(|context, err| {
                error!("Error in {context}: {err}");
            })),
            _not_send: PhantomData,
        }
    }

    /// Replace the handler that receives errors raised by callbacks
    pub fn set_background_error_handler<F>(&self, handler: F)
    where
        F: Fn(&str, &CallbackError) + 'static,
    {
        *self.error_handler.borrow_mut() = Box::new(handler);
    }

    pub(crate) fn report_background_error(&self, context: &str, err: &CallbackError) {
        (self.error_handler.borrow())(context, err);
    }

    fn report(&self, context: &str, outcome: Result<(), CallbackError>) {
        if let Err(err) = outcome {
            self.report_background_error(context, &err);
        }
    }

    /// Number of events queued and not yet dispatched
    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Dispatch every event queued at the time of the call
    ///
    /// Events queued by the callbacks themselves wait for the next call. Returns the
    /// number of callbacks that were run.
    pub fn process_events(&self) -> usize {
        let pending = self.queue.len();
        let mut dispatched = 0;
        for _ in 0..pending {
            let Some(event) = self.queue.pop() else {
                break;
            };
            if self.dispatch(event) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Wait until an event is queued, without dispatching it
    pub async fn wait_for_event(&self) {
        self.queue.wait().await
    }

    /// Pump events until `predicate` holds or `timeout` expires
    ///
    /// Returns whether the predicate was satisfied.
    pub async fn run_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
    where
        F: FnMut(&Context) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.process_events();
            if predicate(self) {
                return true;
            }
            if tokio::time::timeout_at(deadline, self.queue.wait())
                .await
                .is_err()
            {
                self.process_events();
                return predicate(self);
            }
        }
    }

    fn dispatch(&self, event: Event) -> bool {
        match event {
            Event::Connection { pv, op } => {
                let (name, callback) = {
                    let mut pvs = self.pvs.borrow_mut();
                    let Some(entry) = pvs.get_mut(&pv) else {
                        trace!("Dropping connection event for destroyed {pv}");
                        return false;
                    };
                    match op {
                        ConnectionOp::Up => {
                            entry.connected = true;
                            entry.native_type = self.access.field_type(entry.channel);
                            entry.count = self.access.element_count(entry.channel);
                            debug!(
                                "{} connected: {:?} x{}",
                                entry.name, entry.native_type, entry.count
                            );
                        }
                        ConnectionOp::Down => {
                            entry.connected = false;
                            debug!("{} disconnected", entry.name);
                        }
                    }
                    (entry.name.clone(), entry.on_connection.clone())
                };
                let Some(callback) = callback else {
                    return false;
                };
                let connected = op == ConnectionOp::Up;
                self.report(
                    "epics connection callback script",
                    callback.invoke(self, ConnectionChange { name, connected }),
                );
                true
            }
            Event::Get {
                pv,
                callback,
                result,
                generation,
            } => {
                if !self.pvs.borrow().contains_key(&pv) {
                    trace!("Dropping get result for destroyed {pv}");
                    return false;
                }
                let context = match generation {
                    Some(generation) => {
                        if !self.monitors.is_current(pv, generation) {
                            trace!("Dropping stale monitor update for {pv}");
                            return false;
                        }
                        "epics monitor callback script"
                    }
                    None => "epics get callback script",
                };
                self.report(context, callback.invoke(self, result));
                true
            }
            Event::Put {
                pv,
                callback,
                result,
            } => {
                if !self.pvs.borrow().contains_key(&pv) {
                    trace!("Dropping put result for destroyed {pv}");
                    return false;
                }
                self.report("epics put callback script", callback.invoke(self, result));
                true
            }
            Event::Read {
                variable,
                callback,
                request,
            } => {
                if request.variable().is_destroyed() {
                    trace!("Dropping read request for destroyed variable {variable}");
                    return false;
                }
                self.report(
                    "epics read request callback script",
                    callback.invoke(self, request),
                );
                true
            }
            Event::Write {
                variable,
                callback,
                request,
            } => {
                if request.variable().is_destroyed() {
                    trace!("Dropping write request for destroyed variable {variable}");
                    return false;
                }
                self.report(
                    "epics write request callback script",
                    callback.invoke(self, request),
                );
                true
            }
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let pvs: Vec<PvId> = self.pvs.borrow().keys().copied().collect();
        for pv in pvs {
            if let Err(e) = self.destroy(pv) {
                warn!("Failed to tear down {pv}: {e}");
            }
        }
        // Anything left references server variables; dropping cancels it
        drop(self.queue.purge(|_| true));
    }
}
