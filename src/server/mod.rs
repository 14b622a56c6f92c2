//! Publishing variables to Channel Access clients
//!
//! A [`Server`] owns a registry of published [`Variable`]s and registers itself with
//! a [`ServerLibrary`] as the [`Provider`] resolving their names. Reads and writes
//! arriving from clients are served directly from the stored value unless the
//! variable has a read or write callback, in which case the request is deferred to
//! the owning [`Context`] as a [`ReadRequest`] or [`WriteRequest`].
//!
//! ```
//! # use asynca::{Context, loopback::Loopback, server::ServerBuilder, value::Value};
//! let fabric = Loopback::new().unwrap();
//! let context = Context::new(fabric.clone());
//! let server = context.start_server(ServerBuilder::new(fabric)).unwrap();
//! let variable = server.publish("test:value", Some("double"), None).unwrap();
//! variable.write(&Value::Double(3.14)).unwrap();
//! assert_eq!(variable.read(), Value::Double(3.14));
//! ```

mod async_io;
mod event_loop;
mod variable;

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tracing::{debug, info, info_span, trace, warn};

pub use async_io::{PendingIo, ReadRequest, WriteRequest};
pub use event_loop::LoopPolicy;
pub use variable::{DisplayProperties, PvData, ScalarType, Variable, VariableId};

use crate::{
    context::{Context, Event},
    dbr::{Dbr, DbrType},
    messages::{ErrorCondition, MonitorMask},
    provider::{
        AsyncIoCompleter, AttachInfo, FdRegistration, Multiplexer, Provider, ProviderId,
        ReadReturn, ServerLibrary, WriteReturn,
    },
    queue::EventQueue,
    utils::{get_default_loop_period, get_default_loop_policy},
    value::ConversionError,
    wakeup::{WakeupSender, wakeup_pair},
};
use async_io::IoKind;
use event_loop::LoopHandle;

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("Process variable {0} already exists in this server")]
    AlreadyExists(String),
    #[error("Wrong data type {0}")]
    UnknownType(String),
    #[error("Wrong count {0}, must be >= 1")]
    InvalidCount(i64),
    #[error("Unimplemented vector put for {0} items, must be 1")]
    VectorWrite(usize),
    #[error("Process variable {0} has been destroyed")]
    Destroyed(String),
    #[error("Request has already been completed or canceled")]
    NotPending,
    #[error("Process variable {0} is not an enum")]
    NotEnum(String),
    #[error("Invalid enum labels: {0}")]
    InvalidEnumTable(String),
    #[error("{0}")]
    Protocol(#[from] ErrorCondition),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
}

impl ServerError {
    /// The status reported to a client whose write failed with this error
    fn client_status(&self) -> ErrorCondition {
        match self {
            ServerError::Protocol(status) => *status,
            ServerError::Destroyed(_) => ErrorCondition::DisconnChid,
            _ => ErrorCondition::NoConvert,
        }
    }
}

/// State shared between a [`Server`], its variables, and the library
pub(crate) struct ServerShared {
    alive: AtomicBool,
    registry: Mutex<HashMap<String, Variable>>,
    library: Arc<dyn ServerLibrary>,
    provider_id: OnceLock<ProviderId>,
    wakeup: WakeupSender,
    events: EventQueue<Event>,
}

impl ServerShared {
    fn lookup(&self, name: &str) -> Result<Variable, ErrorCondition> {
        self.registry
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(ErrorCondition::DisconnChid)
    }

    pub(crate) fn wakeup_sender(&self) -> WakeupSender {
        self.wakeup.clone()
    }

    fn wake(&self) {
        if let Err(e) = self.wakeup.wake() {
            warn!("Failed to wake server loop: {e}");
        }
    }

    /// Tell subscribed clients about a new value, and wake the loop to send it
    pub(crate) fn post_value_change(&self, name: &str, mask: MonitorMask, record: Dbr) {
        let Some(id) = self.provider_id.get() else {
            return;
        };
        self.library.post_event(*id, name, mask, record);
        self.wake();
    }

    /// Drop a destroyed variable from the registry, unless the server is shutting down
    pub(crate) fn forget(&self, variable: &Variable) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        let mut registry = self.registry.lock().unwrap();
        if registry.get(variable.name()) == Some(variable) {
            registry.remove(variable.name());
        }
    }

    /// Take queued requests for a variable off the host queue
    #[must_use]
    pub(crate) fn purge_requests(&self, variable: VariableId) -> Vec<Event> {
        self.events.purge(|event| event.variable() == Some(variable))
    }

    /// Disconnect clients attached to a destroyed variable
    pub(crate) fn detach_clients(&self, variable: &Variable) {
        if let Some(id) = self.provider_id.get() {
            self.library.pv_destroyed(*id, variable.name());
        }
    }
}

impl Provider for ServerShared {
    fn pv_exist_test(&self, name: &str) -> bool {
        self.alive.load(Ordering::Acquire) && self.registry.lock().unwrap().contains_key(name)
    }

    fn pv_attach(&self, name: &str) -> Result<AttachInfo, ErrorCondition> {
        let variable = self.lookup(name)?;
        Ok(AttachInfo {
            native_type: variable.scalar_type().native_type(),
            count: variable.count(),
        })
    }

    fn read_value(
        &self,
        name: &str,
        requested: DbrType,
        completer: Box<dyn AsyncIoCompleter>,
    ) -> Result<ReadReturn, ErrorCondition> {
        let variable = self.lookup(name)?;
        let Some(callback) = variable.read_callback() else {
            return Ok(ReadReturn::Complete(variable.current_record(requested)?));
        };
        let handshake = variable.begin_io(IoKind::Read, completer)?;
        trace!("Deferring {requested} read of {name}");
        self.events.push(Event::Read {
            variable: variable.id(),
            callback,
            request: ReadRequest::new(handshake.clone(), variable, requested),
        });
        Ok(ReadReturn::Pending(PendingIo::new(handshake)))
    }

    fn write_value(
        &self,
        name: &str,
        value: Dbr,
        completer: Box<dyn AsyncIoCompleter>,
    ) -> Result<WriteReturn, ErrorCondition> {
        let variable = self.lookup(name)?;
        let Some(callback) = variable.write_callback() else {
            let data = variable
                .convert_incoming(value.value())
                .map_err(|e| e.client_status())?;
            variable.store(data);
            return Ok(WriteReturn::Complete);
        };
        let handshake = variable.begin_io(IoKind::Write, completer)?;
        trace!("Deferring write of {name}");
        self.events.push(Event::Write {
            variable: variable.id(),
            callback,
            request: WriteRequest::new(handshake.clone(), variable, value.take_value()),
        });
        Ok(WriteReturn::Pending(PendingIo::new(handshake)))
    }

    fn convert_for_client(
        &self,
        name: &str,
        value: &Dbr,
        requested: DbrType,
    ) -> Result<Dbr, ErrorCondition> {
        match self.lookup(name) {
            Ok(variable) => variable.convert_posted(value, requested),
            Err(_) => value.convert_to(requested),
        }
    }
}

/// Configure and start a [`Server`]
///
/// ```
/// # use std::time::Duration;
/// # use asynca::{Context, loopback::Loopback, server::{LoopPolicy, ServerBuilder}};
/// let fabric = Loopback::new().unwrap();
/// let context = Context::new(fabric.clone());
/// let server = ServerBuilder::new(fabric)
///     .loop_policy(LoopPolicy::PerServer)
///     .loop_period(Duration::from_secs(1))
///     .start(&context)
///     .unwrap();
/// ```
pub struct ServerBuilder {
    library: Arc<dyn ServerLibrary>,
    loop_policy: LoopPolicy,
    loop_period: Duration,
}

impl ServerBuilder {
    pub fn new(library: Arc<dyn ServerLibrary>) -> ServerBuilder {
        ServerBuilder {
            library,
            loop_policy: get_default_loop_policy(),
            loop_period: get_default_loop_period(),
        }
    }

    pub fn loop_policy(mut self, policy: LoopPolicy) -> ServerBuilder {
        self.loop_policy = policy;
        self
    }

    /// The longest the loop waits in one pass when nothing wakes it
    pub fn loop_period(mut self, period: Duration) -> ServerBuilder {
        self.loop_period = period;
        self
    }

    /// Start serving, delivering deferred requests to `context`
    pub fn start(self, context: &Context) -> Result<Server, ServerError> {
        let _span = info_span!("server_start", policy = %self.loop_policy).entered();
        let (wakeup, mut receiver) = wakeup_pair()?;
        let mux = self.library.clone().multiplexer();
        let registration = mux.register_readable(
            receiver.try_clone_fd()?,
            Box::new(move || {
                let drained = receiver.drain();
                trace!("Server loop woken ({drained} bytes)");
            }),
        )?;

        let shared = Arc::new(ServerShared {
            alive: AtomicBool::new(true),
            registry: Mutex::new(HashMap::new()),
            library: self.library.clone(),
            provider_id: OnceLock::new(),
            wakeup,
            events: context.queue.clone(),
        });
        let provider_id = self.library.attach_provider(shared.clone());
        // `shared` was created above, so nothing else can have set the id
        let first_attach = shared.provider_id.set(provider_id).is_ok();
        debug_assert!(first_attach, "provider attached twice");

        let event_loop = match LoopHandle::acquire(self.loop_policy, mux.clone(), self.loop_period)
        {
            Ok(handle) => handle,
            Err(e) => {
                mux.unregister_readable(registration);
                self.library.detach_provider(provider_id);
                return Err(e.into());
            }
        };
        info!("Server started");
        Ok(Server {
            shared,
            mux,
            registration,
            event_loop: Some(event_loop),
        })
    }
}

impl Context {
    /// Start a server whose deferred requests are dispatched by this context
    pub fn start_server(&self, builder: ServerBuilder) -> Result<Server, ServerError> {
        builder.start(self)
    }
}

/// A running server; dropping it destroys every variable it published
pub struct Server {
    shared: Arc<ServerShared>,
    mux: Arc<dyn Multiplexer>,
    registration: FdRegistration,
    event_loop: Option<LoopHandle>,
}

impl Server {
    /// Publish a new variable, by default a single `double`
    pub fn publish(
        &self,
        name: &str,
        scalar_type: Option<&str>,
        count: Option<i64>,
    ) -> Result<Variable, ServerError> {
        let scalar_type: ScalarType = scalar_type
            .map(str::parse)
            .transpose()?
            .unwrap_or_default();
        let count = count.unwrap_or(1);
        if count < 1 {
            return Err(ServerError::InvalidCount(count));
        }
        let count = usize::try_from(count).map_err(|_| ServerError::InvalidCount(count))?;

        let mut registry = self.shared.registry.lock().unwrap();
        if registry.contains_key(name) {
            return Err(ServerError::AlreadyExists(name.to_string()));
        }
        let variable = Variable::new(name, scalar_type, count, Arc::downgrade(&self.shared));
        registry.insert(name.to_string(), variable.clone());
        drop(registry);
        info!("Published {name} as {scalar_type}[{count}]");
        self.shared.wake();
        Ok(variable)
    }

    pub fn find(&self, name: &str) -> Option<Variable> {
        self.shared.registry.lock().unwrap().get(name).cloned()
    }

    /// Every published variable, by name
    pub fn list_all(&self) -> BTreeMap<String, Variable> {
        self.shared
            .registry
            .lock()
            .unwrap()
            .iter()
            .map(|(name, variable)| (name.clone(), variable.clone()))
            .collect()
    }

    pub fn destroy(self) {
        drop(self);
    }

    fn shutdown(&mut self) {
        if !self.shared.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        let _span = info_span!("server_stop").entered();
        let variables: Vec<Variable> = self
            .shared
            .registry
            .lock()
            .unwrap()
            .drain()
            .map(|(_, variable)| variable)
            .collect();
        debug!("Destroying {} variables", variables.len());
        for variable in variables {
            variable.destroy();
        }
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.release(&self.shared.wakeup);
        }
        self.mux.unregister_readable(self.registration);
        if let Some(id) = self.shared.provider_id.get() {
            self.shared.library.detach_provider(*id);
        }
        info!("Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
