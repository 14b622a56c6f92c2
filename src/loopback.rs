//! An in-process Channel Access fabric
//!
//! [`Loopback`] implements the client API, the server library, and its multiplexer,
//! connecting client channels straight to providers attached in the same process.
//! There is no wire framing; records are still encoded to and decoded from their
//! big-endian form so clients see exactly what a network peer would send.
//!
//! Client requests behave like network traffic and wake a waiting multiplexer pass.
//! Work originating on the server side (posted value changes, completions of deferred
//! requests) is queued without waking anyone, and is only flushed by the next pass;
//! servers use their wakeup descriptor to make that pass happen promptly.

use std::{
    collections::{HashMap, VecDeque},
    io,
    num::NonZeroUsize,
    os::fd::OwnedFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{Interest, unix::AsyncFd},
    runtime::Runtime,
    sync::Notify,
    task::JoinHandle,
};
use tracing::{debug, debug_span, error, trace, warn};

use crate::{
    channel_access::{
        ChannelAccess, ChannelId, ConnectionHandler, ConnectionOp, EventArgs, EventHandler,
        PutHandler, SubscriptionHandler, SubscriptionId,
    },
    dbr::{Dbr, DbrBasicType, DbrType},
    messages::{ErrorCondition, MonitorMask},
    provider::{
        AsyncIoCompleter, FdRegistration, IoCompletion, Multiplexer, PendingIo, Provider,
        ProviderId, ReadReturn, ServerLibrary, WriteReturn,
    },
    utils::{get_default_search_period, wrapping_inplace_add},
};

pub struct LoopbackBuilder {
    search_period: Duration,
}

impl Default for LoopbackBuilder {
    fn default() -> Self {
        LoopbackBuilder {
            search_period: get_default_search_period(),
        }
    }
}

impl LoopbackBuilder {
    pub fn new() -> Self {
        LoopbackBuilder::default()
    }

    /// How often unresolved channels are searched for again
    pub fn search_period(mut self, period: Duration) -> Self {
        self.search_period = period;
        self
    }

    pub fn build(self) -> io::Result<Arc<Loopback>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("asynca-loopback-io")
            .enable_all()
            .build()?;
        Ok(Arc::new(Loopback {
            runtime: Some(runtime),
            fabric: Arc::new(Fabric {
                state: Mutex::new(FabricState::default()),
                notify: Notify::new(),
                search_period: self.search_period,
            }),
        }))
    }
}

enum Link {
    Unresolved,
    Connected(ProviderId),
}

struct Channel {
    name: String,
    on_connection: ConnectionHandler,
    link: Link,
    /// Last known native type and count; kept across disconnects
    native: Option<DbrBasicType>,
    count: usize,
}

struct Subscription {
    channel: ChannelId,
    dbr_type: DbrType,
    count: usize,
    mask: MonitorMask,
    handler: SubscriptionHandler,
}

/// Where the answer to a provider read or write goes
enum Sink {
    Get {
        handler: EventHandler,
        dbr_type: DbrType,
        count: usize,
    },
    Update(SubscriptionId),
    Put(Option<PutHandler>),
}

impl Sink {
    /// The sink's owner went away before an answer arrived
    fn disconnect(self, fabric: &Fabric) {
        fabric.deliver(self, IoCompletion::Read(Err(ErrorCondition::Disconn)));
    }
}

/// A request handed to a provider and not yet answered
struct Outstanding {
    channel: ChannelId,
    token: Option<PendingIo>,
    sink: Sink,
}

enum Job {
    Get {
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        handler: EventHandler,
    },
    Put {
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        data: Vec<u8>,
        handler: Option<PutHandler>,
    },
    InitialUpdate(SubscriptionId),
    Completion {
        io: u64,
        completion: IoCompletion,
    },
    Post {
        provider: ProviderId,
        name: String,
        value: Dbr,
        targets: Vec<SubscriptionId>,
    },
}

impl Job {
    fn channel(&self) -> Option<ChannelId> {
        match self {
            Job::Get { channel, .. } | Job::Put { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

type ReadableCallback = Arc<Mutex<Box<dyn FnMut() + Send>>>;

struct Readable {
    ready: Arc<AtomicBool>,
    callback: ReadableCallback,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct FabricState {
    next_id: u64,
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
    channels: HashMap<ChannelId, Channel>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Client submissions; these wake the multiplexer
    network: VecDeque<Job>,
    /// Server-side work; flushed on the next pass only
    internal: VecDeque<Job>,
    readables: HashMap<FdRegistration, Readable>,
    outstanding: HashMap<u64, Outstanding>,
}

impl FabricState {
    fn next_id(&mut self) -> u64 {
        wrapping_inplace_add(&mut self.next_id)
    }

    /// Provider and name serving a connected channel
    fn route(&self, channel: ChannelId) -> Option<(Arc<dyn Provider>, String)> {
        let entry = self.channels.get(&channel)?;
        let Link::Connected(provider) = entry.link else {
            return None;
        };
        let provider = self.providers.get(&provider)?.clone();
        Some((provider, entry.name.clone()))
    }

    /// Mark matching channels unresolved, taking what they leave behind
    fn disconnect_where(&mut self, matches: impl Fn(ProviderId, &Channel) -> bool) -> Orphans {
        let mut orphans = Orphans::default();
        for (id, channel) in self.channels.iter_mut() {
            let Link::Connected(provider) = channel.link else {
                continue;
            };
            if matches(provider, channel) {
                channel.link = Link::Unresolved;
                orphans.handlers.push(channel.on_connection.clone());
                orphans.channels.push(*id);
            }
        }
        let ios: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, o)| orphans.channels.contains(&o.channel))
            .map(|(io, _)| *io)
            .collect();
        orphans.outstanding = ios
            .iter()
            .filter_map(|io| self.outstanding.remove(io))
            .collect();
        orphans
    }
}

/// Leftovers of disconnected channels, released with no lock held
#[derive(Default)]
struct Orphans {
    channels: Vec<ChannelId>,
    handlers: Vec<ConnectionHandler>,
    outstanding: Vec<Outstanding>,
}

struct Fabric {
    state: Mutex<FabricState>,
    notify: Notify,
    search_period: Duration,
}

/// Posts completions of deferred requests back onto the fabric
struct LoopbackCompleter {
    io: u64,
    fabric: Weak<Fabric>,
}

impl AsyncIoCompleter for LoopbackCompleter {
    fn post_io_completion(self: Box<Self>, completion: IoCompletion) {
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };
        trace!("Queued completion of io {}", self.io);
        fabric
            .state
            .lock()
            .unwrap()
            .internal
            .push_back(Job::Completion {
                io: self.io,
                completion,
            });
    }
}

/// Turn a provider's answer into what a client handler receives
fn encode(record: Result<Dbr, ErrorCondition>, dbr_type: DbrType, count: usize) -> EventArgs {
    let record = match record {
        Ok(record) if record.data_type() == dbr_type => record,
        Ok(record) => match record.convert_to(dbr_type) {
            Ok(record) => record,
            Err(e) => return EventArgs::failed(e, dbr_type, count),
        },
        Err(e) => return EventArgs::failed(e, dbr_type, count),
    };
    match record.to_bytes(NonZeroUsize::new(count)) {
        Ok((count, data)) => EventArgs {
            status: ErrorCondition::Normal,
            dbr_type,
            count,
            data: Some(data),
        },
        Err(e) => {
            debug!("Cannot send {dbr_type} record: {e}");
            EventArgs::failed(ErrorCondition::BadType, dbr_type, count)
        }
    }
}

impl Fabric {
    fn wake(&self) {
        self.notify.notify_waiters();
    }

    fn has_network_work(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.network.is_empty() || state.readables.values().any(|r| r.ready.load(Ordering::Acquire))
    }

    fn has_unresolved(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.providers.is_empty()
            && state
                .channels
                .values()
                .any(|c| matches!(c.link, Link::Unresolved))
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.has_network_work() {
            return;
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
    }

    fn run_readables(&self) {
        let ready: Vec<ReadableCallback> = {
            let state = self.state.lock().unwrap();
            state
                .readables
                .values()
                .filter(|r| r.ready.swap(false, Ordering::AcqRel))
                .map(|r| r.callback.clone())
                .collect()
        };
        for callback in ready {
            (callback.lock().unwrap())();
        }
    }

    fn run_jobs(self: &Arc<Self>) {
        let jobs: Vec<Job> = {
            let mut state = self.state.lock().unwrap();
            let mut jobs: Vec<Job> = state.network.drain(..).collect();
            jobs.extend(state.internal.drain(..));
            jobs
        };
        for job in jobs {
            self.run_job(job);
        }
    }

    fn run_job(self: &Arc<Self>, job: Job) {
        match job {
            Job::Get {
                channel,
                dbr_type,
                count,
                handler,
            } => self.read(
                channel,
                dbr_type,
                Sink::Get {
                    handler,
                    dbr_type,
                    count,
                },
            ),
            Job::InitialUpdate(subscription) => {
                let target = {
                    let state = self.state.lock().unwrap();
                    state
                        .subscriptions
                        .get(&subscription)
                        .map(|s| (s.channel, s.dbr_type))
                };
                if let Some((channel, dbr_type)) = target {
                    self.read(channel, dbr_type, Sink::Update(subscription));
                }
            }
            Job::Put {
                channel,
                dbr_type,
                count,
                data,
                handler,
            } => self.write(channel, dbr_type, count, data, handler),
            Job::Completion { io, completion } => self.complete(io, completion),
            Job::Post {
                provider,
                name,
                value,
                targets,
            } => self.post(provider, &name, &value, &targets),
        }
    }

    /// Record a request about to go to a provider, returning its io id
    fn begin(&self, channel: ChannelId, sink: Sink) -> u64 {
        let mut state = self.state.lock().unwrap();
        let io = state.next_id();
        state.outstanding.insert(
            io,
            Outstanding {
                channel,
                token: None,
                sink,
            },
        );
        io
    }

    fn completer(self: &Arc<Self>, io: u64) -> Box<dyn AsyncIoCompleter> {
        Box::new(LoopbackCompleter {
            io,
            fabric: Arc::downgrade(self),
        })
    }

    /// Keep the provider's token until the deferred request is answered
    fn park(&self, io: u64, token: PendingIo) {
        let mut state = self.state.lock().unwrap();
        match state.outstanding.get_mut(&io) {
            Some(outstanding) => outstanding.token = Some(token),
            None => {
                drop(state);
                // Answered already, or its channel went away meanwhile
                drop(token);
            }
        }
    }

    fn read(self: &Arc<Self>, channel: ChannelId, dbr_type: DbrType, sink: Sink) {
        let route = self.state.lock().unwrap().route(channel);
        let Some((provider, name)) = route else {
            sink.disconnect(self);
            return;
        };
        let io = self.begin(channel, sink);
        match provider.read_value(&name, dbr_type, self.completer(io)) {
            Ok(ReadReturn::Complete(record)) => self.complete(io, IoCompletion::Read(Ok(record))),
            Ok(ReadReturn::Pending(token)) => {
                trace!("Read of {name} deferred as io {io}");
                self.park(io, token);
            }
            Err(e) => self.complete(io, IoCompletion::Read(Err(e))),
        }
    }

    fn write(
        self: &Arc<Self>,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        data: Vec<u8>,
        handler: Option<PutHandler>,
    ) {
        let route = self.state.lock().unwrap().route(channel);
        let Some((provider, name)) = route else {
            Sink::Put(handler).disconnect(self);
            return;
        };
        let record = match Dbr::from_bytes(dbr_type, count, &data) {
            Ok(record) => record,
            Err(e) => {
                warn!("Could not decode {dbr_type} put to {name}: {e}");
                self.deliver(Sink::Put(handler), IoCompletion::Write(Err(ErrorCondition::BadType)));
                return;
            }
        };
        let io = self.begin(channel, Sink::Put(handler));
        match provider.write_value(&name, record, self.completer(io)) {
            Ok(WriteReturn::Complete) => self.complete(io, IoCompletion::Write(Ok(()))),
            Ok(WriteReturn::Pending(token)) => {
                trace!("Write of {name} deferred as io {io}");
                self.park(io, token);
            }
            Err(e) => self.complete(io, IoCompletion::Write(Err(e))),
        }
    }

    fn complete(&self, io: u64, completion: IoCompletion) {
        let outstanding = self.state.lock().unwrap().outstanding.remove(&io);
        let Some(outstanding) = outstanding else {
            trace!("Completion of io {io} has nobody waiting");
            return;
        };
        drop(outstanding.token);
        self.deliver(outstanding.sink, completion);
    }

    /// Call a client handler with an answer; no lock may be held
    fn deliver(&self, sink: Sink, completion: IoCompletion) {
        match sink {
            Sink::Get {
                handler,
                dbr_type,
                count,
            } => handler(self.read_args(completion, dbr_type, count)),
            Sink::Update(subscription) => {
                let target = {
                    let state = self.state.lock().unwrap();
                    state
                        .subscriptions
                        .get(&subscription)
                        .map(|s| (s.handler.clone(), s.dbr_type, s.count))
                };
                if let Some((handler, dbr_type, count)) = target {
                    handler(self.read_args(completion, dbr_type, count));
                }
            }
            Sink::Put(handler) => {
                let status = match completion {
                    IoCompletion::Write(Ok(())) => ErrorCondition::Normal,
                    IoCompletion::Write(Err(e)) | IoCompletion::Read(Err(e)) => e,
                    IoCompletion::Canceled => ErrorCondition::PutFail,
                    IoCompletion::Read(Ok(_)) => ErrorCondition::Internal,
                };
                if let Some(handler) = handler {
                    handler(status);
                }
            }
        }
    }

    fn read_args(&self, completion: IoCompletion, dbr_type: DbrType, count: usize) -> EventArgs {
        match completion {
            IoCompletion::Read(record) => encode(record, dbr_type, count),
            IoCompletion::Canceled => EventArgs::failed(ErrorCondition::GetFail, dbr_type, count),
            IoCompletion::Write(_) => EventArgs::failed(ErrorCondition::Internal, dbr_type, count),
        }
    }

    fn post(&self, provider_id: ProviderId, name: &str, value: &Dbr, targets: &[SubscriptionId]) {
        let (provider, handlers) = {
            let state = self.state.lock().unwrap();
            let Some(provider) = state.providers.get(&provider_id).cloned() else {
                return;
            };
            let handlers: Vec<_> = targets
                .iter()
                .filter_map(|id| state.subscriptions.get(id))
                .map(|s| (s.handler.clone(), s.dbr_type, s.count))
                .collect();
            (provider, handlers)
        };
        for (handler, dbr_type, count) in handlers {
            let converted = provider.convert_for_client(name, value, dbr_type);
            handler(encode(converted, dbr_type, count));
        }
    }

    /// Try to resolve every unresolved channel against the attached providers
    fn search(&self) {
        let (unresolved, mut providers) = {
            let state = self.state.lock().unwrap();
            let unresolved: Vec<(ChannelId, String)> = state
                .channels
                .iter()
                .filter(|(_, c)| matches!(c.link, Link::Unresolved))
                .map(|(id, c)| (*id, c.name.clone()))
                .collect();
            let providers: Vec<(ProviderId, Arc<dyn Provider>)> = state
                .providers
                .iter()
                .map(|(id, p)| (*id, p.clone()))
                .collect();
            (unresolved, providers)
        };
        if unresolved.is_empty() || providers.is_empty() {
            return;
        }
        providers.sort_by_key(|(id, _)| id.0);
        for (channel, name) in unresolved {
            for (provider_id, provider) in &providers {
                if !provider.pv_exist_test(&name) {
                    continue;
                }
                match provider.pv_attach(&name) {
                    Ok(info) => {
                        self.connect(channel, *provider_id, info.native_type, info.count);
                        break;
                    }
                    Err(e) => debug!("Attaching {name} failed: {e}"),
                }
            }
        }
    }

    fn connect(&self, channel: ChannelId, provider: ProviderId, native: DbrBasicType, count: usize) {
        let handler = {
            let mut state = self.state.lock().unwrap();
            if !state.providers.contains_key(&provider) {
                return;
            }
            let Some(entry) = state.channels.get_mut(&channel) else {
                return;
            };
            if !matches!(entry.link, Link::Unresolved) {
                return;
            }
            entry.link = Link::Connected(provider);
            entry.native = Some(native);
            entry.count = count;
            debug!("{channel} connected to {} as {native} x{count}", entry.name);
            let handler = entry.on_connection.clone();
            let updates: Vec<SubscriptionId> = state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.channel == channel)
                .map(|(id, _)| *id)
                .collect();
            state
                .network
                .extend(updates.into_iter().map(Job::InitialUpdate));
            handler
        };
        handler(ConnectionOp::Up);
    }

    fn release(&self, orphans: Orphans) {
        let Orphans {
            handlers,
            outstanding,
            ..
        } = orphans;
        let sinks: Vec<Sink> = outstanding
            .into_iter()
            .map(|o| {
                drop(o.token);
                o.sink
            })
            .collect();
        for sink in sinks {
            sink.disconnect(self);
        }
        for handler in handlers {
            handler(ConnectionOp::Down);
        }
    }
}

/// See the [module documentation](self)
pub struct Loopback {
    runtime: Option<Runtime>,
    fabric: Arc<Fabric>,
}

impl Loopback {
    pub fn new() -> io::Result<Arc<Loopback>> {
        LoopbackBuilder::new().build()
    }

    fn submit(&self, channel: ChannelId, job: Job) -> Result<(), ErrorCondition> {
        {
            let mut state = self.fabric.state.lock().unwrap();
            let entry = state
                .channels
                .get(&channel)
                .ok_or(ErrorCondition::BadChId)?;
            if !matches!(entry.link, Link::Connected(_)) {
                return Err(ErrorCondition::DisconnChid);
            }
            state.network.push_back(job);
        }
        self.fabric.wake();
        Ok(())
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl ChannelAccess for Loopback {
    fn create_channel(
        &self,
        name: &str,
        on_connection: ConnectionHandler,
    ) -> Result<ChannelId, ErrorCondition> {
        if name.is_empty() {
            return Err(ErrorCondition::BadStr);
        }
        let channel = {
            let mut state = self.fabric.state.lock().unwrap();
            let channel = ChannelId(state.next_id());
            state.channels.insert(
                channel,
                Channel {
                    name: name.to_string(),
                    on_connection,
                    link: Link::Unresolved,
                    native: None,
                    count: 0,
                },
            );
            channel
        };
        trace!("Searching for {name} as {channel}");
        self.fabric.wake();
        Ok(channel)
    }

    fn clear_channel(&self, channel: ChannelId) -> Result<(), ErrorCondition> {
        let _span = debug_span!("clear_channel", %channel).entered();
        let (entry, subscriptions, outstanding, jobs) = {
            let mut state = self.fabric.state.lock().unwrap();
            let entry = state
                .channels
                .remove(&channel)
                .ok_or(ErrorCondition::BadChId)?;
            let subscription_ids: Vec<SubscriptionId> = state
                .subscriptions
                .iter()
                .filter(|(_, s)| s.channel == channel)
                .map(|(id, _)| *id)
                .collect();
            let subscriptions: Vec<Subscription> = subscription_ids
                .iter()
                .filter_map(|id| state.subscriptions.remove(id))
                .collect();
            let ios: Vec<u64> = state
                .outstanding
                .iter()
                .filter(|(_, o)| o.channel == channel)
                .map(|(io, _)| *io)
                .collect();
            let outstanding: Vec<Outstanding> = ios
                .iter()
                .filter_map(|io| state.outstanding.remove(io))
                .collect();
            let (jobs, kept): (VecDeque<Job>, VecDeque<Job>) = state
                .network
                .drain(..)
                .partition(|job| job.channel() == Some(channel));
            state.network = kept;
            (entry, subscriptions, outstanding, jobs)
        };
        debug!(
            "Cleared {} with {} subscriptions, {} outstanding requests and {} queued requests",
            entry.name,
            subscriptions.len(),
            outstanding.len(),
            jobs.len()
        );
        drop((entry, subscriptions, outstanding, jobs));
        Ok(())
    }

    fn field_type(&self, channel: ChannelId) -> Option<DbrBasicType> {
        let state = self.fabric.state.lock().unwrap();
        state.channels.get(&channel).and_then(|c| c.native)
    }

    fn element_count(&self, channel: ChannelId) -> usize {
        let state = self.fabric.state.lock().unwrap();
        state.channels.get(&channel).map_or(0, |c| c.count)
    }

    fn array_get(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        on_complete: EventHandler,
    ) -> Result<(), ErrorCondition> {
        self.submit(
            channel,
            Job::Get {
                channel,
                dbr_type,
                count,
                handler: on_complete,
            },
        )
    }

    fn array_put(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        data: Vec<u8>,
        on_complete: Option<PutHandler>,
    ) -> Result<(), ErrorCondition> {
        self.submit(
            channel,
            Job::Put {
                channel,
                dbr_type,
                count,
                data,
                handler: on_complete,
            },
        )
    }

    fn create_subscription(
        &self,
        channel: ChannelId,
        dbr_type: DbrType,
        count: usize,
        mask: MonitorMask,
        handler: SubscriptionHandler,
    ) -> Result<SubscriptionId, ErrorCondition> {
        let (subscription, connected) = {
            let mut state = self.fabric.state.lock().unwrap();
            let connected = matches!(
                state
                    .channels
                    .get(&channel)
                    .ok_or(ErrorCondition::BadChId)?
                    .link,
                Link::Connected(_)
            );
            let subscription = SubscriptionId(state.next_id());
            state.subscriptions.insert(
                subscription,
                Subscription {
                    channel,
                    dbr_type,
                    count,
                    mask,
                    handler,
                },
            );
            if connected {
                state.network.push_back(Job::InitialUpdate(subscription));
            }
            (subscription, connected)
        };
        if connected {
            self.fabric.wake();
        }
        trace!("Subscribed to {channel} as {subscription:?}");
        Ok(subscription)
    }

    fn clear_subscription(&self, subscription: SubscriptionId) -> Result<(), ErrorCondition> {
        let removed = self
            .fabric
            .state
            .lock()
            .unwrap()
            .subscriptions
            .remove(&subscription);
        match removed {
            Some(_) => Ok(()),
            None => Err(ErrorCondition::BadMonId),
        }
    }

    fn flush_io(&self) -> Result<(), ErrorCondition> {
        Ok(())
    }
}

impl ServerLibrary for Loopback {
    fn attach_provider(&self, provider: Arc<dyn Provider>) -> ProviderId {
        let id = {
            let mut state = self.fabric.state.lock().unwrap();
            let id = ProviderId(state.next_id());
            state.providers.insert(id, provider);
            id
        };
        debug!("Attached provider {id:?}");
        self.fabric.wake();
        id
    }

    fn detach_provider(&self, provider: ProviderId) {
        let orphans = {
            let mut state = self.fabric.state.lock().unwrap();
            if state.providers.remove(&provider).is_none() {
                return;
            }
            state.disconnect_where(|p, _| p == provider)
        };
        debug!(
            "Detached provider {provider:?}, disconnecting {} channels",
            orphans.channels.len()
        );
        self.fabric.release(orphans);
    }

    fn pv_destroyed(&self, provider: ProviderId, name: &str) {
        let orphans = self
            .fabric
            .state
            .lock()
            .unwrap()
            .disconnect_where(|p, c| p == provider && c.name == name);
        if !orphans.channels.is_empty() {
            debug!("{name} destroyed, disconnecting {} channels", orphans.channels.len());
        }
        self.fabric.release(orphans);
    }

    fn post_event(&self, provider: ProviderId, name: &str, mask: MonitorMask, value: Dbr) {
        let mut state = self.fabric.state.lock().unwrap();
        let targets: Vec<SubscriptionId> = state
            .subscriptions
            .iter()
            .filter(|(_, s)| mask.intersects(&s.mask))
            .filter(|(_, s)| {
                state.channels.get(&s.channel).is_some_and(|c| {
                    c.name == name && matches!(c.link, Link::Connected(p) if p == provider)
                })
            })
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            return;
        }
        state.internal.push_back(Job::Post {
            provider,
            name: name.to_string(),
            value,
            targets,
        });
    }

    fn multiplexer(self: Arc<Self>) -> Arc<dyn Multiplexer> {
        self
    }
}

impl Multiplexer for Loopback {
    fn process(&self, max_wait: Duration) {
        let max_wait = if self.fabric.has_unresolved() {
            max_wait.min(self.fabric.search_period)
        } else {
            max_wait
        };
        if let Some(runtime) = &self.runtime {
            runtime.block_on(self.fabric.wait_for_work(max_wait));
        }
        self.fabric.run_readables();
        self.fabric.run_jobs();
        self.fabric.search();
    }

    fn register_readable(
        &self,
        fd: OwnedFd,
        on_readable: Box<dyn FnMut() + Send>,
    ) -> io::Result<FdRegistration> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| io::Error::other("Loopback runtime has shut down"))?;
        let fd = {
            let _guard = runtime.enter();
            AsyncFd::with_interest(fd, Interest::READABLE)?
        };
        let ready = Arc::new(AtomicBool::new(false));
        let fabric = Arc::downgrade(&self.fabric);
        let flag = ready.clone();
        let task = runtime.spawn(async move {
            loop {
                let mut guard = match fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Waiting on registered descriptor failed: {e}");
                        break;
                    }
                };
                guard.clear_ready();
                flag.store(true, Ordering::Release);
                let Some(fabric) = fabric.upgrade() else {
                    break;
                };
                fabric.wake();
            }
        });
        let registration = {
            let mut state = self.fabric.state.lock().unwrap();
            let registration = FdRegistration(state.next_id());
            state.readables.insert(
                registration,
                Readable {
                    ready,
                    callback: Arc::new(Mutex::new(on_readable)),
                    task,
                },
            );
            registration
        };
        trace!("Registered readable descriptor {registration:?}");
        Ok(registration)
    }

    fn unregister_readable(&self, registration: FdRegistration) {
        let removed = self
            .fabric
            .state
            .lock()
            .unwrap()
            .readables
            .remove(&registration);
        if let Some(readable) = removed {
            readable.task.abort();
            trace!("Unregistered readable descriptor {registration:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dbr::{DbrValue, Status},
        provider::AttachInfo,
        wakeup::wakeup_pair,
    };
    use std::{sync::mpsc, time::SystemTime};

    /// Serves one read-only long named "answer"
    struct Answer;

    impl Provider for Answer {
        fn pv_exist_test(&self, name: &str) -> bool {
            name == "answer"
        }
        fn pv_attach(&self, _name: &str) -> Result<AttachInfo, ErrorCondition> {
            Ok(AttachInfo {
                native_type: DbrBasicType::Long,
                count: 1,
            })
        }
        fn read_value(
            &self,
            _name: &str,
            requested: DbrType,
            _completer: Box<dyn AsyncIoCompleter>,
        ) -> Result<ReadReturn, ErrorCondition> {
            let record = Dbr::Time {
                status: Status::default(),
                timestamp: SystemTime::now(),
                value: DbrValue::Long(vec![42]),
            };
            Ok(ReadReturn::Complete(record.convert_to(requested)?))
        }
        fn write_value(
            &self,
            _name: &str,
            _value: Dbr,
            _completer: Box<dyn AsyncIoCompleter>,
        ) -> Result<WriteReturn, ErrorCondition> {
            Err(ErrorCondition::NoWtAccess)
        }
    }

    fn pump(fabric: &Loopback) {
        for _ in 0..3 {
            fabric.process(Duration::from_millis(1));
        }
    }

    #[test]
    fn channels_resolve_against_providers() {
        let fabric = Loopback::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let channel = fabric
            .create_channel("answer", Arc::new(move |op| tx.send(op).unwrap()))
            .unwrap();
        assert_eq!(fabric.field_type(channel), None);
        assert_eq!(
            fabric.array_get(
                channel,
                DbrType::time(DbrBasicType::Long),
                1,
                Box::new(|_| ())
            ),
            Err(ErrorCondition::DisconnChid)
        );

        let provider = fabric.attach_provider(Arc::new(Answer));
        pump(&fabric);
        assert_eq!(rx.try_recv(), Ok(ConnectionOp::Up));
        assert_eq!(fabric.field_type(channel), Some(DbrBasicType::Long));
        assert_eq!(fabric.element_count(channel), 1);

        fabric.detach_provider(provider);
        assert_eq!(rx.try_recv(), Ok(ConnectionOp::Down));
        assert_eq!(fabric.field_type(channel), Some(DbrBasicType::Long));
    }

    #[test]
    fn gets_and_puts_reach_the_provider() {
        let fabric = Loopback::new().unwrap();
        fabric.attach_provider(Arc::new(Answer));
        let channel = fabric.create_channel("answer", Arc::new(|_| ())).unwrap();
        pump(&fabric);

        let (tx, rx) = mpsc::channel();
        fabric
            .array_get(
                channel,
                DbrType::time(DbrBasicType::Double),
                1,
                Box::new(move |args| tx.send(args).unwrap()),
            )
            .unwrap();
        pump(&fabric);
        let args = rx.try_recv().unwrap();
        assert_eq!(args.status, ErrorCondition::Normal);
        let record = Dbr::from_bytes(args.dbr_type, args.count, &args.data.unwrap()).unwrap();
        assert_eq!(record.value(), &DbrValue::Double(vec![42.0]));

        let (tx, rx) = mpsc::channel();
        let (_, data) = DbrValue::Long(vec![1]).to_bytes(None);
        fabric
            .array_put(
                channel,
                DbrType::new(DbrBasicType::Long, crate::dbr::DbrCategory::Basic),
                1,
                data,
                Some(Box::new(move |status| tx.send(status).unwrap())),
            )
            .unwrap();
        pump(&fabric);
        assert_eq!(rx.try_recv(), Ok(ErrorCondition::NoWtAccess));
    }

    #[test]
    fn cleared_channels_hear_nothing_more() {
        let fabric = Loopback::new().unwrap();
        fabric.attach_provider(Arc::new(Answer));
        let channel = fabric.create_channel("answer", Arc::new(|_| ())).unwrap();
        pump(&fabric);
        fabric
            .array_get(
                channel,
                DbrType::time(DbrBasicType::Long),
                1,
                Box::new(|_| panic!("cleared channel was answered")),
            )
            .unwrap();
        fabric.clear_channel(channel).unwrap();
        pump(&fabric);
        assert_eq!(fabric.clear_channel(channel), Err(ErrorCondition::BadChId));
    }

    #[test]
    fn subscriptions_get_an_initial_update() {
        let fabric = Loopback::new().unwrap();
        let channel = fabric.create_channel("answer", Arc::new(|_| ())).unwrap();
        let (tx, rx) = mpsc::channel();
        let subscription = fabric
            .create_subscription(
                channel,
                DbrType::time(DbrBasicType::Long),
                1,
                MonitorMask::VALUE,
                Arc::new(move |args| tx.send(args.status).unwrap()),
            )
            .unwrap();
        fabric.attach_provider(Arc::new(Answer));
        pump(&fabric);
        assert_eq!(rx.try_recv(), Ok(ErrorCondition::Normal));
        fabric.clear_subscription(subscription).unwrap();
        assert_eq!(
            fabric.clear_subscription(subscription),
            Err(ErrorCondition::BadMonId)
        );
    }

    #[test]
    fn readable_descriptors_wake_a_pass() {
        let fabric = Loopback::new().unwrap();
        let (wakeup, mut receiver) = wakeup_pair().unwrap();
        let (tx, rx) = mpsc::channel();
        let registration = fabric
            .register_readable(
                receiver.try_clone_fd().unwrap(),
                Box::new(move || tx.send(receiver.drain()).unwrap()),
            )
            .unwrap();
        wakeup.wake().unwrap();
        let started = std::time::Instant::now();
        while rx.try_recv().is_err() {
            assert!(started.elapsed() < Duration::from_secs(5), "never woke");
            fabric.process(Duration::from_secs(1));
        }
        fabric.unregister_readable(registration);
    }
}
