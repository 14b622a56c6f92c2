use std::{fmt, sync::Arc};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    callback::{ConnectionCallback, GetCallback, GetResult, PutCallback, PutResult},
    channel_access::{
        ChannelId, ConnectionHandler, EventArgs, EventHandler, PutHandler, SubscriptionHandler,
    },
    context::{Context, Event},
    dbr::{DbrBasicType, DbrType},
    messages::{ErrorCondition, MonitorMask},
    value::{ConversionError, Metadata, Value, host_to_wire, wire_to_host},
};

/// Handle of one client PV, owned by the [`Context`] that created it
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PvId(pub u64);

impl fmt::Display for PvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pv{}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("No process variable with handle {0}")]
    UnknownPv(PvId),
    #[error("Process variable {0} is not connected")]
    NotConnected(String),
    #[error("{0}")]
    Protocol(#[from] ErrorCondition),
    #[error("{0}")]
    Conversion(#[from] ConversionError),
}

/// Client-side state of one remote PV
pub(crate) struct ClientPv {
    pub name: String,
    pub channel: ChannelId,
    pub connected: bool,
    /// Unknown until the first connection
    pub native_type: Option<DbrBasicType>,
    pub count: usize,
    pub on_connection: Option<ConnectionCallback>,
}

/// The record type requested for gets and monitors of a native type
///
/// Enumerated channels are read as strings so the result carries the state label.
fn request_type(native: DbrBasicType) -> DbrType {
    match native {
        DbrBasicType::Enum => DbrType::time(DbrBasicType::String),
        other => DbrType::time(other),
    }
}

/// Turn a get completion or monitor update into what the callback receives
fn result_from_event(args: EventArgs) -> GetResult {
    let failed = |status| GetResult {
        value: Value::Empty,
        metadata: Metadata::failed(status),
    };
    if !args.status.is_success() {
        return failed(args.status);
    }
    let Some(data) = args.data else {
        return failed(ErrorCondition::GetFail);
    };
    match wire_to_host(args.dbr_type, &data, args.count) {
        Ok((value, metadata)) => GetResult { value, metadata },
        Err(e) => {
            warn!("Could not decode {} result: {e}", args.dbr_type);
            failed(ErrorCondition::NoConvert)
        }
    }
}

impl Context {
    /// Start connecting to a named PV
    ///
    /// `on_connection` runs on every connect or disconnect transition.
    pub fn connect(
        &self,
        name: &str,
        on_connection: Option<ConnectionCallback>,
    ) -> Result<PvId, ClientError> {
        let pv = PvId(self.next_pv.get());
        self.next_pv.set(pv.0 + 1);
        let _span = debug_span!("connect", %pv, pv_name = name).entered();

        let queue = self.queue.clone();
        let handler: ConnectionHandler = Arc::new(move |op| {
            queue.push(Event::Connection { pv, op });
        });
        let channel = self.access.create_channel(name, handler)?;
        self.pvs.borrow_mut().insert(
            pv,
            ClientPv {
                name: name.to_string(),
                channel,
                connected: false,
                native_type: None,
                count: 0,
                on_connection,
            },
        );
        self.access.flush_io()?;
        debug!("Created {channel} for {name}");
        Ok(pv)
    }

    fn with_pv<T>(&self, pv: PvId, f: impl FnOnce(&ClientPv) -> T) -> Result<T, ClientError> {
        self.pvs
            .borrow()
            .get(&pv)
            .map(f)
            .ok_or(ClientError::UnknownPv(pv))
    }

    /// Channel, native type and count of a PV that has connected at least once
    fn native_channel(&self, pv: PvId) -> Result<(ChannelId, DbrBasicType, usize), ClientError> {
        self.with_pv(pv, |entry| {
            entry
                .native_type
                .map(|native| (entry.channel, native, entry.count))
                .ok_or_else(|| ClientError::NotConnected(entry.name.clone()))
        })?
    }

    /// Read the current value once; `callback` receives the value and metadata
    pub fn get(&self, pv: PvId, callback: GetCallback) -> Result<(), ClientError> {
        let (channel, native, count) = self.native_channel(pv)?;
        let dbr_type = request_type(native);
        let queue = self.queue.clone();
        let handler: EventHandler = Box::new(move |args| {
            queue.push(Event::Get {
                pv,
                callback,
                result: result_from_event(args),
                generation: None,
            });
        });
        self.access.array_get(channel, dbr_type, count, handler)?;
        self.access.flush_io()?;
        trace!("Issued {dbr_type} get on {pv}");
        Ok(())
    }

    /// Write a value; it is converted and validated before anything is sent
    ///
    /// Without a callback the completion is discarded by the protocol thread.
    pub fn put(
        &self,
        pv: PvId,
        value: &Value,
        callback: Option<PutCallback>,
    ) -> Result<(), ClientError> {
        let (channel, native, count) = self.native_channel(pv)?;
        let (dbr_type, count, data) = host_to_wire(value, native, count)?;
        let handler = callback.map(|callback| {
            let queue = self.queue.clone();
            Box::new(move |code: ErrorCondition| {
                queue.push(Event::Put {
                    pv,
                    callback,
                    result: PutResult { code },
                });
            }) as PutHandler
        });
        self.access.array_put(channel, dbr_type, count, data, handler)?;
        self.access.flush_io()?;
        trace!("Issued {dbr_type} put on {pv}");
        Ok(())
    }

    /// Replace the monitor of a PV, or clear it with `None`
    ///
    /// The old subscription is cleared before the new one is created, under the
    /// monitor lock, so no update of the old subscription reaches the new callback.
    pub fn monitor(&self, pv: PvId, callback: Option<GetCallback>) -> Result<(), ClientError> {
        let _span = debug_span!("monitor", %pv).entered();
        self.with_pv(pv, |_| ())?;
        let Some(callback) = callback else {
            self.monitors.lock().clear(pv, &*self.access);
            debug!("Monitor cleared");
            return Ok(());
        };
        // A replacement that cannot be issued leaves the old monitor in place
        let (channel, native, count) = self.native_channel(pv)?;
        let mut monitors = self.monitors.lock();
        monitors.clear(pv, &*self.access);
        let generation = monitors.next_generation();

        let queue = self.queue.clone();
        let table = self.monitors.clone();
        let handler: SubscriptionHandler = Arc::new(move |args| {
            let Some(callback) = table.current_callback(pv, generation) else {
                trace!("Discarding update for replaced monitor of {pv}");
                return;
            };
            queue.push(Event::Get {
                pv,
                callback,
                result: result_from_event(args),
                generation: Some(generation),
            });
        });
        let subscription = self.access.create_subscription(
            channel,
            request_type(native),
            count,
            MonitorMask::VALUE,
            handler,
        )?;
        monitors.install(pv, callback, subscription, generation);
        drop(monitors);
        self.access.flush_io()?;
        debug!("Monitor installed, generation {generation}");
        Ok(())
    }

    pub fn has_monitor(&self, pv: PvId) -> Result<bool, ClientError> {
        self.with_pv(pv, |_| self.monitors.has_monitor(pv))
    }

    pub fn pv_name(&self, pv: PvId) -> Result<String, ClientError> {
        self.with_pv(pv, |entry| entry.name.clone())
    }

    pub fn connected(&self, pv: PvId) -> Result<bool, ClientError> {
        self.with_pv(pv, |entry| entry.connected)
    }

    /// Native element count, zero before the first connection
    pub fn element_count(&self, pv: PvId) -> Result<usize, ClientError> {
        self.with_pv(pv, |entry| entry.count)
    }

    pub fn native_type(&self, pv: PvId) -> Result<Option<DbrBasicType>, ClientError> {
        self.with_pv(pv, |entry| entry.native_type)
    }

    /// Native type as CA names it, or `TYPENOTCONN` before the first connection
    pub fn native_type_name(&self, pv: PvId) -> Result<String, ClientError> {
        self.with_pv(pv, |entry| match entry.native_type {
            Some(native) => native.to_string(),
            None => "TYPENOTCONN".to_string(),
        })
    }

    pub fn channel_id(&self, pv: PvId) -> Result<ChannelId, ClientError> {
        self.with_pv(pv, |entry| entry.channel)
    }

    /// Tear down a PV
    ///
    /// Queued events for it are purged and its monitor and channel cleared before the
    /// handle is forgotten; no callback of this PV runs afterwards.
    pub fn destroy(&self, pv: PvId) -> Result<(), ClientError> {
        let (name, channel) = self.with_pv(pv, |entry| (entry.name.clone(), entry.channel))?;
        let _span = debug_span!("destroy", %pv, pv_name = %name).entered();
        let purged = self.queue.purge(|event| event.pv() == Some(pv));
        if !purged.is_empty() {
            debug!("Purged {} queued events", purged.len());
        }
        drop(purged);
        self.monitors.lock().clear(pv, &*self.access);
        if let Err(e) = self.access.clear_channel(channel) {
            warn!("Failed to clear {channel}: {e}");
        }
        self.pvs.borrow_mut().remove(&pv);
        debug!("Destroyed");
        Ok(())
    }

    /// Handles of every live client PV
    pub fn pvs(&self) -> Vec<PvId> {
        let mut pvs: Vec<PvId> = self.pvs.borrow().keys().copied().collect();
        pvs.sort();
        pvs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::{Dbr, DbrValue, Status};
    use std::time::SystemTime;

    #[test]
    fn enum_channels_are_read_as_strings() {
        assert_eq!(
            request_type(DbrBasicType::Enum),
            DbrType::time(DbrBasicType::String)
        );
        assert_eq!(
            request_type(DbrBasicType::Float),
            DbrType::time(DbrBasicType::Float)
        );
    }

    #[test]
    fn failed_events_have_empty_values() {
        let result = result_from_event(EventArgs::failed(
            ErrorCondition::Disconn,
            DbrType::time(DbrBasicType::Double),
            1,
        ));
        assert_eq!(result.value, Value::Empty);
        assert_eq!(result.metadata.request_status, ErrorCondition::Disconn);
        assert_eq!(result.metadata.status, None);
    }

    #[test]
    fn successful_events_carry_metadata() {
        let record = Dbr::Time {
            status: Status {
                status: 7,
                severity: 2,
            },
            timestamp: SystemTime::now(),
            value: DbrValue::String(vec!["On".into()]),
        };
        let (count, data) = record.to_bytes(None).unwrap();
        let result = result_from_event(EventArgs {
            status: ErrorCondition::Normal,
            dbr_type: record.data_type(),
            count,
            data: Some(data),
        });
        assert_eq!(result.value, Value::from("On"));
        assert_eq!(result.metadata.status, Some(7));
        assert_eq!(result.metadata.severity, Some(2));
        assert!(result.metadata.time.is_some());
    }
}
