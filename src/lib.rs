// #![warn(missing_docs)]

//! Bridge EPICS Channel Access client and server events into a single-threaded host.
//!
//! Channel Access libraries call back from their own threads: connection changes,
//! get and put completions, monitor updates, and requests from remote clients for
//! values this process serves. Hosts that run their scripts on one thread (an
//! interpreter, a UI loop) cannot be called from those threads. This crate moves every
//! such callback onto the thread owning a [`Context`] as an owned event, and runs the
//! host's [`Callback`] there when the host pumps the queue.
//!
//! The crate is split into:
//!
//! - The protocol-facing traits: [`channel_access::ChannelAccess`] for the client half
//!   of a CA library, and [`provider::ServerLibrary`], [`provider::Provider`] and
//!   [`provider::Multiplexer`] for the server half.
//! - Representing data on the wire (["DBR" types]) in module [dbr], and status codes
//!   in module [messages].
//! - Host values and conversion to and from the wire in module [value].
//! - The client operations on [`Context`]: connect, get, put, monitor.
//! - A [`Server`] publishing [`server::Variable`]s, whose reads and writes can be
//!   deferred to host callbacks and completed later.
//! - [`loopback::Loopback`], an in-process fabric implementing every protocol trait,
//!   so a client and a server in one process can talk without a network.
//!
//! ## Example
//!
//! Publish a variable and read it back through a client channel:
//!
//! ```
//! # use std::{sync::{Arc, Mutex}, time::Duration};
//! use asynca::{
//!     Callback, Context, ServerBuilder, callback::GetResult, loopback::Loopback, value::Value,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let fabric = Loopback::new().unwrap();
//!     let context = Context::new(fabric.clone());
//!     let server = context.start_server(ServerBuilder::new(fabric)).unwrap();
//!     server
//!         .publish("test:value", Some("double"), None)
//!         .unwrap()
//!         .write(&Value::Double(3.14))
//!         .unwrap();
//!
//!     let pv = context.connect("test:value", None).unwrap();
//!     assert!(context.run_until(Duration::from_secs(5), |c| c.connected(pv).unwrap()).await);
//!
//!     let seen = Arc::new(Mutex::new(None));
//!     let sink = seen.clone();
//!     context
//!         .get(pv, Callback::new(move |_, result: GetResult| {
//!             *sink.lock().unwrap() = Some(result.value);
//!             Ok(())
//!         }))
//!         .unwrap();
//!     context
//!         .run_until(Duration::from_secs(5), |_| seen.lock().unwrap().is_some())
//!         .await;
//!     assert_eq!(seen.lock().unwrap().take(), Some(Value::Double(3.14)));
//! }
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod callback;
pub mod channel_access;
pub mod client;
mod context;
pub mod dbr;
pub mod loopback;
pub mod messages;
pub mod provider;
mod queue;
pub mod server;
mod utils;
pub mod value;
pub mod wakeup;

pub use crate::callback::{Callback, CallbackError};
pub use crate::client::{ClientError, PvId};
pub use crate::context::Context;
pub use crate::server::{Server, ServerBuilder, ServerError};
pub use crate::utils::{get_default_loop_period, get_default_loop_policy, get_default_search_period};
