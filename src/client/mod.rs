#[allow(clippy::module_inception)]
mod client;
mod subscription;

pub use client::{ClientError, PvId};
pub(crate) use client::ClientPv;
pub(crate) use subscription::MonitorTable;
