//! Threads that drive a server library's multiplexer
//!
//! Servers either share one loop per multiplexer or each run their own. The loop
//! thread stops between two calls to [`Multiplexer::process`], so a stop request
//! is followed by a wakeup to cut the current wait short.

use std::{
    collections::HashMap,
    fmt,
    str::FromStr,
    sync::{Arc, LazyLock, Mutex},
    thread::JoinHandle,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{provider::Multiplexer, wakeup::WakeupSender};

/// How servers of one process share event loop threads
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LoopPolicy {
    /// One loop per multiplexer, shared by every server using it
    #[default]
    Shared,
    /// A dedicated loop for each server
    PerServer,
}

impl fmt::Display for LoopPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoopPolicy::Shared => "shared",
            LoopPolicy::PerServer => "per-server",
        })
    }
}

impl FromStr for LoopPolicy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(LoopPolicy::Shared),
            "per-server" => Ok(LoopPolicy::PerServer),
            other => Err(format!("Unknown loop policy '{other}'")),
        }
    }
}

pub(crate) struct EventLoopThread {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventLoopThread {
    fn spawn(mux: Arc<dyn Multiplexer>, period: Duration) -> std::io::Result<Self> {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let handle = std::thread::Builder::new()
            .name("asynca-server-loop".to_string())
            .spawn(move || {
                trace!("Server loop started");
                while !token.is_cancelled() {
                    mux.process(period);
                }
                trace!("Server loop stopped");
            })?;
        Ok(EventLoopThread { stop, handle })
    }

    fn stop(self, wakeup: &WakeupSender) {
        self.stop.cancel();
        if let Err(e) = wakeup.wake() {
            warn!("Could not wake server loop to stop it: {e}");
        }
        if self.handle.thread().id() == std::thread::current().id() {
            // Stopping from inside the loop; it exits after this pass
            return;
        }
        if self.handle.join().is_err() {
            error!("Server loop thread panicked");
        }
    }
}

struct SharedLoop {
    users: usize,
    thread: EventLoopThread,
}

fn mux_key(mux: &Arc<dyn Multiplexer>) -> usize {
    Arc::as_ptr(mux) as *const () as usize
}

static SHARED_LOOPS: LazyLock<Mutex<HashMap<usize, SharedLoop>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// A server's claim on a loop thread, returned by [`LoopHandle::release`]
pub(crate) enum LoopHandle {
    Shared { key: usize },
    Dedicated(EventLoopThread),
}

impl LoopHandle {
    pub fn acquire(
        policy: LoopPolicy,
        mux: Arc<dyn Multiplexer>,
        period: Duration,
    ) -> std::io::Result<Self> {
        match policy {
            LoopPolicy::PerServer => {
                debug!("Starting dedicated server loop");
                Ok(LoopHandle::Dedicated(EventLoopThread::spawn(mux, period)?))
            }
            LoopPolicy::Shared => {
                let key = mux_key(&mux);
                let mut loops = SHARED_LOOPS.lock().unwrap();
                if let Some(shared) = loops.get_mut(&key) {
                    shared.users += 1;
                    trace!("Joined shared server loop, {} users", shared.users);
                } else {
                    debug!("Starting shared server loop");
                    let thread = EventLoopThread::spawn(mux, period)?;
                    loops.insert(key, SharedLoop { users: 1, thread });
                }
                Ok(LoopHandle::Shared { key })
            }
        }
    }

    /// Give up the claim; the last user of a shared loop stops it
    pub fn release(self, wakeup: &WakeupSender) {
        match self {
            LoopHandle::Dedicated(thread) => thread.stop(wakeup),
            LoopHandle::Shared { key } => {
                let finished = {
                    let mut loops = SHARED_LOOPS.lock().unwrap();
                    match loops.get_mut(&key) {
                        Some(shared) if shared.users > 1 => {
                            shared.users -= 1;
                            trace!("Left shared server loop, {} users", shared.users);
                            None
                        }
                        Some(_) => loops.remove(&key),
                        None => None,
                    }
                };
                if let Some(shared) = finished {
                    debug!("Stopping shared server loop");
                    shared.thread.stop(wakeup);
                }
            }
        }
    }
}
