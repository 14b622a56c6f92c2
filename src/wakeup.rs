//! Self-pipe wakeup for the server event loop
//!
//! The event loop thread sleeps inside the protocol layer's multiplexer. Anything
//! that needs the loop to notice new work (a completed deferred request, a request
//! to stop) writes a byte to the [`WakeupSender`]; the read end is registered with
//! the multiplexer as a readable descriptor and drained when it fires.

use std::{
    io::{self, Read, Write},
    os::{
        fd::{AsFd, OwnedFd},
        unix::net::UnixStream,
    },
    sync::Arc,
};

use tracing::trace;

/// Write end of the wakeup channel, shared between threads
#[derive(Clone, Debug)]
pub struct WakeupSender {
    stream: Arc<UnixStream>,
}

/// Read end of the wakeup channel
#[derive(Debug)]
pub struct WakeupReceiver {
    stream: UnixStream,
}

/// Create a connected, non-blocking wakeup pair
pub fn wakeup_pair() -> io::Result<(WakeupSender, WakeupReceiver)> {
    let (tx, rx) = UnixStream::pair()?;
    tx.set_nonblocking(true)?;
    rx.set_nonblocking(true)?;
    Ok((
        WakeupSender {
            stream: Arc::new(tx),
        },
        WakeupReceiver { stream: rx },
    ))
}

impl WakeupSender {
    /// Write a single byte to wake the loop
    ///
    /// A full buffer already guarantees a pending wakeup, so `WouldBlock` is success.
    pub fn wake(&self) -> io::Result<()> {
        match (&*self.stream).write(&[1u8]) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl WakeupReceiver {
    /// Consume every pending wakeup byte, returning how many were read
    pub fn drain(&mut self) -> usize {
        let mut buffer = [0u8; 64];
        let mut total = 0;
        loop {
            match self.stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        trace!("Wakeup drain stopped: {e}");
                    }
                    break;
                }
            }
        }
        total
    }

    /// A duplicate descriptor of the read end, for registering with a multiplexer
    pub fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.stream.as_fd().try_clone_to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain() {
        let (tx, mut rx) = wakeup_pair().unwrap();
        assert_eq!(rx.drain(), 0);
        tx.wake().unwrap();
        tx.clone().wake().unwrap();
        assert_eq!(rx.drain(), 2);
        assert_eq!(rx.drain(), 0);
    }

    #[test]
    fn full_buffer_is_not_an_error() {
        let (tx, mut rx) = wakeup_pair().unwrap();
        for _ in 0..100_000 {
            tx.wake().unwrap();
        }
        assert!(rx.drain() > 0);
    }
}
