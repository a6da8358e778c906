//! Signal notifications as readable descriptors
//!
//! Resize (`SIGWINCH`), interrupt (`SIGINT`) and child exit (`SIGCHLD`) are
//! never acted on inside a signal handler. Each signal writes a byte into its
//! own socket pair, and the read side sits in the same poll set as the
//! child's output, so every state change happens on the control loop.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use signal_hook::consts::{SIGCHLD, SIGINT, SIGWINCH};
use signal_hook::low_level::{pipe, unregister};
use signal_hook::SigId;
use tracing::debug;

/// What a notification descriptor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    Resize,
    Interrupt,
    ChildExit,
}

impl Notice {
    const ALL: [(Notice, libc::c_int); 3] = [
        (Notice::Resize, SIGWINCH),
        (Notice::Interrupt, SIGINT),
        (Notice::ChildExit, SIGCHLD),
    ];
}

struct Route {
    notice: Notice,
    receiver: UnixStream,
    id: SigId,
}

/// Installed signal routes. Dropping it unregisters the handlers.
pub struct Notifier {
    routes: Vec<Route>,
}

impl Notifier {
    /// Route resize, interrupt and child-exit signals into descriptors.
    ///
    /// Once installed, an interrupt no longer terminates the process; it is
    /// only reported.
    pub fn install() -> io::Result<Self> {
        let mut routes = Vec::with_capacity(Notice::ALL.len());
        for (notice, signal) in Notice::ALL {
            let (receiver, sender) = UnixStream::pair()?;
            receiver.set_nonblocking(true)?;
            sender.set_nonblocking(true)?;
            let id = pipe::register(signal, sender)?;
            debug!(?notice, signal, "signal routed");
            routes.push(Route {
                notice,
                receiver,
                id,
            });
        }
        Ok(Self { routes })
    }

    /// Descriptors to poll for readability, with what each one reports.
    pub fn descriptors(&self) -> Vec<(Notice, RawFd)> {
        self.routes
            .iter()
            .map(|route| (route.notice, route.receiver.as_raw_fd()))
            .collect()
    }

    /// Consume everything queued for `notice`. Returns whether anything was.
    pub fn take(&self, notice: Notice) -> io::Result<bool> {
        let Some(route) = self.routes.iter().find(|route| route.notice == notice) else {
            return Ok(false);
        };

        let mut receiver = &route.receiver;
        let mut buf = [0u8; 64];
        let mut seen = false;
        loop {
            match receiver.read(&mut buf) {
                Ok(0) => return Ok(seen),
                Ok(_) => seen = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(seen),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serializes tests that raise signals at the whole process.
#[cfg(test)]
pub fn raise_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

impl Drop for Notifier {
    fn drop(&mut self) {
        for route in &self.routes {
            unregister(route.id);
        }
    }
}
