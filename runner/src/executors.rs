pub mod local;
pub mod trial;

use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// could not create the output files of one trial, fatal to that trial only
    #[error("failed to prepare trial files in {path}")]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn trial command")]
    Spawn(#[source] std::io::Error),
    #[error("failed to wait for a child process")]
    Wait(#[source] std::io::Error),
    #[error("interrupted before completion")]
    Interrupted,
}

// set by the signal handler, checked once per dispatcher tick
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// route SIGINT and SIGTERM into the dispatcher poll loop
pub fn install_interrupt_handler() {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );

    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // async-signal-safe: the handler only stores an atomic flag
        if let Err(error) = unsafe { sigaction(signal, &action) } {
            warn!(?signal, ?error, "Failed to install interrupt handler");
        }
    }
}

/// Shared between the dispatcher loop and its worker threads: the
/// cancellation flag and the pids of all live trial children, so an
/// interrupt can reach every child before the process exits.
#[derive(Debug, Default)]
pub struct RunMonitor {
    cancelled: AtomicBool,
    children: Mutex<BTreeMap<usize, u32>>,
}

impl RunMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slot: usize, pid: u32) {
        self.children.lock().insert(slot, pid);

        // a cancel that raced this registration has already swept the
        // table, catch up on its behalf
        if self.cancelled() {
            force_kill(slot, pid);
        }
    }

    pub fn clear(&self, slot: usize) {
        self.children.lock().remove(&slot);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// flag cancellation, then force every live child down
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        for (slot, pid) in self.children.lock().iter() {
            force_kill(*slot, *pid);
        }
    }
}

fn force_kill(slot: usize, pid: u32) {
    debug!(slot, pid, "Killing child on cancellation");

    if let Err(error) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(slot, pid, ?error, "Failed to deliver SIGKILL");
    }
}
