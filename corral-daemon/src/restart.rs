//! Exit-status interpretation.
//!
//! The only place worker exit codes carry meaning. Everything else just
//! reports them.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use corral_protocol::protocol::{EXIT_CODE_FULL_RELOAD, EXIT_CODE_RESTART_AND_EXIT};
use nix::sys::signal::Signal;

/// Signals that end the supervisor along with the worker. `SIGKILL` is not
/// in the set: a heartbeat kill falls through to the restart policy.
pub const FATAL_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

/// How a worker ended: an exit code or a terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    pub fn is_fatal_signal(&self) -> bool {
        self.signal
            .is_some_and(|sig| FATAL_SIGNALS.iter().any(|s| *s as i32 == sig))
    }

    /// Exit code a shell would report for this outcome.
    pub fn shell_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => 1,
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {}", code),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(signal) => write!(f, "signal {}", signal),
                Err(_) => write!(f, "signal {}", sig),
            },
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Whether the supervisor should stop after `exit` instead of respawning.
///
/// Checked in order: a worker that never reported `start` is a startup
/// failure; exit code 0 is deliberate; a fatal signal propagates; the two
/// sentinel codes decide explicitly; anything else follows `auto_restart`.
pub fn should_exit(started: bool, exit: &WorkerExit, auto_restart: bool) -> bool {
    if !started {
        return true;
    }
    if exit.code == Some(0) {
        return true;
    }
    if exit.is_fatal_signal() {
        return true;
    }
    match exit.code {
        Some(EXIT_CODE_FULL_RELOAD) => false,
        Some(EXIT_CODE_RESTART_AND_EXIT) => true,
        _ => !auto_restart,
    }
}

/// End this process the way the worker ended.
///
/// A signal is re-raised with its default disposition so the parent sees
/// the same status; if the process survives that, it exits `128 + signal`.
pub fn exit_like(exit: &WorkerExit) -> ! {
    if let (None, Some(sig)) = (exit.code, exit.signal)
        && let Ok(signal) = Signal::try_from(sig)
    {
        // SAFETY: restoring the default disposition installs no handler code
        unsafe {
            let _ = nix::sys::signal::signal(signal, nix::sys::signal::SigHandler::SigDfl);
        }
        let _ = nix::sys::signal::raise(signal);
    }
    std::process::exit(exit.shell_code())
}
