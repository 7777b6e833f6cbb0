//! Process handles and terminal status.
//!
//! A [`ProcessHandle`] is returned from every launch and owns the
//! obligation to reap the child exactly once. Reaping twice is a
//! [`hatch_common::SpawnError::Wait`] error, and a handle that is never
//! waited leaves a zombie until the parent exits. There is no ambient
//! "last child status" anywhere; callers thread the handle themselves.
//! Every wait is per-pid, so independent handles may be waited on
//! concurrently by different threads without one waiter stealing
//! another's status.

use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::debug;

use hatch_common::{SpawnError, SpawnResult};

/// Poll interval for timed waits.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a launched child process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: i32,
    reaped: bool,
}

impl ProcessHandle {
    pub(crate) fn new(pid: i32) -> Self {
        Self { pid, reaped: false }
    }

    /// The child's process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Whether a terminal status has already been reaped.
    pub fn is_reaped(&self) -> bool {
        self.reaped
    }

    /// Block until the child terminates and reap it.
    pub fn wait(&mut self) -> SpawnResult<Status> {
        self.wait_flags(WaitPidFlag::empty())
    }

    /// Block until the child terminates or stops. Stop reports do not reap:
    /// after a [`Terminal::Stopped`] status the handle remains waitable.
    pub fn wait_with_stops(&mut self) -> SpawnResult<Status> {
        self.wait_flags(WaitPidFlag::WUNTRACED)
    }

    /// Non-blocking probe: `Ok(None)` while the child is still running,
    /// the terminal status once it has exited.
    pub fn try_wait(&mut self) -> SpawnResult<Option<Status>> {
        if self.reaped {
            return Err(SpawnError::already_reaped(self.pid));
        }
        match waitpid(Pid::from_raw(self.pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.record(status)?)),
            Err(nix::errno::Errno::ECHILD) => Err(SpawnError::no_such_child(self.pid)),
            Err(e) => Err(SpawnError::resource("waitpid", e.into())),
        }
    }

    /// Wait with a deadline. On timeout the child is untouched and the
    /// handle remains valid; a later wait still reaps normally.
    pub fn wait_timeout(&mut self, timeout: Duration) -> SpawnResult<Option<Status>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(pid = self.pid, "wait timed out; child left running");
                return Ok(None);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Send a signal to the live child. Distinct from waiting; never reaps.
    pub fn kill(&self, signal: Signal) -> SpawnResult<()> {
        kill(Pid::from_raw(self.pid), signal)
            .map_err(|e| SpawnError::resource("kill", e.into()))
    }

    /// Ask the child to terminate gracefully (SIGTERM).
    pub fn terminate(&self) -> SpawnResult<()> {
        self.kill(Signal::SIGTERM)
    }

    /// Force-kill the child (SIGKILL).
    pub fn force_kill(&self) -> SpawnResult<()> {
        self.kill(Signal::SIGKILL)
    }

    fn wait_flags(&mut self, flags: WaitPidFlag) -> SpawnResult<Status> {
        if self.reaped {
            return Err(SpawnError::already_reaped(self.pid));
        }
        match waitpid(Pid::from_raw(self.pid), Some(flags)) {
            Ok(status) => self.record(status),
            Err(nix::errno::Errno::ECHILD) => Err(SpawnError::no_such_child(self.pid)),
            Err(e) => Err(SpawnError::resource("waitpid", e.into())),
        }
    }

    /// Decode a wait status; terminal states consume the reap obligation.
    fn record(&mut self, status: WaitStatus) -> SpawnResult<Status> {
        let terminal = match status {
            WaitStatus::Exited(_, code) => {
                self.reaped = true;
                Terminal::Exited(code)
            }
            WaitStatus::Signaled(_, signal, core_dumped) => {
                self.reaped = true;
                Terminal::Signaled {
                    signal: signal as i32,
                    core_dumped,
                }
            }
            WaitStatus::Stopped(_, signal) => Terminal::Stopped(signal as i32),
            other => {
                return Err(SpawnError::resource(
                    "waitpid",
                    std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("unexpected wait status {other:?}"),
                    ),
                ))
            }
        };
        Ok(Status {
            pid: self.pid,
            terminal,
        })
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            debug!(
                pid = self.pid,
                "process handle dropped without reaping; child may linger as a zombie"
            );
        }
    }
}

/// How a waited-on child ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminal {
    /// Terminated normally with an exit code (0-255).
    Exited(i32),
    /// Killed by a signal.
    Signaled { signal: i32, core_dumped: bool },
    /// Stopped by a signal; only reported when the waiter asked for stop
    /// reports. The child is still alive.
    Stopped(i32),
}

/// Immutable snapshot of a child's state, created only by a successful
/// wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pid: i32,
    terminal: Terminal,
}

impl Status {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn terminal(&self) -> Terminal {
        self.terminal
    }

    /// The exit code, when the child exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self.terminal {
            Terminal::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// The terminating or stopping signal number, when there is one.
    pub fn signal(&self) -> Option<i32> {
        match self.terminal {
            Terminal::Signaled { signal, .. } | Terminal::Stopped(signal) => Some(signal),
            Terminal::Exited(_) => None,
        }
    }

    /// Whether the child dumped core. False for normal exits.
    pub fn core_dumped(&self) -> bool {
        matches!(
            self.terminal,
            Terminal::Signaled {
                core_dumped: true,
                ..
            }
        )
    }

    /// `Some(true)` for exit code zero, `Some(false)` for any other exit
    /// code, and `None` for a signaled or stopped child, which has no exit
    /// code to judge.
    pub fn success(&self) -> Option<bool> {
        self.exit_code().map(|code| code == 0)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.terminal {
            Terminal::Exited(code) => write!(f, "pid {} exit {}", self.pid, code),
            Terminal::Signaled { signal, .. } => {
                write_signal(f, self.pid, signal, "signal")
            }
            Terminal::Stopped(signal) => write_signal(f, self.pid, signal, "stop signal"),
        }
    }
}

/// Render `pid <PID> <SIGNAL-NAME> (signal <N>)`, falling back to the
/// numeric form when the signal has no platform name.
fn write_signal(
    f: &mut std::fmt::Formatter<'_>,
    pid: i32,
    signal: i32,
    label: &str,
) -> std::fmt::Result {
    match Signal::try_from(signal) {
        Ok(sig) => write!(f, "pid {} {} ({} {})", pid, sig.as_str(), label, signal),
        Err(_) => write!(f, "pid {} {} {}", pid, label, signal),
    }
}

/// Non-destructive liveness probe: does a process with this pid exist?
/// Uses `kill(pid, 0)`, which delivers no signal. A permission error means
/// the process exists but belongs to someone else.
pub fn process_exists(pid: i32) -> SpawnResult<bool> {
    match kill(Pid::from_raw(pid), None) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(SpawnError::resource("kill", e.into())),
    }
}
