//! # Hatch Spawn
//!
//! Process-spawn configuration and execution engine.
//!
//! Given a command (argument vector or shell string) and a set of launch
//! options, this crate computes a deterministic launch plan covering
//! descriptor redirections, environment overrides, working directory,
//! umask, resource limits and process-group placement, then executes it as
//! a child process and returns a [`ProcessHandle`] for waiting and status
//! inspection.
//!
//! The pieces assemble into an immutable [`LaunchRequest`]:
//!
//! ```no_run
//! use hatch_spawn::{Command, LaunchRequest, Source, spawn};
//!
//! let request = LaunchRequest::builder(Command::argv(["sh", "-c", "echo hi"]))
//!     .env("GREETING", "hello")
//!     .redirect(1, Source::write_to("/tmp/out"))
//!     .build()
//!     .unwrap();
//! let mut handle = spawn(request).unwrap();
//! let status = handle.wait().unwrap();
//! println!("{status}");
//! ```
//!
//! Unix only.

#[cfg(not(unix))]
compile_error!("hatch-spawn targets Unix platforms only");

pub mod command;
pub mod env;
pub mod handle;
pub mod launcher;
pub mod options;
pub mod redirect;
pub mod request;

pub use command::Command;
pub use env::EnvPlan;
pub use handle::{process_exists, ProcessHandle, Status, Terminal};
pub use launcher::spawn;
pub use options::{
    parse_rlimit_key, parse_rlimit_value, LaunchOptions, Pgroup, ResourceLimit, ResourceName,
};
pub use redirect::{RedirOp, Redirections, Source};
pub use request::{LaunchRequest, LaunchRequestBuilder};

pub use hatch_common::{ChildStep, ErrorKind, SpawnError, SpawnResult, WaitErrorReason};
