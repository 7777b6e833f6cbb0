//! Shared helpers for the spawn integration tests.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};

/// A plain (non-cloexec) pipe, so the write end is inheritable by spawned
/// children unless the engine closes it.
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe: {}", std::io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

/// Consume the read end of a pipe to EOF.
pub fn read_to_end(fd: OwnedFd) -> String {
    let mut out = String::new();
    File::from(fd)
        .read_to_string(&mut out)
        .expect("read pipe to end");
    out
}

/// The process-group id of a live process, from /proc/<pid>/stat. The comm
/// field is parenthesized and may contain spaces, so parse from the last
/// closing paren.
pub fn pgid_of(pid: i32) -> i32 {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).expect("read stat");
    let after_comm = &stat[stat.rfind(')').expect("comm field") + 2..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // after comm: state, ppid, pgrp, ...
    fields[2].parse().expect("pgrp field")
}
