//! The launcher: consumes a [`LaunchRequest`] and produces a
//! [`ProcessHandle`].
//!
//! Launch proceeds through explicit phases. In the parent, before the fork,
//! everything the child will need is materialized: rendered argv/envp
//! C-string tables, executable path candidates, the redirection op
//! sequence, the raw rlimit values. After the fork the child applies its
//! options in a fixed order (process group, resource limits, working
//! directory, umask, redirections) and then calls `execve`, the point of
//! no return.
//!
//! Every child-side step is async-signal-safe: raw libc calls over buffers
//! allocated before the fork, no heap, no locks, no logging. A failing step
//! writes `(step, errno)` down a close-on-exec pipe and `_exit`s without
//! flushing stdio. The parent reads the pipe, reaps the dead child, and
//! reports the failure as if process creation itself had failed. No zombie
//! and no half-initialized child is ever observable.

use std::ffi::CString;
use std::io;

use libc::{c_char, c_int};
use tracing::debug;

use crate::handle::ProcessHandle;
use crate::options::Pgroup;
use crate::redirect::RedirOp;
use crate::request::LaunchRequest;
use hatch_common::{ChildStep, SpawnError, SpawnResult};

/// Spawn the child described by `request`.
///
/// Returns as soon as the OS has accepted the creation request and the
/// child has passed its point of no return; it does not wait for the child
/// to finish. Child-side setup failures are reported here, synchronously,
/// with the child already reaped.
pub fn spawn(request: LaunchRequest) -> SpawnResult<ProcessHandle> {
    let payload = ChildPayload::prepare(&request)?;
    let argv_ptrs = nul_terminated_ptrs(&payload.argv);
    let envp_ptrs = nul_terminated_ptrs(&payload.envp);

    let (pipe_read, pipe_write) = cloexec_pipe()?;

    debug!(
        program = request.command().program(),
        redirections = payload.ops.len(),
        "forking child"
    );

    // Point of process creation. From here until execve, the child may only
    // touch pre-allocated memory and make raw syscalls.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(pipe_read);
                libc::close(pipe_write);
            }
            Err(SpawnError::resource("fork", err))
        }
        0 => {
            // Child side. Never returns.
            unsafe {
                libc::close(pipe_read);
                let err_fd = relocate_err_fd(pipe_write, payload.min_scratch);
                let (step, errno) = run_child(&payload, &argv_ptrs, &envp_ptrs, err_fd);
                report_failure_and_exit(err_fd, step, errno)
            }
        }
        _ => {
            unsafe {
                libc::close(pipe_write);
            }
            let report = read_child_report(pipe_read, pid);
            unsafe {
                libc::close(pipe_read);
            }
            report?;
            debug!(pid, "child launched");
            Ok(ProcessHandle::new(pid))
        }
    }
}

/// Everything the child needs after the fork, fully materialized in the
/// parent so the child allocates nothing.
struct ChildPayload {
    /// Executable path candidates, tried in order by `execve`.
    candidates: Vec<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    pgroup: Option<libc::pid_t>,
    rlimits: Vec<(c_int, libc::rlimit)>,
    chdir: Option<CString>,
    umask: Option<libc::mode_t>,
    ops: Vec<RedirOp>,
    /// First descriptor number safely above everything the plan mentions;
    /// the error pipe and the cycle scratch slot live here.
    min_scratch: c_int,
}

impl ChildPayload {
    fn prepare(request: &LaunchRequest) -> SpawnResult<Self> {
        request.command.validate()?;
        request.options.validate()?;

        let argv = request.command.render_argv()?;
        let envp = request.env.resolve()?;
        let path_var = request.env.effective_value("PATH");
        let candidates = request.command.exec_candidates(path_var.as_deref());
        if candidates.is_empty() {
            return Err(SpawnError::configuration(
                "no executable path candidates for command",
            ));
        }

        let pgroup = match request.options.pgroup {
            Pgroup::Inherit => None,
            Pgroup::New => Some(0),
            Pgroup::Join(pid) => Some(pid as libc::pid_t),
        };

        let rlimits = request
            .options
            .rlimits
            .iter()
            .map(|(name, limit)| {
                (
                    name.raw(),
                    libc::rlimit {
                        rlim_cur: limit.soft as libc::rlim_t,
                        rlim_max: limit.hard as libc::rlim_t,
                    },
                )
            })
            .collect();

        let chdir = match &request.options.chdir {
            Some(dir) => {
                use std::os::unix::ffi::OsStrExt;
                Some(CString::new(dir.as_os_str().as_bytes()).map_err(|_| {
                    SpawnError::configuration("chdir path contains a NUL byte")
                })?)
            }
            None => None,
        };

        let ops = request
            .redirections
            .plan(request.options.close_others)?;
        let min_scratch = request.redirections.max_fd() + 1;

        Ok(Self {
            candidates,
            argv,
            envp,
            pgroup,
            rlimits,
            chdir,
            umask: request.options.umask.map(|m| m as libc::mode_t),
            ops,
            min_scratch,
        })
    }
}

/// NULL-terminated pointer table over a C-string vector, for `execve`.
fn nul_terminated_ptrs(strings: &[CString]) -> Vec<*const c_char> {
    let mut ptrs: Vec<*const c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(std::ptr::null());
    ptrs
}

/// A pipe whose both ends are close-on-exec: the write end vanishes at a
/// successful `execve`, so a zero-byte read on the parent side means the
/// launch succeeded.
fn cloexec_pipe() -> SpawnResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    let rc = unsafe {
        let rc = libc::pipe(fds.as_mut_ptr());
        if rc == 0 {
            for fd in fds {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        rc
    };
    if rc != 0 {
        return Err(SpawnError::resource(
            "error pipe",
            io::Error::last_os_error(),
        ));
    }
    Ok((fds[0], fds[1]))
}

/// Move the error-pipe write end above every descriptor the redirection
/// plan mentions, so applying the plan cannot clobber it.
unsafe fn relocate_err_fd(fd: c_int, min_scratch: c_int) -> c_int {
    if fd >= min_scratch {
        return fd;
    }
    let moved = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min_scratch);
    if moved < 0 {
        // Out of descriptors; keep the original and hope the plan does not
        // touch it. Failure here will surface at the first clobbered op.
        return fd;
    }
    libc::close(fd);
    moved
}

/// Apply the launch options in order and exec. Only returns on failure,
/// with the failing step and errno. Async-signal-safe throughout.
unsafe fn run_child(
    payload: &ChildPayload,
    argv_ptrs: &[*const c_char],
    envp_ptrs: &[*const c_char],
    err_fd: c_int,
) -> (ChildStep, i32) {
    if let Some(pgid) = payload.pgroup {
        if libc::setpgid(0, pgid) != 0 {
            return (ChildStep::Pgroup, errno());
        }
    }

    for (resource, limit) in &payload.rlimits {
        if libc::setrlimit(*resource as _, limit) != 0 {
            return (ChildStep::Rlimit, errno());
        }
    }

    if let Some(dir) = &payload.chdir {
        if libc::chdir(dir.as_ptr()) != 0 {
            return (ChildStep::Chdir, errno());
        }
    }

    if let Some(mask) = payload.umask {
        // umask(2) cannot fail.
        libc::umask(mask);
    }

    if let Err(errno) = apply_redirections(&payload.ops, payload.min_scratch, err_fd) {
        return (ChildStep::Redirect, errno);
    }

    // Try each path candidate; execve only returns on failure. Prefer
    // reporting EACCES over ENOENT when both occur during the PATH search.
    let mut saw_eacces = false;
    let mut last_errno = libc::ENOENT;
    for candidate in &payload.candidates {
        libc::execve(candidate.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
        last_errno = errno();
        if last_errno == libc::EACCES {
            saw_eacces = true;
        }
    }
    if saw_eacces {
        last_errno = libc::EACCES;
    }
    (ChildStep::Exec, last_errno)
}

/// Execute the planned redirection ops verbatim.
unsafe fn apply_redirections(
    ops: &[RedirOp],
    min_scratch: c_int,
    err_fd: c_int,
) -> Result<(), i32> {
    let mut scratch: c_int = -1;
    for op in ops {
        let ok = match op {
            RedirOp::Open {
                target,
                path,
                flags,
                mode,
            } => {
                let fd = libc::open(path.as_ptr(), *flags, *mode);
                if fd < 0 {
                    false
                } else if fd == *target {
                    true
                } else {
                    let moved = libc::dup2(fd, *target) >= 0;
                    libc::close(fd);
                    moved
                }
            }
            RedirOp::Dup2 { src, target } => libc::dup2(*src, *target) >= 0,
            RedirOp::Close { fd } => libc::close(*fd) == 0,
            RedirOp::ClearCloexec { fd } => {
                let flags = libc::fcntl(*fd, libc::F_GETFD);
                flags >= 0
                    && libc::fcntl(*fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) >= 0
            }
            RedirOp::SaveToScratch { from } => {
                scratch = libc::fcntl(*from, libc::F_DUPFD, min_scratch);
                scratch >= 0
            }
            RedirOp::DupScratchTo { target } => libc::dup2(scratch, *target) >= 0,
            RedirOp::DropScratch => {
                libc::close(scratch);
                scratch = -1;
                true
            }
            RedirOp::CloseOthers { keep } => {
                close_unspecified(keep, err_fd, scratch);
                true
            }
        };
        if !ok {
            return Err(errno());
        }
    }
    Ok(())
}

/// Close every descriptor above the standard set that is neither an
/// explicit redirection target nor the error pipe.
unsafe fn close_unspecified(keep: &[c_int], err_fd: c_int, scratch: c_int) {
    let mut limit: c_int = {
        let mut rl = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE as _, &mut rl) == 0 {
            rl.rlim_cur.min(65536) as c_int
        } else {
            1024
        }
    };
    for &fd in keep {
        if fd >= limit {
            limit = fd + 1;
        }
    }
    if err_fd >= limit {
        limit = err_fd + 1;
    }

    for fd in 3..limit {
        if fd == err_fd || fd == scratch || keep.contains(&fd) {
            continue;
        }
        libc::close(fd);
    }

    // Sweep anything above the scan window; ENOSYS on old kernels is fine,
    // those descriptors were already covered by the rlimit-derived limit.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        libc::syscall(
            libc::SYS_close_range,
            limit as libc::c_uint,
            libc::c_uint::MAX,
            0 as c_int,
        );
    }
}

/// Write `(step, errno)` to the error pipe and die without running any
/// normal cleanup, so no duplicate output escapes through inherited
/// descriptors.
unsafe fn report_failure_and_exit(err_fd: c_int, step: ChildStep, errno_value: i32) -> ! {
    let mut buf = [0u8; 8];
    buf[0] = step as u8;
    buf[4..8].copy_from_slice(&errno_value.to_ne_bytes());
    let mut written = 0usize;
    while written < buf.len() {
        let rc = libc::write(
            err_fd,
            buf[written..].as_ptr() as *const libc::c_void,
            buf.len() - written,
        );
        if rc > 0 {
            written += rc as usize;
        } else if rc < 0 && errno() == libc::EINTR {
            continue;
        } else {
            break;
        }
    }
    libc::_exit(127)
}

/// Read the child's verdict. Zero bytes means the pipe closed at a
/// successful exec; a full report means setup failed, in which case the
/// dead child is reaped here so no zombie outlives the error.
fn read_child_report(pipe_read: c_int, pid: libc::pid_t) -> SpawnResult<()> {
    let mut buf = [0u8; 8];
    let mut filled = 0usize;
    while filled < buf.len() {
        let rc = unsafe {
            libc::read(
                pipe_read,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if rc > 0 {
            filled += rc as usize;
        } else if rc == 0 {
            break;
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            reap_quietly(pid);
            return Err(SpawnError::resource("error pipe read", err));
        }
    }

    if filled == 0 {
        return Ok(());
    }
    reap_quietly(pid);
    if filled < buf.len() {
        // Truncated report; the child died mid-write. Classify as an exec
        // failure with an I/O error rather than trusting partial bytes.
        return Err(SpawnError::launch(ChildStep::Exec, libc::EIO));
    }
    let step = ChildStep::from_wire(buf[0]);
    let errno_value = i32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
    debug!(pid, %step, errno_value, "child-side launch failure");
    Err(SpawnError::launch(step, errno_value))
}

fn reap_quietly(pid: libc::pid_t) {
    let mut status: c_int = 0;
    loop {
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc >= 0 || io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            break;
        }
    }
}

/// Raw errno for the child-side paths, where `io::Error` allocation is off
/// limits.
unsafe fn errno() -> i32 {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        *libc::__errno_location()
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        *libc::__error()
    }
}
