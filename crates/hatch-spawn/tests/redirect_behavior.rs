//! End-to-end descriptor redirection behavior: round-trips through files
//! and pipes, swaps, inheritance and close-others semantics.

mod common;

use std::os::fd::AsRawFd;

use hatch_spawn::{
    spawn, ChildStep, Command, ErrorKind, LaunchRequest, Source, SpawnError, Terminal,
};

#[test]
fn test_stdout_to_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let request = LaunchRequest::builder(Command::shell("echo from-child"))
        .redirect(1, Source::write_to(&out))
        .build()
        .unwrap();
    spawn(request).unwrap().wait().unwrap();
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "from-child\n");
}

#[test]
fn test_append_mode_preserves_previous_contents() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    for (source, word) in [
        (Source::write_to(&out), "one"),
        (Source::append_to(&out), "two"),
    ] {
        let request = LaunchRequest::builder(Command::shell(format!("echo {word}")))
            .redirect(1, source)
            .build()
            .unwrap();
        spawn(request).unwrap().wait().unwrap();
    }
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "one\ntwo\n");
}

#[test]
fn test_stdin_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input");
    let out = dir.path().join("out");
    std::fs::write(&input, "b\na\nc\n").unwrap();
    let request = LaunchRequest::builder(Command::argv(["sort"]))
        .redirect(0, Source::read_from(&input))
        .redirect(1, Source::write_to(&out))
        .build()
        .unwrap();
    let status = spawn(request).unwrap().wait().unwrap();
    assert_eq!(status.terminal(), Terminal::Exited(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "a\nb\nc\n");
}

#[test]
fn test_stdout_and_stderr_share_a_parent_descriptor() {
    let (r, w) = common::pipe();
    let request =
        LaunchRequest::builder(Command::shell("echo out; echo err >&2"))
            .redirect(1, Source::Dup(w.as_raw_fd()))
            .redirect(2, Source::Dup(w.as_raw_fd()))
            .build()
            .unwrap();
    let mut handle = spawn(request).unwrap();
    drop(w);
    let text = common::read_to_end(r);
    handle.wait().unwrap();
    assert!(text.contains("out\n"));
    assert!(text.contains("err\n"));
}

#[test]
fn test_swapped_descriptors_cross_over() {
    let (r1, w1) = common::pipe();
    let (r2, w2) = common::pipe();
    let (fd1, fd2) = (w1.as_raw_fd(), w2.as_raw_fd());

    // The child writes a token to each descriptor number, but the two
    // numbers have been swapped: what it writes to fd1 must surface on the
    // pipe behind fd2, and vice versa.
    let request = LaunchRequest::builder(Command::shell(format!(
        "echo alpha >&{fd1}; echo beta >&{fd2}"
    )))
    .redirect(fd1, Source::Dup(fd2))
    .redirect(fd2, Source::Dup(fd1))
    .build()
    .unwrap();
    let mut handle = spawn(request).unwrap();
    drop(w1);
    drop(w2);
    let from_first = common::read_to_end(r1);
    let from_second = common::read_to_end(r2);
    let status = handle.wait().unwrap();
    assert_eq!(status.terminal(), Terminal::Exited(0));
    assert_eq!(from_first, "beta\n");
    assert_eq!(from_second, "alpha\n");
}

#[test]
fn test_close_others_defaults_to_closing_inherited_fds() {
    let (r, w) = common::pipe();
    let fd = w.as_raw_fd();
    let request = LaunchRequest::builder(Command::shell(format!(
        "echo leaked >&{fd} 2>/dev/null"
    )))
    .build()
    .unwrap();
    let mut handle = spawn(request).unwrap();
    drop(w);
    let text = common::read_to_end(r);
    let status = handle.wait().unwrap();
    // The descriptor was closed in the child: nothing arrives and the
    // shell reports the redirection failure.
    assert_eq!(text, "");
    assert_ne!(status.terminal(), Terminal::Exited(0));
}

#[test]
fn test_close_others_disabled_keeps_inherited_fds() {
    let (r, w) = common::pipe();
    let fd = w.as_raw_fd();
    let request = LaunchRequest::builder(Command::shell(format!("echo kept >&{fd}")))
        .close_others(false)
        .build()
        .unwrap();
    let mut handle = spawn(request).unwrap();
    drop(w);
    let text = common::read_to_end(r);
    let status = handle.wait().unwrap();
    assert_eq!(status.terminal(), Terminal::Exited(0));
    assert_eq!(text, "kept\n");
}

#[test]
fn test_inherit_marks_descriptor_keep_open() {
    let (r, w) = common::pipe();
    let fd = w.as_raw_fd();
    // close_others stays at its default; the explicit Inherit entry is what
    // keeps the descriptor alive, at the same number.
    let request = LaunchRequest::builder(Command::shell(format!("echo held >&{fd}")))
        .redirect(fd, Source::Inherit)
        .build()
        .unwrap();
    let mut handle = spawn(request).unwrap();
    drop(w);
    let text = common::read_to_end(r);
    handle.wait().unwrap();
    assert_eq!(text, "held\n");
}

#[test]
fn test_inherit_of_closed_descriptor_fails_with_bad_descriptor() {
    // Park a descriptor at a high number, close it, then ask the child to
    // inherit it. The number is chosen high to dodge descriptor recycling
    // by concurrent tests.
    let (_r, w) = common::pipe();
    let parked = unsafe { libc::fcntl(w.as_raw_fd(), libc::F_DUPFD, 311) };
    assert!(parked >= 311);
    let rc = unsafe { libc::close(parked) };
    assert_eq!(rc, 0);

    let request = LaunchRequest::builder(Command::shell("true"))
        .redirect(parked, Source::Inherit)
        .build()
        .unwrap();
    match spawn(request) {
        Err(SpawnError::Launch { step, kind, .. }) => {
            assert_eq!(step, ChildStep::Redirect);
            assert_eq!(kind, ErrorKind::BadDescriptor);
        }
        other => panic!("expected redirect launch failure, got {other:?}"),
    }
}

#[test]
fn test_high_descriptor_target() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    // Write through fd 9 inside the child, Bourne-style.
    let request = LaunchRequest::builder(Command::shell("echo nine >&9"))
        .redirect(9, Source::write_to(&out))
        .build()
        .unwrap();
    let status = spawn(request).unwrap().wait().unwrap();
    assert_eq!(status.terminal(), Terminal::Exited(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "nine\n");
}

#[test]
fn test_explicit_close_of_standard_stream() {
    // Closing stderr must not disturb stdout.
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let request = LaunchRequest::builder(Command::shell("echo visible"))
        .redirect(1, Source::write_to(&out))
        .redirect(2, Source::Close)
        .build()
        .unwrap();
    let status = spawn(request).unwrap().wait().unwrap();
    assert_eq!(status.terminal(), Terminal::Exited(0));
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "visible\n");
}

#[test]
fn test_missing_redirect_target_file_fails_cleanly() {
    let request = LaunchRequest::builder(Command::shell("true"))
        .redirect(0, Source::read_from("/definitely/not/a/real/file"))
        .build()
        .unwrap();
    match spawn(request) {
        Err(SpawnError::Launch { step, kind, .. }) => {
            assert_eq!(step, ChildStep::Redirect);
            assert_eq!(kind, ErrorKind::NotFound);
        }
        other => panic!("expected redirect launch failure, got {other:?}"),
    }
}
