//! Descriptor redirection planning.
//!
//! A set of requested final fd assignments is converted into an ordered
//! sequence of low-level duplicate/close operations that stays correct even
//! when requests alias or swap each other (`3 => 4, 4 => 3`). Planning is
//! pure: the parent's descriptor table is never touched, and the resulting
//! [`RedirOp`] list is executed verbatim by the child after the fork.
//!
//! The dependency rule is "source before dependent": an entry that reads a
//! descriptor must run before the entry that overwrites it. Cycles are
//! broken by saving one member to a scratch descriptor (one scratch slot
//! per cycle) which is released once that cycle has drained.

use std::ffi::CString;
use std::os::unix::prelude::RawFd;
use std::path::{Path, PathBuf};

use hatch_common::{SpawnError, SpawnResult};

/// What a redirected descriptor should refer to in the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Close the target descriptor in the child.
    Close,
    /// Keep the target descriptor exactly as inherited from the parent,
    /// clearing its close-on-exec flag so it survives the exec. Fails with
    /// a bad-descriptor error if the parent does not have it open.
    Inherit,
    /// The child's target becomes a duplicate of the *parent's* descriptor
    /// `n` as it was at spawn time, even if `n` is itself being reassigned.
    /// `Dup(n)` onto target `n` behaves like [`Source::Inherit`].
    Dup(RawFd),
    /// Open a file at the target descriptor. Flags and mode are applied
    /// atomically at `open(2)` time; never open-then-chmod.
    File {
        path: PathBuf,
        flags: i32,
        mode: u32,
    },
}

impl Source {
    /// Open for writing, create + truncate, mode 0644.
    pub fn write_to(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            flags: libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            mode: 0o644,
        }
    }

    /// Open for appending, create, mode 0644.
    pub fn append_to(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            flags: libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            mode: 0o644,
        }
    }

    /// Open read-only.
    pub fn read_from(path: impl Into<PathBuf>) -> Self {
        Self::File {
            path: path.into(),
            flags: libc::O_RDONLY,
            mode: 0,
        }
    }

    /// Open with explicit flags and mode.
    pub fn file(path: impl Into<PathBuf>, flags: i32, mode: u32) -> Self {
        Self::File {
            path: path.into(),
            flags,
            mode,
        }
    }
}

/// One low-level child-side descriptor operation. The child executes the
/// planned sequence in order; any failure aborts the launch before exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirOp {
    /// `open(path, flags, mode)` then move the result to `target`.
    Open {
        target: RawFd,
        path: CString,
        flags: i32,
        mode: u32,
    },
    /// `dup2(src, target)`.
    Dup2 { src: RawFd, target: RawFd },
    /// `close(fd)`.
    Close { fd: RawFd },
    /// Clear `FD_CLOEXEC` on `fd` so it survives exec.
    ClearCloexec { fd: RawFd },
    /// Duplicate `from` to the scratch slot before `from` is overwritten.
    SaveToScratch { from: RawFd },
    /// `dup2(scratch, target)`.
    DupScratchTo { target: RawFd },
    /// Close the scratch slot; its cycle has drained.
    DropScratch,
    /// Close every descriptor above the standard set (0..=2) that is not
    /// in `keep`. Always the final operation when present.
    CloseOthers { keep: Vec<RawFd> },
}

/// The ordered set of requested redirections for one launch.
#[derive(Debug, Clone, Default)]
pub struct Redirections {
    entries: Vec<(RawFd, Source)>,
}

impl Redirections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that `target` refer to `source` in the child.
    pub fn add(&mut self, target: RawFd, source: Source) {
        self.entries.push((target, source));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(RawFd, Source)] {
        &self.entries
    }

    /// Pure shape validation: non-negative descriptors, no two entries
    /// sharing a target.
    pub fn validate(&self) -> SpawnResult<()> {
        let mut targets = Vec::with_capacity(self.entries.len());
        for (target, source) in &self.entries {
            if *target < 0 {
                return Err(SpawnError::configuration(format!(
                    "redirection target fd {target} is negative"
                )));
            }
            if let Source::Dup(src) = source {
                if *src < 0 {
                    return Err(SpawnError::configuration(format!(
                        "redirection source fd {src} is negative"
                    )));
                }
            }
            if targets.contains(target) {
                return Err(SpawnError::configuration(format!(
                    "redirection target fd {target} specified twice"
                )));
            }
            targets.push(*target);
        }
        Ok(())
    }

    /// Descriptors the child must leave open: every target that is not an
    /// explicit close.
    pub fn kept_fds(&self) -> Vec<RawFd> {
        let mut keep: Vec<RawFd> = self
            .entries
            .iter()
            .filter(|(_, source)| !matches!(source, Source::Close))
            .map(|(target, _)| *target)
            .collect();
        keep.sort_unstable();
        keep.dedup();
        keep
    }

    /// The highest descriptor number the plan mentions, never below the
    /// standard set; scratch slots are allocated above this.
    pub fn max_fd(&self) -> RawFd {
        self.entries
            .iter()
            .map(|(target, source)| match source {
                Source::Dup(src) => (*target).max(*src),
                _ => *target,
            })
            .max()
            .unwrap_or(2)
            .max(2)
    }

    /// Compute the conflict-free operation sequence.
    ///
    /// Entries whose source is another entry's target form a dependency
    /// graph; acyclic parts are emitted in source-before-dependent order,
    /// and each cycle is broken by saving one member to the scratch slot.
    /// With `close_others`, a final [`RedirOp::CloseOthers`] closes every
    /// unspecified descriptor above the standard set.
    pub fn plan(&self, close_others: bool) -> SpawnResult<Vec<RedirOp>> {
        self.validate()?;

        let mut ops = Vec::with_capacity(self.entries.len() + 1);
        let mut pending: Vec<PlanEntry> = Vec::new();

        for (target, source) in &self.entries {
            match source {
                Source::Inherit => ops.push(RedirOp::ClearCloexec { fd: *target }),
                Source::Dup(src) if src == target => {
                    ops.push(RedirOp::ClearCloexec { fd: *target })
                }
                Source::Close => pending.push(PlanEntry {
                    target: *target,
                    write: Write::Close,
                }),
                Source::File { path, flags, mode } => pending.push(PlanEntry {
                    target: *target,
                    write: Write::Open {
                        path: path_to_cstring(path)?,
                        flags: *flags,
                        mode: *mode,
                    },
                }),
                Source::Dup(src) => pending.push(PlanEntry {
                    target: *target,
                    write: Write::Dup(Slot::Fd(*src)),
                }),
            }
        }

        // Deterministic tie-break: lowest target first among ready entries.
        pending.sort_by_key(|e| e.target);

        let mut scratch_active = false;
        while !pending.is_empty() {
            let ready = pending.iter().position(|entry| {
                !pending.iter().any(|other| {
                    matches!(other.write, Write::Dup(Slot::Fd(src)) if src == entry.target)
                })
            });

            match ready {
                Some(idx) => {
                    let entry = pending.remove(idx);
                    let used_scratch = matches!(entry.write, Write::Dup(Slot::Scratch));
                    ops.push(entry.into_op());
                    if used_scratch
                        && scratch_active
                        && !pending
                            .iter()
                            .any(|e| matches!(e.write, Write::Dup(Slot::Scratch)))
                    {
                        ops.push(RedirOp::DropScratch);
                        scratch_active = false;
                    }
                }
                None => {
                    // Every remaining entry participates in a cycle. Break
                    // the one containing the lowest target: capture that
                    // descriptor in the scratch slot and repoint its
                    // readers there.
                    assert!(
                        !scratch_active,
                        "redirection planner: scratch slot still live at cycle break"
                    );
                    let victim = pending[0].target;
                    ops.push(RedirOp::SaveToScratch { from: victim });
                    for entry in &mut pending {
                        if matches!(entry.write, Write::Dup(Slot::Fd(src)) if src == victim) {
                            entry.write = Write::Dup(Slot::Scratch);
                        }
                    }
                    scratch_active = true;
                }
            }
        }

        if close_others {
            ops.push(RedirOp::CloseOthers {
                keep: self.kept_fds(),
            });
        }
        Ok(ops)
    }
}

#[derive(Debug)]
struct PlanEntry {
    target: RawFd,
    write: Write,
}

#[derive(Debug)]
enum Write {
    Close,
    Open {
        path: CString,
        flags: i32,
        mode: u32,
    },
    Dup(Slot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Fd(RawFd),
    Scratch,
}

impl PlanEntry {
    fn into_op(self) -> RedirOp {
        match self.write {
            Write::Close => RedirOp::Close { fd: self.target },
            Write::Open { path, flags, mode } => RedirOp::Open {
                target: self.target,
                path,
                flags,
                mode,
            },
            Write::Dup(Slot::Fd(src)) => RedirOp::Dup2 {
                src,
                target: self.target,
            },
            Write::Dup(Slot::Scratch) => RedirOp::DupScratchTo {
                target: self.target,
            },
        }
    }
}

fn path_to_cstring(path: &Path) -> SpawnResult<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SpawnError::configuration("redirection path contains a NUL byte"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Symbolic value of a child descriptor after applying a plan.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Stream {
        /// The parent's descriptor `n` as it was at spawn time.
        Parent(RawFd),
        /// A freshly opened file.
        File(String),
        Closed,
    }

    /// Replay a plan against a symbolic descriptor table. Descriptors not
    /// present in the table are the parent's own (identity mapping).
    fn simulate(ops: &[RedirOp]) -> BTreeMap<RawFd, Stream> {
        let mut table: BTreeMap<RawFd, Stream> = BTreeMap::new();
        let mut scratch: Option<Stream> = None;
        let lookup = |table: &BTreeMap<RawFd, Stream>, fd: RawFd| {
            table.get(&fd).cloned().unwrap_or(Stream::Parent(fd))
        };
        for op in ops {
            match op {
                RedirOp::Open { target, path, .. } => {
                    table.insert(
                        *target,
                        Stream::File(path.to_str().unwrap().to_string()),
                    );
                }
                RedirOp::Dup2 { src, target } => {
                    let value = lookup(&table, *src);
                    assert_ne!(value, Stream::Closed, "dup2 from a closed fd");
                    table.insert(*target, value);
                }
                RedirOp::Close { fd } => {
                    table.insert(*fd, Stream::Closed);
                }
                RedirOp::ClearCloexec { .. } => {}
                RedirOp::SaveToScratch { from } => {
                    assert!(scratch.is_none(), "two live scratch slots");
                    scratch = Some(lookup(&table, *from));
                }
                RedirOp::DupScratchTo { target } => {
                    let value = scratch.clone().expect("scratch used before save");
                    table.insert(*target, value);
                }
                RedirOp::DropScratch => {
                    assert!(scratch.is_some(), "dropping an empty scratch slot");
                    scratch = None;
                }
                RedirOp::CloseOthers { .. } => {}
            }
        }
        assert!(scratch.is_none(), "scratch slot leaked past the plan");
        table
    }

    /// Assert that a planned and simulated table matches the request.
    fn check(redirs: &Redirections) {
        let ops = redirs.plan(false).unwrap();
        let table = simulate(&ops);
        for (target, source) in redirs.entries() {
            let got = table
                .get(target)
                .cloned()
                .unwrap_or(Stream::Parent(*target));
            match source {
                Source::Close => assert_eq!(got, Stream::Closed, "target {target}"),
                Source::Inherit => assert_eq!(got, Stream::Parent(*target)),
                Source::Dup(src) => {
                    assert_eq!(got, Stream::Parent(*src), "target {target} <= {src}")
                }
                Source::File { path, .. } => assert_eq!(
                    got,
                    Stream::File(path.to_str().unwrap().to_string()),
                    "target {target}"
                ),
            }
        }
    }

    #[test]
    fn test_simple_mapping() {
        let mut r = Redirections::new();
        r.add(1, Source::write_to("/tmp/out"));
        r.add(2, Source::Dup(1));
        // stderr must capture the parent's stdout, not the file.
        check(&r);
    }

    #[test]
    fn test_chain_source_captured_before_overwrite() {
        let mut r = Redirections::new();
        r.add(4, Source::write_to("/tmp/f"));
        r.add(3, Source::Dup(4));
        let ops = r.plan(false).unwrap();
        // dup2(4, 3) must precede the open that overwrites 4.
        let dup_pos = ops
            .iter()
            .position(|op| matches!(op, RedirOp::Dup2 { src: 4, target: 3 }))
            .unwrap();
        let open_pos = ops
            .iter()
            .position(|op| matches!(op, RedirOp::Open { target: 4, .. }))
            .unwrap();
        assert!(dup_pos < open_pos);
        check(&r);
    }

    #[test]
    fn test_two_swap() {
        let mut r = Redirections::new();
        r.add(3, Source::Dup(4));
        r.add(4, Source::Dup(3));
        let ops = r.plan(false).unwrap();
        assert!(ops.iter().any(|op| matches!(op, RedirOp::SaveToScratch { .. })));
        assert!(ops.iter().any(|op| matches!(op, RedirOp::DropScratch)));
        check(&r);
    }

    #[test]
    fn test_shifted_cycle_of_five_both_directions() {
        // fds 10..=19 standing in for five pipe pairs; each fd takes the
        // previous one's stream, then each takes the next one's.
        for shift in [-1i32, 1] {
            let mut r = Redirections::new();
            for i in 0..10i32 {
                let src = 10 + (i + shift).rem_euclid(10);
                r.add(10 + i, Source::Dup(src));
            }
            check(&r);
        }
    }

    #[test]
    fn test_three_cycle_uses_single_scratch() {
        let mut r = Redirections::new();
        r.add(5, Source::Dup(6));
        r.add(6, Source::Dup(7));
        r.add(7, Source::Dup(5));
        let ops = r.plan(false).unwrap();
        let saves = ops
            .iter()
            .filter(|op| matches!(op, RedirOp::SaveToScratch { .. }))
            .count();
        assert_eq!(saves, 1);
        check(&r);
    }

    #[test]
    fn test_two_independent_cycles() {
        let mut r = Redirections::new();
        r.add(3, Source::Dup(4));
        r.add(4, Source::Dup(3));
        r.add(8, Source::Dup(9));
        r.add(9, Source::Dup(8));
        let ops = r.plan(false).unwrap();
        let saves = ops
            .iter()
            .filter(|op| matches!(op, RedirOp::SaveToScratch { .. }))
            .count();
        assert_eq!(saves, 2, "one scratch slot per cycle");
        check(&r);
    }

    #[test]
    fn test_cycle_mixed_with_acyclic_entries() {
        let mut r = Redirections::new();
        r.add(1, Source::write_to("/tmp/out"));
        r.add(3, Source::Dup(4));
        r.add(4, Source::Dup(3));
        r.add(5, Source::Dup(1));
        r.add(6, Source::Close);
        check(&r);
    }

    #[test]
    fn test_self_redirection_clears_cloexec() {
        let mut r = Redirections::new();
        r.add(7, Source::Dup(7));
        r.add(8, Source::Inherit);
        let ops = r.plan(false).unwrap();
        assert_eq!(
            ops,
            vec![
                RedirOp::ClearCloexec { fd: 7 },
                RedirOp::ClearCloexec { fd: 8 },
            ]
        );
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let mut r = Redirections::new();
        r.add(1, Source::write_to("/tmp/a"));
        r.add(1, Source::Close);
        assert!(r.plan(true).is_err());
    }

    #[test]
    fn test_negative_fds_rejected() {
        let mut r = Redirections::new();
        r.add(-1, Source::Close);
        assert!(r.validate().is_err());

        let mut r = Redirections::new();
        r.add(2, Source::Dup(-3));
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_close_others_keep_set() {
        let mut r = Redirections::new();
        r.add(5, Source::write_to("/tmp/x"));
        r.add(6, Source::Close);
        r.add(3, Source::Dup(5));
        let ops = r.plan(true).unwrap();
        match ops.last().unwrap() {
            RedirOp::CloseOthers { keep } => assert_eq!(keep, &vec![3, 5]),
            other => panic!("expected CloseOthers last, got {other:?}"),
        }
    }

    #[test]
    fn test_no_close_others_when_disabled() {
        let mut r = Redirections::new();
        r.add(1, Source::write_to("/tmp/x"));
        let ops = r.plan(false).unwrap();
        assert!(!ops.iter().any(|op| matches!(op, RedirOp::CloseOthers { .. })));
    }

    #[test]
    fn test_max_fd() {
        let mut r = Redirections::new();
        r.add(3, Source::Dup(17));
        r.add(9, Source::Close);
        assert_eq!(r.max_fd(), 17);
        assert_eq!(Redirections::new().max_fd(), 2);
    }
}
