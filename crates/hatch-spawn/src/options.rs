//! Launch options: working directory, umask, resource limits and
//! process-group placement.
//!
//! All validation here is pure (no OS calls) and runs before any process
//! is created, so configuration errors never half-create a child. Unknown
//! option keys and unknown resource names are construction-time errors,
//! never silently ignored.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use hatch_common::{SpawnError, SpawnResult};

/// Maximum representable umask (permission bits only).
const UMASK_MAX: u32 = 0o7777;

/// Enumerated resource kinds, each mapped to its `RLIMIT_*` constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceName {
    Cpu,
    Fsize,
    Data,
    Stack,
    Core,
    Rss,
    Nofile,
    As,
    Nproc,
    Memlock,
}

impl ResourceName {
    pub const ALL: [ResourceName; 10] = [
        Self::Cpu,
        Self::Fsize,
        Self::Data,
        Self::Stack,
        Self::Core,
        Self::Rss,
        Self::Nofile,
        Self::As,
        Self::Nproc,
        Self::Memlock,
    ];

    /// The raw `RLIMIT_*` value passed to `setrlimit(2)`.
    pub fn raw(self) -> libc::c_int {
        match self {
            Self::Cpu => libc::RLIMIT_CPU as libc::c_int,
            Self::Fsize => libc::RLIMIT_FSIZE as libc::c_int,
            Self::Data => libc::RLIMIT_DATA as libc::c_int,
            Self::Stack => libc::RLIMIT_STACK as libc::c_int,
            Self::Core => libc::RLIMIT_CORE as libc::c_int,
            Self::Rss => libc::RLIMIT_RSS as libc::c_int,
            Self::Nofile => libc::RLIMIT_NOFILE as libc::c_int,
            Self::As => libc::RLIMIT_AS as libc::c_int,
            Self::Nproc => libc::RLIMIT_NPROC as libc::c_int,
            Self::Memlock => libc::RLIMIT_MEMLOCK as libc::c_int,
        }
    }

    /// The lower-case spelling used in `rlimit_<name>` option keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Fsize => "fsize",
            Self::Data => "data",
            Self::Stack => "stack",
            Self::Core => "core",
            Self::Rss => "rss",
            Self::Nofile => "nofile",
            Self::As => "as",
            Self::Nproc => "nproc",
            Self::Memlock => "memlock",
        }
    }
}

impl FromStr for ResourceName {
    type Err = SpawnError;

    fn from_str(s: &str) -> SpawnResult<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| SpawnError::configuration(format!("unknown resource name {s:?}")))
    }
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(soft, hard)` resource bound. `hard >= soft` is enforced at
/// validation time, never at the OS call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub soft: u64,
    pub hard: u64,
}

impl ResourceLimit {
    /// A limit where soft and hard coincide (the `(name, soft)` shape).
    pub fn both(value: u64) -> Self {
        Self {
            soft: value,
            hard: value,
        }
    }

    pub fn new(soft: u64, hard: u64) -> Self {
        Self { soft, hard }
    }
}

/// Process-group placement for the child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pgroup {
    /// Stay in the caller's process group.
    #[default]
    Inherit,
    /// Create a new group headed by the child (its pgid equals its pid).
    New,
    /// Join the existing group identified by another live child's pid.
    /// Joining a nonexistent or already-reaped group fails at launch.
    Join(i32),
}

/// Validated launch options stored on a [`crate::LaunchRequest`].
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub chdir: Option<PathBuf>,
    pub umask: Option<u32>,
    pub rlimits: Vec<(ResourceName, ResourceLimit)>,
    pub pgroup: Pgroup,
    /// Close every inherited descriptor above the standard set that is not
    /// an explicit redirection target. Defaults to true.
    pub close_others: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            chdir: None,
            umask: None,
            rlimits: Vec::new(),
            pgroup: Pgroup::Inherit,
            close_others: true,
        }
    }
}

impl LaunchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure validation of every stored option.
    pub fn validate(&self) -> SpawnResult<()> {
        if let Some(umask) = self.umask {
            if umask > UMASK_MAX {
                return Err(SpawnError::configuration(format!(
                    "umask {umask:#o} outside the permission-bit range 0..={UMASK_MAX:#o}"
                )));
            }
        }
        if let Some(dir) = &self.chdir {
            if dir.as_os_str().is_empty() {
                return Err(SpawnError::configuration("chdir path is empty"));
            }
        }
        let mut seen = Vec::with_capacity(self.rlimits.len());
        for (name, limit) in &self.rlimits {
            if limit.hard < limit.soft {
                return Err(SpawnError::configuration(format!(
                    "rlimit_{name}: hard limit {} below soft limit {}",
                    limit.hard, limit.soft
                )));
            }
            if seen.contains(name) {
                return Err(SpawnError::configuration(format!(
                    "rlimit_{name} specified twice"
                )));
            }
            seen.push(*name);
        }
        if let Pgroup::Join(pid) = self.pgroup {
            if pid <= 0 {
                return Err(SpawnError::configuration(format!(
                    "pgroup pid {pid} is not a valid process id"
                )));
            }
        }
        Ok(())
    }
}

/// Parse an `rlimit_<name>` option key, the spelling used by string-keyed
/// configuration surfaces. Keys without the prefix or with an unknown name
/// are configuration errors.
pub fn parse_rlimit_key(key: &str) -> SpawnResult<ResourceName> {
    let name = key
        .strip_prefix("rlimit_")
        .ok_or_else(|| SpawnError::configuration(format!("unknown option key {key:?}")))?;
    name.parse()
}

/// Parse a `soft[:hard]` limit value.
pub fn parse_rlimit_value(value: &str) -> SpawnResult<ResourceLimit> {
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| SpawnError::configuration(format!("bad rlimit value {value:?}")))
    };
    match value.split_once(':') {
        Some((soft, hard)) => Ok(ResourceLimit::new(parse(soft)?, parse(hard)?)),
        None => Ok(ResourceLimit::both(parse(value)?)),
    }
}
