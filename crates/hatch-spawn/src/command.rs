//! Command normalization.
//!
//! A command is either a free-form shell string (handed to `/bin/sh -c`,
//! which performs word splitting and interprets pipes and operators) or a
//! pre-split argument vector (exec'd literally, no shell interpretation).
//! A vector command may carry an argv0 override: the process is launched
//! from the program path but the kernel-visible program-name slot is
//! replaced, for programs that branch on their invocation name.

use std::ffi::CString;

use hatch_common::{SpawnError, SpawnResult};

const SHELL: &str = "/bin/sh";

/// A normalized command, validated at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Invoke via the platform shell; the string may contain pipes,
    /// `||`/`&&` operators and is word-split by the shell itself.
    Shell(String),
    /// Exec the vector literally. No metacharacter expansion, no word
    /// splitting. `argv0`, when set, replaces the program-name slot only;
    /// the program is still located via `argv[0]`.
    Argv {
        argv: Vec<String>,
        argv0: Option<String>,
    },
}

impl Command {
    /// A shell-string command.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::Shell(line.into())
    }

    /// An argument-vector command.
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv {
            argv: argv.into_iter().map(Into::into).collect(),
            argv0: None,
        }
    }

    /// An argument-vector command with an overridden program-name slot.
    pub fn argv_with_argv0<I, S>(argv: I, argv0: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv {
            argv: argv.into_iter().map(Into::into).collect(),
            argv0: Some(argv0.into()),
        }
    }

    /// The program word used to locate the executable.
    pub fn program(&self) -> &str {
        match self {
            Self::Shell(_) => SHELL,
            Self::Argv { argv, .. } => argv.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// Whether locating the program requires a `PATH` search (no slash in
    /// the program word). Shell commands never do; the shell is absolute.
    pub fn needs_path_search(&self) -> bool {
        match self {
            Self::Shell(_) => false,
            Self::Argv { argv, .. } => argv
                .first()
                .map(|p| !p.contains('/'))
                .unwrap_or(false),
        }
    }

    /// Fail-fast shape validation. Runs before any OS resource is touched.
    pub fn validate(&self) -> SpawnResult<()> {
        match self {
            Self::Shell(line) => {
                if line.is_empty() {
                    return Err(SpawnError::configuration("shell command is empty"));
                }
                if line.as_bytes().contains(&0) {
                    return Err(SpawnError::configuration(
                        "shell command contains a NUL byte",
                    ));
                }
            }
            Self::Argv { argv, argv0 } => {
                if argv.is_empty() {
                    return Err(SpawnError::configuration("argv is empty"));
                }
                if argv[0].is_empty() {
                    return Err(SpawnError::configuration("argv[0] is empty"));
                }
                for word in argv.iter().chain(argv0.iter()) {
                    if word.as_bytes().contains(&0) {
                        return Err(SpawnError::configuration(
                            "argv word contains a NUL byte",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Render the argv the child will exec, as C strings. For shell
    /// commands this is `["sh", "-c", line]`; for vector commands the
    /// argv0 override, when present, replaces the first slot.
    pub(crate) fn render_argv(&self) -> SpawnResult<Vec<CString>> {
        match self {
            Self::Shell(line) => Ok(vec![
                cstr("sh")?,
                cstr("-c")?,
                cstr(line)?,
            ]),
            Self::Argv { argv, argv0 } => {
                let mut out = Vec::with_capacity(argv.len());
                let first = argv0.as_deref().unwrap_or(&argv[0]);
                out.push(cstr(first)?);
                for word in &argv[1..] {
                    out.push(cstr(word)?);
                }
                Ok(out)
            }
        }
    }

    /// Candidate executable paths, tried by the child in order. Computed in
    /// the parent so the child allocates nothing after the fork. A program
    /// word containing `/` yields exactly one candidate; otherwise each
    /// directory of the given `PATH` value is tried (empty entries mean the
    /// current directory, per POSIX).
    pub(crate) fn exec_candidates(&self, path_var: Option<&str>) -> Vec<CString> {
        let program = self.program();
        if !self.needs_path_search() {
            return CString::new(program).map(|c| vec![c]).unwrap_or_default();
        }
        let path_var = path_var.unwrap_or("/bin:/usr/bin");
        let mut candidates = Vec::new();
        for dir in path_var.split(':') {
            let full = if dir.is_empty() {
                format!("./{program}")
            } else {
                format!("{dir}/{program}")
            };
            if let Ok(c) = CString::new(full) {
                candidates.push(c);
            }
        }
        candidates
    }
}

fn cstr(s: &str) -> SpawnResult<CString> {
    CString::new(s)
        .map_err(|_| SpawnError::configuration("command word contains a NUL byte"))
}
