//! Environment planning.
//!
//! The child's final environment is computed from the parent's environment,
//! an override map, and an "unset everything else" flag. A `None` override
//! means "unset this specific key", which is distinct from setting it to an
//! empty string; that distinction is preserved all the way to the `execve`
//! call. Keys are never case-folded.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;

use hatch_common::{SpawnError, SpawnResult};

/// Environment overrides applied on top of (or instead of) the parent
/// environment.
#[derive(Debug, Clone, Default)]
pub struct EnvPlan {
    overrides: Vec<(String, Option<String>)>,
    unset_others: bool,
}

impl EnvPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value` in the child.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.overrides.push((key.into(), Some(value.into())));
    }

    /// Unset `key` in the child, even if the parent exports it.
    pub fn unset(&mut self, key: impl Into<String>) {
        self.overrides.push((key.into(), None));
    }

    /// When true, the child starts from an empty environment and receives
    /// only the overrides.
    pub fn set_unset_others(&mut self, unset_others: bool) {
        self.unset_others = unset_others;
    }

    pub fn unset_others(&self) -> bool {
        self.unset_others
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty() && !self.unset_others
    }

    /// Pure validation: keys must be non-empty and must not contain `=` or
    /// NUL; values must not contain NUL.
    pub fn validate(&self) -> SpawnResult<()> {
        for (key, value) in &self.overrides {
            if key.is_empty() {
                return Err(SpawnError::configuration("environment key is empty"));
            }
            if key.contains('=') {
                return Err(SpawnError::configuration(format!(
                    "environment key {key:?} contains '='"
                )));
            }
            if key.as_bytes().contains(&0)
                || value.as_deref().is_some_and(|v| v.as_bytes().contains(&0))
            {
                return Err(SpawnError::configuration(
                    "environment entry contains a NUL byte",
                ));
            }
        }
        Ok(())
    }

    /// Compute the final `KEY=VALUE` table for the child. Later overrides of
    /// the same key win. Parent entries whose names are not valid UTF-8 are
    /// carried through untouched when `unset_others` is false.
    pub fn resolve(&self) -> SpawnResult<Vec<CString>> {
        self.validate()?;

        let mut table: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        if !self.unset_others {
            for (key, value) in std::env::vars_os() {
                table.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
            }
        }
        for (key, value) in &self.overrides {
            match value {
                Some(v) => {
                    table.insert(key.as_bytes().to_vec(), v.as_bytes().to_vec());
                }
                None => {
                    table.remove(key.as_bytes());
                }
            }
        }

        let mut rendered = Vec::with_capacity(table.len());
        for (key, value) in table {
            let mut entry = key;
            entry.push(b'=');
            entry.extend_from_slice(&value);
            let entry = CString::new(entry).map_err(|_| {
                SpawnError::configuration("environment entry contains a NUL byte")
            })?;
            rendered.push(entry);
        }
        Ok(rendered)
    }

    /// The value of `key` as the child will see it: the override if one
    /// exists, otherwise the parent's value unless `unset_others` is set.
    pub(crate) fn effective_value(&self, key: &str) -> Option<String> {
        for (k, v) in self.overrides.iter().rev() {
            if k == key {
                return v.clone();
            }
        }
        if self.unset_others {
            None
        } else {
            std::env::var(key).ok()
        }
    }
}
