//! Launch requests.
//!
//! A [`LaunchRequest`] bundles a command, environment plan, launch options
//! and redirections into one immutable value. It is built once, validated
//! in full before any OS resource is touched, and consumed by value by
//! [`crate::spawn`]. Repeat launches rebuild the request, which prevents
//! accidental descriptor reuse across calls.

use std::os::unix::prelude::RawFd;
use std::path::PathBuf;

use crate::command::Command;
use crate::env::EnvPlan;
use crate::options::{LaunchOptions, Pgroup, ResourceLimit, ResourceName};
use crate::redirect::{Redirections, Source};
use hatch_common::SpawnResult;

/// An immutable, fully validated description of one child launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub(crate) command: Command,
    pub(crate) env: EnvPlan,
    pub(crate) options: LaunchOptions,
    pub(crate) redirections: Redirections,
}

impl LaunchRequest {
    /// Start building a request for the given command.
    pub fn builder(command: Command) -> LaunchRequestBuilder {
        LaunchRequestBuilder {
            command,
            env: EnvPlan::new(),
            options: LaunchOptions::new(),
            redirections: Redirections::new(),
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    pub fn redirections(&self) -> &Redirections {
        &self.redirections
    }
}

/// Builder for [`LaunchRequest`]. All validation happens in [`Self::build`].
#[derive(Debug, Clone)]
pub struct LaunchRequestBuilder {
    command: Command,
    env: EnvPlan,
    options: LaunchOptions,
    redirections: Redirections,
}

impl LaunchRequestBuilder {
    /// Set an environment variable in the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.set(key, value);
        self
    }

    /// Unset an environment variable in the child (distinct from setting it
    /// to an empty string).
    pub fn unset_env(mut self, key: impl Into<String>) -> Self {
        self.env.unset(key);
        self
    }

    /// Start the child from an empty environment; only explicit `env`
    /// entries are passed.
    pub fn unset_others(mut self, unset_others: bool) -> Self {
        self.env.set_unset_others(unset_others);
        self
    }

    /// Working directory for the child.
    pub fn chdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.chdir = Some(dir.into());
        self
    }

    /// File-creation mask for the child.
    pub fn umask(mut self, umask: u32) -> Self {
        self.options.umask = Some(umask);
        self
    }

    /// Set a resource limit in the child.
    pub fn rlimit(mut self, name: ResourceName, limit: ResourceLimit) -> Self {
        self.options.rlimits.push((name, limit));
        self
    }

    /// Process-group placement.
    pub fn pgroup(mut self, pgroup: Pgroup) -> Self {
        self.options.pgroup = pgroup;
        self
    }

    /// Whether unspecified inherited descriptors are closed in the child.
    /// Defaults to true.
    pub fn close_others(mut self, close_others: bool) -> Self {
        self.options.close_others = close_others;
        self
    }

    /// Request that descriptor `target` refer to `source` in the child.
    pub fn redirect(mut self, target: RawFd, source: Source) -> Self {
        self.redirections.add(target, source);
        self
    }

    /// Validate everything and freeze the request. Runs only pure checks;
    /// no OS resource is touched, so a failure here never half-creates a
    /// process.
    pub fn build(self) -> SpawnResult<LaunchRequest> {
        self.command.validate()?;
        self.env.validate()?;
        self.options.validate()?;
        self.redirections.validate()?;
        Ok(LaunchRequest {
            command: self.command,
            env: self.env,
            options: self.options,
            redirections: self.redirections,
        })
    }
}
