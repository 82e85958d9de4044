// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running privileged commands on cluster hosts over the admin network.
//!
//! The [`RemoteExecutor`] trait is the single seam between the update
//! engine and whatever transport actually reaches a host.  The production
//! implementation shells out over SSH; tests script their own (see
//! [`fakes`]).
//!
//! A command that runs and exits non-zero is *data*, not an error: callers
//! get the [`ExecOutput`] back and decide.  Only transport-level problems
//! (host unreachable, agent timeout) surface as [`RemoteExecError`].

use async_trait::async_trait;
use slog_error_chain::SlogInlineError;
use std::time::Duration;

pub mod fakes;
mod ssh;

pub use ssh::SshExecutor;

/// What a remote command produced.
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    /// Converts a command-level failure into a [`RemoteExecError`], for the
    /// common case where the caller has no use for a non-zero exit.
    pub fn check_status(
        self,
        target: &str,
        command: &str,
    ) -> Result<ExecOutput, RemoteExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(output_to_exec_error(target, command, &self))
        }
    }
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub target: String,
    pub command: String,
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "command [{}] on host {} exited {}",
            self.command, self.target, self.exit_status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum RemoteExecError {
    #[error("failed to reach host {target}")]
    Unreachable {
        target: String,
        #[source]
        err: std::io::Error,
    },

    #[error("agent on host {target} did not answer within {timeout:?}")]
    AgentTimeout { target: String, timeout: Duration },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),
}

pub fn output_to_exec_error(
    target: &str,
    command: &str,
    output: &ExecOutput,
) -> RemoteExecError {
    RemoteExecError::CommandFailure(Box::new(CommandFailureInfo {
        target: target.to_string(),
        command: command.to_string(),
        exit_status: output.exit_status,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    }))
}

/// Runs one privileged command on one named host.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Executes `command` on `target`, waiting at most `timeout` for the
    /// agent to come back with the result.  No retries: callers decide.
    async fn exec(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteExecError>;
}
