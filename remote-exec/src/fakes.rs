// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scripted executors for tests.  These live in non-test code so that
//! integration tests in dependent crates can use them.

use crate::{ExecOutput, RemoteExecError, RemoteExecutor};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

/// One recorded call to a [`ScriptedExecutor`].
#[derive(Clone, Debug)]
pub struct ExecCall {
    pub target: String,
    pub command: String,
}

type Handler = Box<
    dyn Fn(&str, &str) -> Result<ExecOutput, RemoteExecError> + Send + Sync,
>;

/// A [`RemoteExecutor`] driven by a caller-provided handler, recording
/// every call it receives.
pub struct ScriptedExecutor {
    handler: Handler,
    calls: Mutex<Vec<ExecCall>>,
}

impl ScriptedExecutor {
    pub fn new<F>(handler: F) -> ScriptedExecutor
    where
        F: Fn(&str, &str) -> Result<ExecOutput, RemoteExecError>
            + Send
            + Sync
            + 'static,
    {
        ScriptedExecutor { handler: Box::new(handler), calls: Mutex::new(Vec::new()) }
    }

    /// An executor on which every command succeeds with empty output.
    pub fn always_ok() -> ScriptedExecutor {
        ScriptedExecutor::new(|_, _| Ok(ExecOutput::ok("")))
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The commands recorded so far, for order assertions.
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.command.clone()).collect()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn exec(
        &self,
        target: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, RemoteExecError> {
        self.calls.lock().unwrap().push(ExecCall {
            target: target.to_string(),
            command: command.to_string(),
        });
        (self.handler)(target, command)
    }
}

impl ExecOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// A command-level failure with the given exit status and stderr.
    pub fn failed(exit_status: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}
