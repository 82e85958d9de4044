// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Production [`RemoteExecutor`] that shells out over SSH on the admin
//! network.

use crate::{ExecOutput, RemoteExecError, RemoteExecutor};
use async_trait::async_trait;
use camino::Utf8PathBuf;
use slog::{debug, Logger};
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug)]
pub struct SshExecutor {
    ssh_path: Utf8PathBuf,
    user: String,
    log: Logger,
}

impl SshExecutor {
    pub fn new(log: &Logger) -> SshExecutor {
        SshExecutor::with_ssh_path("/usr/bin/ssh".into(), log)
    }

    pub fn with_ssh_path(ssh_path: Utf8PathBuf, log: &Logger) -> SshExecutor {
        SshExecutor {
            ssh_path,
            user: "root".to_string(),
            log: log.new(slog::o!("component" => "SshExecutor")),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn exec(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, RemoteExecError> {
        debug!(
            self.log, "running remote command";
            "target" => target,
            "command" => command,
        );

        let mut cmd = Command::new(&self.ssh_path);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)))
            .arg(format!("{}@{}", self.user, target))
            .arg(command);

        let run = async {
            cmd.output().await.map_err(|err| {
                RemoteExecError::Unreachable {
                    target: target.to_string(),
                    err,
                }
            })
        };
        let output = match tokio::time::timeout(timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(RemoteExecError::AgentTimeout {
                    target: target.to_string(),
                    timeout,
                });
            }
        };

        // An SSH-level failure (unreachable host, auth refused) comes back
        // as exit status 255 with nothing on stdout; everything else is the
        // remote command's own result, which the caller interprets.
        let exit_status = output.status.code().unwrap_or(-1);
        if exit_status == 255 && output.stdout.is_empty() {
            return Err(RemoteExecError::Unreachable {
                target: target.to_string(),
                err: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    String::from_utf8_lossy(&output.stderr).to_string(),
                ),
            });
        }

        Ok(ExecOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
