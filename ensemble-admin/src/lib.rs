// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Probing and waiting on a coordination ensemble from outside.
//!
//! The ensemble answers four-letter admin commands on its client port.  We
//! run the probes through the remote executor from a host inside the admin
//! network.  A probe that fails at any level (transport, connection
//! refused, unparseable output) reports [`EnsembleMode::Transitioning`]:
//! nodes drop their probe port while restarting, and that is an expected
//! phase of every update, not an error.

use cpadm_common::poll::{
    poll_until, CondCheckError, PollError, TimeoutError, POLL_INTERVAL,
    POLL_MAX_ATTEMPTS,
};
use cpadm_types::{EnsembleMode, EnsembleNodeState};
use remote_exec::RemoteExecutor;
use slog::{debug, info, Logger};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// The ensemble's client port, where four-letter commands are answered.
const ENSEMBLE_PORT: u16 = 2181;

/// How long one probe may take end to end.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle for probing one ensemble through a named proxy host.
#[derive(Clone)]
pub struct EnsembleAdmin {
    exec: Arc<dyn RemoteExecutor>,
    /// The admin-network host the probes run from.
    probe_host: String,
    log: Logger,
}

impl EnsembleAdmin {
    pub fn new(
        exec: Arc<dyn RemoteExecutor>,
        probe_host: &str,
        log: &Logger,
    ) -> EnsembleAdmin {
        EnsembleAdmin {
            exec,
            probe_host: probe_host.to_string(),
            log: log.new(slog::o!("component" => "EnsembleAdmin")),
        }
    }

    async fn four_letter(&self, node: IpAddr, word: &str) -> Option<String> {
        let command = format!(
            "echo {word} | /usr/bin/nc -w 5 {node} {ENSEMBLE_PORT}"
        );
        match self.exec.exec(&self.probe_host, &command, PROBE_TIMEOUT).await
        {
            Ok(output) if output.success() => Some(output.stdout),
            Ok(output) => {
                debug!(
                    self.log, "ensemble probe exited non-zero";
                    "node" => %node,
                    "word" => word,
                    "exit_status" => output.exit_status,
                );
                None
            }
            Err(err) => {
                debug!(
                    self.log, "ensemble probe failed";
                    "node" => %node,
                    "word" => word,
                    "err" => %err,
                );
                None
            }
        }
    }

    /// Reads the mode one node reports.  Never fails: an unanswerable node
    /// is transitioning.
    pub async fn read_mode(&self, node: IpAddr) -> EnsembleNodeState {
        let mode = match self.four_letter(node, "srvr").await {
            Some(stdout) => EnsembleMode::parse_srvr(&stdout),
            None => EnsembleMode::Transitioning,
        };
        EnsembleNodeState { ip: node, mode }
    }

    /// Reads the mode of every node.
    pub async fn read_modes(
        &self,
        nodes: &[IpAddr],
    ) -> Vec<EnsembleNodeState> {
        let mut states = Vec::with_capacity(nodes.len());
        for &node in nodes {
            states.push(self.read_mode(node).await);
        }
        states
    }

    /// Whether one observation of all nodes constitutes a joined ensemble:
    /// every node a leader or follower with exactly one leader, or a lone
    /// node running standalone.
    pub fn is_joined(states: &[EnsembleNodeState]) -> bool {
        match states {
            [] => false,
            [node] => matches!(
                node.mode,
                EnsembleMode::Standalone | EnsembleMode::Leader
            ),
            nodes => {
                let leaders = nodes
                    .iter()
                    .filter(|n| n.mode == EnsembleMode::Leader)
                    .count();
                leaders == 1
                    && nodes.iter().all(|n| {
                        matches!(
                            n.mode,
                            EnsembleMode::Leader | EnsembleMode::Follower
                        )
                    })
            }
        }
    }

    /// Blocks until the ensemble has (re)formed: every node reporting
    /// leader/follower (multi-node) or standalone (single node).
    pub async fn wait_until_joined(
        &self,
        nodes: &[IpAddr],
    ) -> Result<(), TimeoutError> {
        info!(
            self.log, "waiting for ensemble to re-form";
            "nodes" => ?nodes,
        );
        let result = poll_until(
            "ensemble nodes to rejoin as leader/follower",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || {
                let admin = self.clone();
                let nodes = nodes.to_vec();
                async move {
                    let states = admin.read_modes(&nodes).await;
                    if Self::is_joined(&states) {
                        Ok(())
                    } else {
                        Err(CondCheckError::<std::convert::Infallible>::NotYet)
                    }
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Timeout(err)) => Err(err),
            Err(PollError::Fatal(fatal)) => match fatal {},
        }
    }

    /// Blocks until every node answers its liveness probe (`ruok` →
    /// `imok`).
    pub async fn wait_until_healthy(
        &self,
        nodes: &[IpAddr],
    ) -> Result<(), TimeoutError> {
        info!(
            self.log, "waiting for ensemble liveness";
            "nodes" => ?nodes,
        );
        let result = poll_until(
            "every ensemble node to answer ruok",
            POLL_INTERVAL,
            POLL_MAX_ATTEMPTS,
            || {
                let admin = self.clone();
                let nodes = nodes.to_vec();
                async move {
                    for node in nodes {
                        match admin.four_letter(node, "ruok").await {
                            Some(answer) if answer.trim() == "imok" => (),
                            _ => {
                                return Err(CondCheckError::<
                                    std::convert::Infallible,
                                >::NotYet);
                            }
                        }
                    }
                    Ok(())
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Timeout(err)) => Err(err),
            Err(PollError::Fatal(fatal)) => match fatal {},
        }
    }
}
