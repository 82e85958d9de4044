// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reading and steering the administrative state of a replicated database
//! shard from outside, via `shardctl` on a live member.
//!
//! This crate never speaks the replication protocol itself.  It runs the
//! shard's own admin tool through the remote executor, normalizes the two
//! output formats in the field into [`ShardState`], and provides the
//! role-readiness waiter the update procedures drive.

use cpadm_common::poll::{
    poll_until, CondCheckError, PollError, TimeoutError, POLL_INTERVAL,
    SHARD_POLL_MAX_ATTEMPTS,
};
use cpadm_types::{Instance, PgStatus, ReplStatus, ShardRole, ShardState};
use remote_exec::{RemoteExecError, RemoteExecutor};
use slog::{debug, info, Logger};
use slog_error_chain::SlogInlineError;
use std::sync::Arc;
use std::time::Duration;

/// Path of the shard administration tool inside a keydb zone.
const SHARDCTL: &str = "/opt/cp/keydb/bin/shardctl";

/// How long one `shardctl` invocation may take end to end.
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

// Stderr prefixes that make freeze/unfreeze idempotent.
const ALREADY_FROZEN: &str = "shardctl: shard is already frozen";
const NOT_FROZEN: &str = "shardctl: shard is not frozen";

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ShardAdminError {
    #[error(transparent)]
    Exec(#[from] RemoteExecError),

    #[error("failed to parse shardctl output from {zonename}")]
    Parse {
        zonename: String,
        #[source]
        err: anyhow::Error,
    },
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ShardWaitError {
    /// Terminal: a deposed peer requires a manual rebuild, so the wait
    /// aborts immediately instead of burning its attempt budget.
    #[error(
        "shard peer(s) {} deposed after a failed promotion; rebuild the \
         peer(s) manually (`shardctl rebuild`) before re-running the update",
        .peers.join(", ")
    )]
    Deposed { peers: Vec<String> },

    #[error(transparent)]
    Admin(#[from] ShardAdminError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

/// Whether a role should be serving or out of the topology.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DesiredState {
    Enabled,
    Disabled,
}

impl std::fmt::Display for DesiredState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DesiredState::Enabled => write!(f, "enabled"),
            DesiredState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Handle for administering one shard through a live member.
#[derive(Clone)]
pub struct ShardAdmin {
    exec: Arc<dyn RemoteExecutor>,
    log: Logger,
}

impl ShardAdmin {
    pub fn new(exec: Arc<dyn RemoteExecutor>, log: &Logger) -> ShardAdmin {
        ShardAdmin {
            exec,
            log: log.new(slog::o!("component" => "ShardAdmin")),
        }
    }

    fn shardctl_command(member: &Instance, args: &str) -> String {
        format!("/usr/sbin/zlogin {} {} {}", member.zonename, SHARDCTL, args)
    }

    /// Reads the shard topology as seen from `member`.
    ///
    /// Tries the machine-readable `peers` form first; older shard images
    /// only know `status`, whose table we parse instead.
    pub async fn read_state(
        &self,
        member: &Instance,
    ) -> Result<ShardState, ShardAdminError> {
        let modern =
            Self::shardctl_command(member, "peers -H -o role,peer,pg,repl");
        let output =
            self.exec.exec(&member.server, &modern, EXEC_TIMEOUT).await?;
        if output.success() {
            return ShardState::parse_fields(&output.stdout).map_err(|err| {
                ShardAdminError::Parse {
                    zonename: member.zonename.clone(),
                    err,
                }
            });
        }

        debug!(
            self.log,
            "shardctl does not support machine-readable output; \
             falling back to the status table";
            "zonename" => &member.zonename,
        );
        let legacy = Self::shardctl_command(member, "status");
        let output = self
            .exec
            .exec(&member.server, &legacy, EXEC_TIMEOUT)
            .await?
            .check_status(&member.server, &legacy)?;
        ShardState::parse_table(&output.stdout).map_err(|err| {
            ShardAdminError::Parse { zonename: member.zonename.clone(), err }
        })
    }

    /// Pins the shard's write topology so automatic failover cannot fight
    /// the update.  Freezing an already-frozen shard is a no-op.
    pub async fn freeze(
        &self,
        member: &Instance,
        reason: &str,
    ) -> Result<(), ShardAdminError> {
        info!(
            self.log, "freezing shard write topology";
            "via" => &member.zonename,
            "reason" => reason,
        );
        let command = Self::shardctl_command(
            member,
            &format!("freeze -r '{}'", reason),
        );
        let output =
            self.exec.exec(&member.server, &command, EXEC_TIMEOUT).await?;
        if output.success() || output.stderr.starts_with(ALREADY_FROZEN) {
            Ok(())
        } else {
            Err(remote_exec::output_to_exec_error(
                &member.server,
                &command,
                &output,
            )
            .into())
        }
    }

    /// Releases the write topology.  Unfreezing a shard that is not frozen
    /// is a no-op.
    pub async fn unfreeze(
        &self,
        member: &Instance,
    ) -> Result<(), ShardAdminError> {
        info!(
            self.log, "unfreezing shard write topology";
            "via" => &member.zonename,
        );
        let command = Self::shardctl_command(member, "unfreeze");
        let output =
            self.exec.exec(&member.server, &command, EXEC_TIMEOUT).await?;
        if output.success() || output.stderr.starts_with(NOT_FROZEN) {
            Ok(())
        } else {
            Err(remote_exec::output_to_exec_error(
                &member.server,
                &command,
                &output,
            )
            .into())
        }
    }

    /// Blocks until `role` reaches `desired` readiness, polling the
    /// topology through `member`.
    ///
    /// `peer` narrows a `(Async, Disabled)` wait to one specific peer.  A
    /// deposed peer observed on any poll aborts the wait with
    /// [`ShardWaitError::Deposed`].
    pub async fn wait_for_role(
        &self,
        member: &Instance,
        role: ShardRole,
        desired: DesiredState,
        peer: Option<&str>,
    ) -> Result<(), ShardWaitError> {
        info!(
            self.log, "waiting for shard role readiness";
            "role" => %role,
            "desired" => %desired,
            "peer" => peer.unwrap_or("-"),
            "via" => &member.zonename,
        );
        let condition = format!(
            "shard role {role} to become {desired} (via {})",
            member.zonename
        );
        let peer = peer.map(str::to_string);
        let result = poll_until(
            &condition,
            POLL_INTERVAL,
            SHARD_POLL_MAX_ATTEMPTS,
            || {
                let admin = self.clone();
                let member = member.clone();
                let peer = peer.clone();
                async move {
                    let state = admin
                        .read_state(&member)
                        .await
                        .map_err(ShardWaitError::Admin)
                        .map_err(CondCheckError::Failed)?;
                    if !state.deposed.is_empty() {
                        let peers = state
                            .deposed
                            .iter()
                            .map(|p| p.peer.clone())
                            .collect();
                        return Err(CondCheckError::Failed(
                            ShardWaitError::Deposed { peers },
                        ));
                    }
                    if role_ready(&state, role, desired, peer.as_deref()) {
                        Ok(())
                    } else {
                        Err(CondCheckError::NotYet)
                    }
                }
            },
        )
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Timeout(err)) => Err(err.into()),
            Err(PollError::Fatal(err)) => Err(err),
        }
    }
}

/// Role-specific readiness classification, as a pure function of one
/// observed topology.
pub fn role_ready(
    state: &ShardState,
    role: ShardRole,
    desired: DesiredState,
    peer: Option<&str>,
) -> bool {
    let up = |p: &cpadm_types::PeerState| p.pg_status == PgStatus::Ok;
    match (role, desired) {
        (ShardRole::Primary, DesiredState::Disabled) => {
            !state.primary.as_ref().is_some_and(up)
        }
        (ShardRole::Primary, DesiredState::Enabled) => {
            state.primary.as_ref().is_some_and(up)
        }
        (ShardRole::Sync, DesiredState::Disabled) => {
            !state.sync.as_ref().is_some_and(up)
        }
        (ShardRole::Sync, DesiredState::Enabled) => {
            // The sync is only usable once the primary is streaming to it
            // synchronously, i.e. the new sync has caught up.
            state.sync.as_ref().is_some_and(up)
                && state
                    .primary
                    .as_ref()
                    .is_some_and(|p| p.repl_status == ReplStatus::Sync)
        }
        (ShardRole::Async, DesiredState::Disabled) => match peer {
            Some(abbr) => !state
                .async_peers
                .iter()
                .find(|p| p.peer == abbr)
                .is_some_and(up),
            None => !state.async_peers.iter().any(up),
        },
        (ShardRole::Async, DesiredState::Enabled) => {
            // Every async peer serving, and the replication chain intact:
            // sync streams async to the first async peer, and each async
            // peer but the last streams async downstream.
            let chain_intact = state
                .sync
                .as_ref()
                .is_some_and(|s| s.repl_status == ReplStatus::Async)
                && state
                    .async_peers
                    .iter()
                    .rev()
                    .skip(1)
                    .all(|p| p.repl_status == ReplStatus::Async);
            !state.async_peers.is_empty()
                && state.async_peers.iter().all(up)
                && chain_intact
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpadm_types::PeerState;
    use remote_exec::fakes::ScriptedExecutor;
    use remote_exec::ExecOutput;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn peer(abbr: &str, pg: &str, repl: &str) -> PeerState {
        let line = format!("async|{abbr}|{pg}|{repl}");
        let state = ShardState::parse_fields(&line).unwrap();
        state.async_peers.into_iter().next().unwrap()
    }

    fn member() -> Instance {
        Instance {
            zonename: "11111111aaaa".to_string(),
            alias: "keydb0".to_string(),
            server: "server-0".to_string(),
            image: Uuid::new_v4(),
            ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10))),
            role: None,
        }
    }

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    /// The healthy three-peer topology most classification cases start
    /// from.
    fn healthy_state() -> ShardState {
        ShardState {
            primary: Some(peer("11111111", "ok", "sync")),
            sync: Some(peer("22222222", "ok", "async")),
            async_peers: vec![peer("33333333", "ok", "-")],
            deposed: vec![],
        }
    }

    #[test]
    fn classifies_role_readiness() {
        use DesiredState::{Disabled, Enabled};
        use ShardRole::{Async, Primary, Sync};

        let healthy = healthy_state();
        assert!(role_ready(&healthy, Primary, Enabled, None));
        assert!(!role_ready(&healthy, Primary, Disabled, None));
        assert!(role_ready(&healthy, Sync, Enabled, None));
        assert!(role_ready(&healthy, Async, Enabled, None));
        assert!(!role_ready(&healthy, Async, Disabled, None));

        // Async peer down: async no longer enabled, and its targeted
        // disabled wait is satisfied.
        let mut state = healthy_state();
        state.async_peers[0] = peer("33333333", "-", "-");
        assert!(!role_ready(&state, Async, Enabled, None));
        assert!(role_ready(&state, Async, Disabled, Some("33333333")));
        assert!(role_ready(&state, Async, Disabled, None));

        // Sync present but primary still streaming async: the new sync has
        // not caught up, so sync is not enabled yet.
        let mut state = healthy_state();
        state.primary = Some(peer("11111111", "ok", "async"));
        assert!(!role_ready(&state, Sync, Enabled, None));

        // Sync gone entirely.
        let mut state = healthy_state();
        state.sync = None;
        assert!(role_ready(&state, Sync, Disabled, None));
        assert!(!role_ready(&state, Sync, Enabled, None));
        assert!(!role_ready(&state, Async, Enabled, None));

        // Primary absent mid-update.
        let mut state = healthy_state();
        state.primary = None;
        assert!(role_ready(&state, Primary, Disabled, None));
        assert!(!role_ready(&state, Primary, Enabled, None));
    }

    #[test]
    fn async_chain_must_be_intact() {
        // Two async peers: the first must stream async downstream, the
        // last is the end of the chain.
        let mut state = healthy_state();
        state.sync = Some(peer("22222222", "ok", "async"));
        state.async_peers = vec![
            peer("33333333", "ok", "async"),
            peer("44444444", "ok", "-"),
        ];
        assert!(role_ready(
            &state,
            ShardRole::Async,
            DesiredState::Enabled,
            None
        ));

        // Break the middle of the chain.
        state.async_peers[0] = peer("33333333", "ok", "-");
        assert!(!role_ready(
            &state,
            ShardRole::Async,
            DesiredState::Enabled,
            None
        ));
    }

    #[tokio::test]
    async fn falls_back_to_the_legacy_table() {
        let exec = Arc::new(ScriptedExecutor::new(|_, command| {
            if command.contains("peers -H") {
                Ok(ExecOutput::failed(2, "shardctl: unknown command peers"))
            } else if command.contains("status") {
                Ok(ExecOutput::ok(
                    "ROLE     PEER      PG  REPL\n\
                     primary  11111111  ok  sync\n\
                     sync     22222222  ok  -\n",
                ))
            } else {
                panic!("unexpected command {command}");
            }
        }));
        let admin = ShardAdmin::new(exec.clone(), &logger());
        let state = admin.read_state(&member()).await.unwrap();
        assert_eq!(state.primary.unwrap().peer, "11111111");
        assert_eq!(exec.calls().len(), 2);
    }

    #[tokio::test]
    async fn freeze_is_idempotent() {
        let exec = Arc::new(ScriptedExecutor::new(|_, _| {
            Ok(ExecOutput::failed(
                1,
                "shardctl: shard is already frozen (since 2026-08-12)",
            ))
        }));
        let admin = ShardAdmin::new(exec, &logger());
        admin.freeze(&member(), "cpadm update").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deposed_peer_aborts_the_wait_within_one_poll() {
        static POLLS: AtomicUsize = AtomicUsize::new(0);
        let exec = Arc::new(ScriptedExecutor::new(|_, _| {
            POLLS.fetch_add(1, Ordering::SeqCst);
            Ok(ExecOutput::ok(
                "primary|11111111|ok|sync\n\
                 sync|22222222|ok|-\n\
                 deposed|33333333|down|-\n",
            ))
        }));
        let admin = ShardAdmin::new(exec, &logger());
        let start = tokio::time::Instant::now();
        let err = admin
            .wait_for_role(
                &member(),
                ShardRole::Async,
                DesiredState::Enabled,
                None,
            )
            .await
            .unwrap_err();
        match err {
            ShardWaitError::Deposed { peers } => {
                assert_eq!(peers, vec!["33333333".to_string()]);
            }
            other => panic!("expected deposed, got {other}"),
        }
        assert_eq!(POLLS.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_its_budget() {
        let exec = Arc::new(ScriptedExecutor::new(|_, _| {
            Ok(ExecOutput::ok("primary|11111111|ok|-\nsync|22222222|down|-\n"))
        }));
        let admin = ShardAdmin::new(exec, &logger());
        let start = tokio::time::Instant::now();
        let err = admin
            .wait_for_role(
                &member(),
                ShardRole::Sync,
                DesiredState::Enabled,
                None,
            )
            .await
            .unwrap_err();
        match err {
            ShardWaitError::Timeout(err) => {
                assert_eq!(err.attempts, 180);
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(900));
    }
}
