// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The update-procedure framework: the step library, the per-topology
//! update procedures, and the plan executor that drives them.
//!
//! A caller hands [`PlanExecutor`] a [`cpadm_types::Plan`]; for each change
//! a [`Procedure`] is selected from the service topology and executed as a
//! strictly ordered pipeline of steps over a per-change [`StepContext`].
//! Steps are idempotent (each no-ops when its postcondition already holds),
//! which is what makes re-running a partially failed change safe.

use camino::Utf8PathBuf;
use cpadm_common::fanout::MultiError;
use cpadm_common::poll::TimeoutError;
use registry_client::{
    ClientError, DnsClient, HealthClient, InventoryClient, ResolveError,
};
use remote_exec::{RemoteExecError, RemoteExecutor};
use shard_admin::{ShardAdmin, ShardAdminError, ShardWaitError};
use slog::Logger;
use slog_error_chain::SlogInlineError;
use std::sync::Arc;

mod bootscript;
mod context;
mod executor;
mod lockfile;
mod procedures;
mod steps;
mod waiters;

pub use context::{ShardRoles, StepContext};
pub use executor::{PlanExecutor, PlanOutcome};
pub use procedures::Procedure;

/// Everything a procedure needs to act on the cluster: the collaborator
/// clients, the admin handles for the stateful services, and the working
/// directory for rollback artifacts and the failure lockfile.
///
/// Cloning is cheap; fan-out branches carry their own copy.
#[derive(Clone)]
pub struct UpdateEnv {
    pub log: Logger,
    pub exec: Arc<dyn RemoteExecutor>,
    pub inventory: Arc<dyn InventoryClient>,
    pub health: Arc<dyn HealthClient>,
    pub dns: Arc<dyn DnsClient>,
    pub shard: ShardAdmin,
    pub ensemble: ensemble_admin::EnsembleAdmin,
    pub workdir: Utf8PathBuf,
    /// Suffix under which services register, e.g. `cp.example.com`; a
    /// service's domain is `<service>.<suffix>`.
    pub dns_suffix: String,
}

impl UpdateEnv {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Logger,
        exec: Arc<dyn RemoteExecutor>,
        inventory: Arc<dyn InventoryClient>,
        health: Arc<dyn HealthClient>,
        dns: Arc<dyn DnsClient>,
        probe_host: &str,
        workdir: Utf8PathBuf,
        dns_suffix: &str,
    ) -> UpdateEnv {
        let shard = ShardAdmin::new(Arc::clone(&exec), &log);
        let ensemble = ensemble_admin::EnsembleAdmin::new(
            Arc::clone(&exec),
            probe_host,
            &log,
        );
        UpdateEnv {
            log,
            exec,
            inventory,
            health,
            dns,
            shard,
            ensemble,
            workdir,
            dns_suffix: dns_suffix.to_string(),
        }
    }
}

/// Why a change's pipeline stopped.
#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ProcedureError {
    /// A precondition did not hold; nothing was touched.
    #[error("precondition violated: {0}")]
    Validation(String),

    /// A state machine could not reach its target state.
    #[error("update failed: {0}")]
    Update(String),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    RemoteExec(#[from] RemoteExecError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    ShardAdmin(#[from] ShardAdminError),

    #[error(transparent)]
    ShardWait(#[from] ShardWaitError),

    #[error(transparent)]
    Multi(#[from] MultiError),

    #[error("I/O error on {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}
