// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling update of the coordination ensemble.
//!
//! Followers are reprovisioned first, in parallel (each is independent of
//! the others), and the leader goes last so the batch forces at most one
//! election.  After each phase the procedure waits for the ensemble to
//! re-form and answer liveness probes.  A single standalone node has no
//! rejoin to observe, so those waits are skipped.

use crate::steps::Steps;
use crate::{ProcedureError, StepContext, UpdateEnv};
use cpadm_common::fanout::{fanout, DEFAULT_MAX_PARALLELISM};
use cpadm_types::{EnsembleMode, Instance};
use ensemble_admin::EnsembleAdmin;
use slog::info;
use std::net::IpAddr;
use std::time::Duration;

/// Grace period after a node's reprovision before its sibling probes are
/// trusted.  A freshly booted node answers probes before it has settled
/// into its final mode.
const SETTLE_DELAY: Duration = Duration::from_secs(60);

pub(super) async fn execute(
    env: &UpdateEnv,
    ctx: &mut StepContext,
) -> Result<(), ProcedureError> {
    let steps = Steps::new(env);
    steps.ensure_no_failure_lock().await?;

    discover(env, ctx).await?;
    let image = ctx.change.image;
    let ips = node_ips(ctx)?;

    steps.update_boot_scripts(ctx).await?;
    steps.install_image_on_servers(ctx).await?;

    let followers = ctx.followers.clone();
    info!(
        env.log, "reprovisioning ensemble followers";
        "count" => followers.len(),
    );
    let tasks = followers.into_iter().map(|follower| {
        let env = env.clone();
        async move {
            let steps = Steps::new(&env);
            steps.reprovision_and_wait(&follower, image).await?;
            tokio::time::sleep(SETTLE_DELAY).await;
            Ok::<(), ProcedureError>(())
        }
    });
    fanout(DEFAULT_MAX_PARALLELISM, tasks).await?;

    if !ctx.standalone {
        env.ensemble.wait_until_joined(&ips).await?;
        env.ensemble.wait_until_healthy(&ips).await?;
    }

    if let Some(leader) = ctx.leader.clone() {
        info!(
            env.log, "reprovisioning ensemble leader";
            "alias" => &leader.alias,
        );
        steps.reprovision_and_wait(&leader, image).await?;
        tokio::time::sleep(SETTLE_DELAY).await;
        env.ensemble.wait_until_joined(&ips).await?;
        env.ensemble.wait_until_healthy(&ips).await?;
    }

    info!(
        env.log, "ensemble update complete";
        "service" => &ctx.change.service,
        "nodes" => ips.len(),
    );
    Ok(())
}

/// Probes every node's mode and splits the change into leader and
/// followers.  A multi-node ensemble must be fully formed before the
/// update starts; a single node running standalone is updated alone with
/// no rejoin wait.
async fn discover(
    env: &UpdateEnv,
    ctx: &mut StepContext,
) -> Result<(), ProcedureError> {
    let nodes: Vec<Instance> =
        ctx.change.real_instances().cloned().collect();
    if nodes.is_empty() {
        return Err(ProcedureError::Validation(format!(
            "service \"{}\" has no instance to update",
            ctx.change.service
        )));
    }
    let ips = node_ips(ctx)?;
    let states = env.ensemble.read_modes(&ips).await;

    if nodes.len() == 1 {
        ctx.standalone = true;
        ctx.leader = None;
        ctx.followers = nodes;
        return Ok(());
    }

    if !EnsembleAdmin::is_joined(&states) {
        return Err(ProcedureError::Validation(format!(
            "ensemble \"{}\" is not fully formed (modes: {:?}); wait for \
             it to settle before updating",
            ctx.change.service,
            states.iter().map(|s| s.mode).collect::<Vec<_>>(),
        )));
    }

    let leader_ip = states
        .iter()
        .find(|s| s.mode == EnsembleMode::Leader)
        .map(|s| s.ip);
    let (leaders, followers): (Vec<Instance>, Vec<Instance>) =
        nodes.into_iter().partition(|i| i.ip == leader_ip);
    ctx.leader = leaders.into_iter().next();
    ctx.followers = followers;
    info!(
        env.log, "discovered ensemble topology";
        "leader" => ctx.leader.as_ref().map(|i| i.alias.clone()),
        "followers" => ctx.followers.len(),
    );
    Ok(())
}

fn node_ips(ctx: &StepContext) -> Result<Vec<IpAddr>, ProcedureError> {
    ctx.change
        .real_instances()
        .map(|i| {
            i.ip.ok_or_else(|| {
                ProcedureError::Validation(format!(
                    "ensemble node {} ({}) has no admin IP",
                    i.alias, i.zonename
                ))
            })
        })
        .collect()
}
