// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling update of a replicated database shard.
//!
//! Members are updated strictly from the tail of the replication chain
//! toward its head: every async peer first, then the sync, then the
//! primary.  The write topology is frozen for the whole dance so the shard
//! manager cannot reshuffle roles mid-update, and after each member comes
//! back the procedure waits for its role to be re-enabled before touching
//! the next one.
//!
//! Taking the primary down hands its role to the old sync, and the old
//! primary rejoins downstream once it comes back.  The final convergence
//! is therefore observed through the old sync member, and the unfreeze is
//! issued through it as well.

use crate::steps::Steps;
use crate::{ProcedureError, ShardRoles, StepContext, UpdateEnv};
use cpadm_types::{Instance, ShardRole};
use shard_admin::{DesiredState, ShardWaitError};
use slog::info;

pub(super) async fn execute(
    env: &UpdateEnv,
    ctx: &mut StepContext,
) -> Result<(), ProcedureError> {
    let steps = Steps::new(env);
    steps.ensure_no_failure_lock().await?;

    let roles = discover(env, ctx).await?;
    let image = ctx.change.image;
    let freeze_reason = format!("cpadm update to image {image}");

    steps.update_boot_scripts(ctx).await?;
    steps.install_image_on_servers(ctx).await?;

    // The freeze is idempotent, so it is re-asserted before each phase in
    // case a previous partial run already released it.
    steps.freeze_shard(ctx, &roles.primary, &freeze_reason).await?;
    for peer in &roles.async_peers {
        steps.reprovision_and_wait(peer, image).await?;
        env.shard
            .wait_for_role(
                &roles.primary,
                ShardRole::Async,
                DesiredState::Enabled,
                None,
            )
            .await?;
    }

    steps.freeze_shard(ctx, &roles.primary, &freeze_reason).await?;
    steps.reprovision_and_wait(&roles.sync, image).await?;
    env.shard
        .wait_for_role(
            &roles.primary,
            ShardRole::Sync,
            DesiredState::Enabled,
            Some(roles.sync.peer_abbr()),
        )
        .await?;

    steps.freeze_shard(ctx, &roles.primary, &freeze_reason).await?;
    steps.reprovision_and_wait(&roles.primary, image).await?;

    // The old primary is gone; from here on the old sync (now taking over
    // as primary) is the observation point.
    let observer = &roles.sync;
    env.shard
        .wait_for_role(
            observer,
            ShardRole::Primary,
            DesiredState::Enabled,
            None,
        )
        .await?;
    if roles.async_peers.is_empty() {
        env.shard
            .wait_for_role(
                observer,
                ShardRole::Sync,
                DesiredState::Enabled,
                None,
            )
            .await?;
    } else {
        env.shard
            .wait_for_role(
                observer,
                ShardRole::Async,
                DesiredState::Enabled,
                None,
            )
            .await?;
    }
    steps.unfreeze_shard(ctx, observer).await?;

    info!(
        env.log, "shard update complete";
        "service" => &ctx.change.service,
        "members" => ctx.change.real_instances().count(),
    );
    Ok(())
}

/// Reads the shard topology through one member and maps each role onto the
/// change's instances.  `async_peers` preserves the replication-chain
/// order reported by the shard manager.
async fn discover(
    env: &UpdateEnv,
    ctx: &mut StepContext,
) -> Result<ShardRoles, ProcedureError> {
    let probe = ctx
        .change
        .real_instances()
        .next()
        .cloned()
        .ok_or_else(|| {
            ProcedureError::Validation(format!(
                "service \"{}\" has no instance to update",
                ctx.change.service
            ))
        })?;
    let state = env.shard.read_state(&probe).await?;
    if !state.deposed.is_empty() {
        return Err(ShardWaitError::Deposed {
            peers: state.deposed.iter().map(|p| p.peer.clone()).collect(),
        }
        .into());
    }

    let by_peer = |peer: &str| -> Result<Instance, ProcedureError> {
        ctx.change
            .real_instances()
            .find(|i| i.peer_abbr() == peer)
            .cloned()
            .ok_or_else(|| {
                ProcedureError::Validation(format!(
                    "shard peer \"{peer}\" has no matching instance in \
                     this change"
                ))
            })
    };

    let primary = match &state.primary {
        Some(p) => {
            let mut instance = by_peer(&p.peer)?;
            instance.role = Some(ShardRole::Primary);
            instance
        }
        None => {
            return Err(ProcedureError::Validation(
                "shard has no primary; resolve the shard state before \
                 updating"
                    .to_string(),
            ));
        }
    };
    let sync = match &state.sync {
        Some(s) => {
            let mut instance = by_peer(&s.peer)?;
            instance.role = Some(ShardRole::Sync);
            instance
        }
        None => {
            return Err(ProcedureError::Update(format!(
                "shard \"{}\" has no sync member; this looks like an \
                 incomplete HA setup, which this tool cannot update",
                ctx.change.service
            )));
        }
    };
    let mut async_peers = Vec::with_capacity(state.async_peers.len());
    for p in &state.async_peers {
        let mut instance = by_peer(&p.peer)?;
        instance.role = Some(ShardRole::Async);
        async_peers.push(instance);
    }

    info!(
        env.log, "discovered shard topology";
        "primary" => &primary.alias,
        "sync" => &sync.alias,
        "async_peers" => async_peers.len(),
    );
    ctx.ha = true;
    let roles = ShardRoles { primary, sync, async_peers };
    ctx.shard = Some(roles.clone());
    Ok(roles)
}
