// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blue/green update of a stateless singleton.
//!
//! A shadow instance running the *current* image is stood up next to the
//! target and registered in service DNS so the service stays reachable
//! while the real instance is torn down and reprovisioned.  Only once the
//! updated instance is back, healthy, and resolvable is the shadow removed.
//!
//! If the reprovision fails, the shadow stays up and keeps serving; the
//! pipeline surfaces the error with the shadow still in DNS so the outage
//! window stays closed while the operator investigates.

use crate::steps::Steps;
use crate::{ProcedureError, StepContext, UpdateEnv};
use slog::info;

pub(super) async fn execute(
    env: &UpdateEnv,
    ctx: &mut StepContext,
) -> Result<(), ProcedureError> {
    let steps = Steps::new(env);
    steps.ensure_no_failure_lock().await?;

    let target = ctx
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
    let domain = ctx.service_domain(&env.dns_suffix);

    steps.purge_stale_shadows(ctx).await?;
    steps.update_boot_scripts(ctx).await?;
    steps.install_image_on_servers(ctx).await?;

    steps.create_shadow(ctx, &target, &domain).await?;
    steps.set_dns_membership(&domain, &target, false).await?;
    steps.reprovision_and_wait(&target, ctx.change.image).await?;
    steps.set_dns_membership(&domain, &target, true).await?;
    steps.destroy_shadow(ctx, &domain).await?;

    info!(
        env.log, "blue/green update complete";
        "service" => &ctx.change.service,
        "alias" => &target.alias,
    );
    Ok(())
}
