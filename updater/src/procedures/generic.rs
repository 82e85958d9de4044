// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial rolling update of a redundant multi-instance service.
//!
//! Instances are taken out of service DNS one at a time, reprovisioned,
//! and put back, so the remaining instances keep serving throughout.  The
//! same pipeline also drives rollback-service changes; the only difference
//! is that rollback restores the boot script saved by the forward update
//! instead of pushing the image's.

use crate::steps::Steps;
use crate::{ProcedureError, StepContext, UpdateEnv};
use slog::info;

pub(super) async fn execute(
    env: &UpdateEnv,
    ctx: &mut StepContext,
    rollback: bool,
) -> Result<(), ProcedureError> {
    let steps = Steps::new(env);
    steps.ensure_no_failure_lock().await?;

    let domain = ctx.service_domain(&env.dns_suffix);
    let instances: Vec<_> =
        ctx.change.real_instances().cloned().collect();
    if instances.is_empty() {
        return Err(ProcedureError::Validation(format!(
            "service \"{}\" has no instance to update",
            ctx.change.service
        )));
    }
    ctx.ha = instances.len() > 1;

    if rollback {
        steps.restore_boot_scripts(ctx).await?;
    } else {
        steps.update_boot_scripts(ctx).await?;
    }
    steps.install_image_on_servers(ctx).await?;

    for instance in &instances {
        steps.set_dns_membership(&domain, instance, false).await?;
        steps.reprovision_and_wait(instance, ctx.change.image).await?;
        steps.set_dns_membership(&domain, instance, true).await?;
    }

    info!(
        env.log, "{} complete",
        if rollback { "rollback" } else { "rolling update" };
        "service" => &ctx.change.service,
        "instances" => instances.len(),
    );
    Ok(())
}
