// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The step library: idempotent stages the procedures compose.
//!
//! Every step checks its postcondition first and no-ops when it already
//! holds: the boot-script push is skipped when nothing changed, and a
//! reprovision is skipped when the instance already runs the target image.
//! That is what makes a whole change safe to re-run after a partial
//! failure.

use crate::waiters;
use crate::{bootscript, lockfile};
use crate::{ProcedureError, StepContext, UpdateEnv};
use cpadm_common::fanout::{fanout, DEFAULT_MAX_PARALLELISM};
use cpadm_types::{shadow_alias, Instance};
use registry_client::{CreateParams, VmState};
use remote_exec::RemoteExecError;
use slog::{debug, info, Logger};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// How long an image import on a server may take.
const IMAGE_IMPORT_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) struct Steps {
    env: UpdateEnv,
}

impl Steps {
    pub fn new(env: &UpdateEnv) -> Steps {
        Steps { env: env.clone() }
    }

    fn log(&self) -> &Logger {
        &self.env.log
    }

    /// Short-circuits the pipeline if a previous reprovision failure is on
    /// record.
    pub async fn ensure_no_failure_lock(&self) -> Result<(), ProcedureError> {
        lockfile::check(&self.env.workdir).await
    }

    /// Pushes the target image's boot script to the service record and to
    /// every affected instance, persisting the previous content for
    /// rollback first.  No-op when the script is already current.
    pub async fn update_boot_scripts(
        &self,
        ctx: &StepContext,
    ) -> Result<(), ProcedureError> {
        let change = &ctx.change;
        let Some(desired) =
            self.env.inventory.get_image_boot_script(change.image).await?
        else {
            debug!(
                self.log(), "image ships no boot script";
                "image" => %change.image,
            );
            return Ok(());
        };
        let current = self
            .env
            .inventory
            .get_service_boot_script(&change.service)
            .await?;
        if current.as_deref() == Some(desired.as_str()) {
            debug!(
                self.log(), "boot script unchanged; skipping push";
                "service" => &change.service,
            );
            return Ok(());
        }

        if let Some(previous) = &current {
            // Key the artifact by the image the service runs now, which is
            // the image a rollback-service change would move back to.
            if let Some(instance) = change.real_instances().next() {
                let path = bootscript::save(
                    &self.env.workdir,
                    &change.service,
                    &instance.image,
                    previous,
                )
                .await?;
                debug!(
                    self.log(), "saved previous boot script";
                    "path" => %path,
                );
            }
        }

        info!(
            self.log(), "pushing updated boot script";
            "service" => &change.service,
        );
        self.env
            .inventory
            .set_service_boot_script(&change.service, &desired)
            .await?;
        for instance in change.real_instances() {
            self.env
                .inventory
                .set_instance_boot_script(&instance.zonename, &desired)
                .await?;
        }
        Ok(())
    }

    /// Restores the boot script saved for (service, image).  This is the
    /// rollback counterpart to [`Steps::update_boot_scripts`].
    pub async fn restore_boot_scripts(
        &self,
        ctx: &StepContext,
    ) -> Result<(), ProcedureError> {
        let change = &ctx.change;
        let Some(saved) = bootscript::load(
            &self.env.workdir,
            &change.service,
            &change.image,
        )
        .await?
        else {
            return Err(ProcedureError::Validation(format!(
                "no saved boot script for service \"{}\" at image {}; \
                 cannot roll back",
                change.service, change.image,
            )));
        };
        info!(
            self.log(), "restoring saved boot script";
            "service" => &change.service,
            "image" => %change.image,
        );
        self.env
            .inventory
            .set_service_boot_script(&change.service, &saved)
            .await?;
        for instance in change.real_instances() {
            self.env
                .inventory
                .set_instance_boot_script(&instance.zonename, &saved)
                .await?;
        }
        Ok(())
    }

    /// Imports the target image on every distinct server hosting an
    /// affected instance, in a bounded parallel fan-out.  The import tool
    /// itself no-ops when the image is already present.
    pub async fn install_image_on_servers(
        &self,
        ctx: &StepContext,
    ) -> Result<(), ProcedureError> {
        let image = ctx.change.image;
        let servers: BTreeSet<String> = ctx
            .change
            .real_instances()
            .map(|i| i.server.clone())
            .collect();
        info!(
            self.log(), "importing image on servers";
            "image" => %image,
            "servers" => servers.len(),
        );
        let tasks = servers.into_iter().map(|server| {
            let exec = self.env.exec.clone();
            async move {
                let command =
                    format!("/usr/sbin/imgctl import -q {image}");
                exec.exec(&server, &command, IMAGE_IMPORT_TIMEOUT)
                    .await?
                    .check_status(&server, &command)?;
                Ok::<(), RemoteExecError>(())
            }
        });
        fanout(DEFAULT_MAX_PARALLELISM, tasks).await?;
        Ok(())
    }

    /// Swaps `instance` onto `image` and waits for it to come back
    /// healthy.  Skipped when the instance already carries the image
    /// (apart from the health wait, which is idempotent).
    pub async fn reprovision_and_wait(
        &self,
        instance: &Instance,
        image: Uuid,
    ) -> Result<(), ProcedureError> {
        let current =
            self.env.inventory.get_instance(&instance.zonename).await?;
        if current.image == image {
            info!(
                self.log(), "instance already on target image; \
                 skipping reprovision";
                "zonename" => &instance.zonename,
                "alias" => &instance.alias,
            );
        } else {
            info!(
                self.log(), "reprovisioning instance";
                "zonename" => &instance.zonename,
                "alias" => &instance.alias,
                "image" => %image,
            );
            if let Err(err) = self
                .env
                .inventory
                .reprovision_instance(&instance.zonename, image)
                .await
            {
                lockfile::set(
                    &self.env.workdir,
                    &format!(
                        "reprovision of {} ({}) failed: {}",
                        instance.alias,
                        instance.zonename,
                        InlineErrorChain::new(&err),
                    ),
                )
                .await?;
                return Err(err.into());
            }
            lockfile::clear(&self.env.workdir).await?;
        }
        waiters::wait_for_instance_up(&self.env, instance).await
    }

    /// Adds `instance` to (or removes it from) service DNS and waits for
    /// the change to propagate.  When DNS already matches, the registration
    /// toggle itself is skipped too.
    pub async fn set_dns_membership(
        &self,
        domain: &str,
        instance: &Instance,
        present: bool,
    ) -> Result<(), ProcedureError> {
        let ip = instance.ip.ok_or_else(|| {
            ProcedureError::Validation(format!(
                "instance {} ({}) has no admin IP",
                instance.alias, instance.zonename
            ))
        })?;
        let ips = self.env.dns.resolve(domain).await?;
        if ips.contains(&ip) == present {
            debug!(
                self.log(), "DNS registration already satisfied";
                "domain" => domain,
                "alias" => &instance.alias,
                "present" => present,
            );
            return Ok(());
        }
        info!(
            self.log(),
            "{}", if present { "adding instance to DNS" }
                  else { "removing instance from DNS" };
            "domain" => domain,
            "alias" => &instance.alias,
        );
        self.env
            .inventory
            .set_dns_registration(&instance.zonename, present)
            .await?;
        waiters::wait_for_dns_membership(&self.env, ip, domain, present)
            .await
    }

    /// Deletes stopped shadow instances left by a previously aborted run.
    /// A shadow still *running* is not ours to guess about: the operator
    /// must inspect and remove it.
    pub async fn purge_stale_shadows(
        &self,
        ctx: &StepContext,
    ) -> Result<(), ProcedureError> {
        let all = self
            .env
            .inventory
            .list_instances(&ctx.change.service)
            .await?;
        for stray in all.iter().filter(|i| i.is_shadow()) {
            let state =
                self.env.inventory.get_vm_state(&stray.zonename).await?;
            if state == VmState::Running {
                return Err(ProcedureError::Validation(format!(
                    "shadow instance {} ({}) from a previous run is still \
                     running; inspect it and delete it before re-running \
                     the update",
                    stray.alias, stray.zonename,
                )));
            }
            info!(
                self.log(), "purging stale shadow instance";
                "alias" => &stray.alias,
                "zonename" => &stray.zonename,
            );
            self.env.inventory.delete_instance(&stray.zonename).await?;
        }
        Ok(())
    }

    /// Creates a shadow of `target` on the same server, running the image
    /// `target` currently runs, and waits until it is up, healthy, and
    /// answering to the service name.  The shadow's identity is recorded
    /// in the context.
    pub async fn create_shadow(
        &self,
        ctx: &mut StepContext,
        target: &Instance,
        domain: &str,
    ) -> Result<(), ProcedureError> {
        let alias = shadow_alias(&target.alias, &Uuid::new_v4());
        info!(
            self.log(), "creating shadow instance";
            "alias" => &alias,
            "server" => &target.server,
        );
        let shadow = self
            .env
            .inventory
            .create_instance(
                &ctx.change.service,
                &CreateParams {
                    alias,
                    image: target.image,
                    server: Some(target.server.clone()),
                    dns_registered: true,
                },
            )
            .await?;
        ctx.shadow = Some(shadow.clone());
        waiters::wait_for_instance_up(&self.env, &shadow).await?;
        if let Some(ip) = shadow.ip {
            waiters::wait_for_dns_membership(&self.env, ip, domain, true)
                .await?;
        }
        Ok(())
    }

    /// Pulls the shadow out of DNS, stops it, and deletes it.  Only called
    /// on the success path; on failure the shadow is deliberately left
    /// running for operator inspection.
    pub async fn destroy_shadow(
        &self,
        ctx: &mut StepContext,
        domain: &str,
    ) -> Result<(), ProcedureError> {
        let Some(shadow) = ctx.shadow.clone() else {
            return Ok(());
        };
        info!(
            self.log(), "destroying shadow instance";
            "alias" => &shadow.alias,
            "zonename" => &shadow.zonename,
        );
        self.set_dns_membership(domain, &shadow, false).await?;
        self.env.inventory.stop_instance(&shadow.zonename).await?;
        self.env.inventory.delete_instance(&shadow.zonename).await?;
        ctx.shadow = None;
        Ok(())
    }

    /// Pins the shard write topology via `member`.
    pub async fn freeze_shard(
        &self,
        ctx: &mut StepContext,
        member: &Instance,
        reason: &str,
    ) -> Result<(), ProcedureError> {
        self.env.shard.freeze(member, reason).await?;
        ctx.is_frozen = true;
        Ok(())
    }

    /// Releases the shard write topology via `member`.
    pub async fn unfreeze_shard(
        &self,
        ctx: &mut StepContext,
        member: &Instance,
    ) -> Result<(), ProcedureError> {
        self.env.shard.unfreeze(member).await?;
        ctx.is_frozen = false;
        Ok(())
    }
}
