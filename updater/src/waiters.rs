// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DNS membership and instance health waiters.

use crate::{ProcedureError, UpdateEnv};
use cpadm_common::poll::{
    poll_until, CondCheckError, PollError, POLL_INTERVAL, POLL_MAX_ATTEMPTS,
};
use cpadm_types::Instance;
use registry_client::VmState;
use slog::{debug, info};
use std::net::IpAddr;
use std::sync::Arc;

/// Blocks until `ip` is (or is no longer) among the addresses `domain`
/// resolves to.
///
/// Idempotent: if reality already matches `present`, this returns after a
/// single resolution with no polling delay.
pub(crate) async fn wait_for_dns_membership(
    env: &UpdateEnv,
    ip: IpAddr,
    domain: &str,
    present: bool,
) -> Result<(), ProcedureError> {
    let ips = env.dns.resolve(domain).await?;
    if ips.contains(&ip) == present {
        debug!(
            env.log, "DNS membership already satisfied";
            "domain" => domain,
            "ip" => %ip,
            "present" => present,
        );
        return Ok(());
    }

    info!(
        env.log, "waiting for DNS membership change";
        "domain" => domain,
        "ip" => %ip,
        "present" => present,
    );
    let condition = format!(
        "{} to {} DNS for {}",
        ip,
        if present { "enter" } else { "leave" },
        domain
    );
    let result = poll_until(
        &condition,
        POLL_INTERVAL,
        POLL_MAX_ATTEMPTS,
        || {
            let dns = Arc::clone(&env.dns);
            let domain = domain.to_string();
            async move {
                let ips = dns
                    .resolve(&domain)
                    .await
                    .map_err(ProcedureError::from)
                    .map_err(CondCheckError::Failed)?;
                if ips.contains(&ip) == present {
                    Ok(())
                } else {
                    Err(CondCheckError::<ProcedureError>::NotYet)
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

/// Blocks until `instance` is running and free of service-manager health
/// errors.
///
/// A service in the maintenance state is fatal immediately: maintenance
/// does not self-heal, so burning the rest of the attempt budget would only
/// delay the operator.
pub(crate) async fn wait_for_instance_up(
    env: &UpdateEnv,
    instance: &Instance,
) -> Result<(), ProcedureError> {
    info!(
        env.log, "waiting for instance to come up healthy";
        "zonename" => &instance.zonename,
        "alias" => &instance.alias,
    );
    let condition = format!(
        "instance {} ({}) to be running and healthy",
        instance.alias, instance.zonename
    );
    let result = poll_until(
        &condition,
        POLL_INTERVAL,
        POLL_MAX_ATTEMPTS,
        || {
            let env = env.clone();
            let zonename = instance.zonename.clone();
            let alias = instance.alias.clone();
            async move {
                let state = env
                    .inventory
                    .get_vm_state(&zonename)
                    .await
                    .map_err(ProcedureError::from)
                    .map_err(CondCheckError::Failed)?;
                if state != VmState::Running {
                    return Err(CondCheckError::NotYet);
                }
                let reports = env
                    .health
                    .check_health(std::slice::from_ref(&zonename))
                    .await
                    .map_err(ProcedureError::from)
                    .map_err(CondCheckError::Failed)?;
                let Some(report) =
                    reports.iter().find(|r| r.zonename == zonename)
                else {
                    return Err(CondCheckError::NotYet);
                };
                if report.in_maintenance {
                    return Err(CondCheckError::Failed(
                        ProcedureError::Update(format!(
                            "instance {} ({}) has service(s) in \
                             maintenance: {}; clear the fault (svcadm \
                             clear) and re-run the update",
                            alias,
                            zonename,
                            report.health_errors.join("; "),
                        )),
                    ));
                }
                if report.healthy() {
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
