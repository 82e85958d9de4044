// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a whole plan, change by change.

use crate::procedures::Procedure;
use crate::{ProcedureError, StepContext, UpdateEnv};
use cpadm_types::{Plan, PlanError};
use slog::{error, info, warn};
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeSet;

/// A plan-level rollback flag overrides per-change selection: every change
/// replays the saved configuration.
fn select(change: &cpadm_types::Change, plan_rollback: bool) -> Procedure {
    if plan_rollback {
        Procedure::GenericMultiInstance { rollback: true }
    } else {
        Procedure::for_change(change)
    }
}

/// What happened to each change of an executed plan.
#[derive(Debug)]
pub struct PlanOutcome {
    /// Services whose change ran to completion.
    pub completed: Vec<String>,
    /// Services whose change was skipped because an earlier change for the
    /// same service failed.
    pub skipped: Vec<String>,
    /// Failed changes, by service, with the error that stopped each one.
    pub failed: Vec<(String, ProcedureError)>,
}

impl PlanOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Executes plans over a shared [`UpdateEnv`].
pub struct PlanExecutor {
    env: UpdateEnv,
}

impl PlanExecutor {
    pub fn new(env: UpdateEnv) -> PlanExecutor {
        PlanExecutor { env }
    }

    /// Renders one line per change describing what [`PlanExecutor::execute`]
    /// would do, without touching the cluster.
    pub fn summarize(&self, plan: &Plan) -> Result<String, PlanError> {
        let mut plan = plan.clone();
        plan.normalize()?;
        let lines: Vec<String> = plan
            .changes
            .iter()
            .map(|change| {
                select(change, plan.rollback).summarize(change)
            })
            .collect();
        Ok(lines.join("\n"))
    }

    /// Runs every change in order.  A failed change stops that service's
    /// pipeline but not the plan; later changes for *other* services still
    /// run, while later changes for the failed service are skipped.
    pub async fn execute(
        &self,
        plan: &Plan,
    ) -> Result<PlanOutcome, PlanError> {
        let mut plan = plan.clone();
        plan.normalize()?;

        let mut outcome = PlanOutcome {
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };
        let mut failed_services = BTreeSet::new();
        for change in plan.changes {
            if failed_services.contains(&change.service) {
                warn!(
                    self.env.log,
                    "skipping change; an earlier change for this service \
                     failed";
                    "service" => &change.service,
                );
                outcome.skipped.push(change.service.clone());
                continue;
            }

            let procedure = select(&change, plan.rollback);
            info!(
                self.env.log, "executing change";
                "service" => &change.service,
                "image" => %change.image,
                "procedure" => procedure.name(),
            );
            let service = change.service.clone();
            let mut ctx = StepContext::new(change);
            match procedure.execute(&self.env, &mut ctx).await {
                Ok(()) => {
                    info!(
                        self.env.log, "change complete";
                        "service" => &service,
                    );
                    outcome.completed.push(service);
                }
                Err(err) => {
                    error!(
                        self.env.log, "change failed";
                        "service" => &service,
                        "error" => InlineErrorChain::new(&err),
                    );
                    failed_services.insert(service.clone());
                    outcome.failed.push((service, err));
                }
            }
        }
        Ok(outcome)
    }
}
