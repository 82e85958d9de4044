// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Selection and dispatch of the per-topology update procedures.

use crate::{ProcedureError, StepContext, UpdateEnv};
use cpadm_types::{Change, ChangeKind, ServiceTopology};

mod blue_green;
mod ensemble;
mod generic;
mod shard;

/// The update procedure chosen for one change.
///
/// Selection is a pure function of the change: a rollback always uses the
/// generic serial procedure (with saved boot scripts), and everything else
/// follows the service topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procedure {
    BlueGreenSingleton,
    ReplicatedShard,
    Ensemble,
    GenericMultiInstance { rollback: bool },
}

impl Procedure {
    pub fn for_change(change: &Change) -> Procedure {
        if change.kind == ChangeKind::RollbackService {
            return Procedure::GenericMultiInstance { rollback: true };
        }
        match ServiceTopology::of(&change.service, &change.instances) {
            ServiceTopology::BlueGreenSingleton => {
                Procedure::BlueGreenSingleton
            }
            ServiceTopology::ReplicatedShard => Procedure::ReplicatedShard,
            ServiceTopology::Ensemble => Procedure::Ensemble,
            ServiceTopology::GenericMultiInstance => {
                Procedure::GenericMultiInstance { rollback: false }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Procedure::BlueGreenSingleton => "blue/green singleton",
            Procedure::ReplicatedShard => "replicated shard",
            Procedure::Ensemble => "ensemble",
            Procedure::GenericMultiInstance { rollback: false } => {
                "generic multi-instance"
            }
            Procedure::GenericMultiInstance { rollback: true } => {
                "generic rollback"
            }
        }
    }

    /// One human-readable line describing what executing this procedure
    /// for `change` would do.
    pub fn summarize(&self, change: &Change) -> String {
        let count = change.real_instances().count();
        let verb = match self {
            Procedure::GenericMultiInstance { rollback: true } => {
                "roll back"
            }
            _ => "update",
        };
        format!(
            "{} {} instance(s) of service \"{}\" to image {} \
             ({} procedure)",
            verb,
            count,
            change.service,
            change.image,
            self.name(),
        )
    }

    pub(crate) async fn execute(
        &self,
        env: &UpdateEnv,
        ctx: &mut StepContext,
    ) -> Result<(), ProcedureError> {
        match self {
            Procedure::BlueGreenSingleton => {
                blue_green::execute(env, ctx).await
            }
            Procedure::ReplicatedShard => shard::execute(env, ctx).await,
            Procedure::Ensemble => ensemble::execute(env, ctx).await,
            Procedure::GenericMultiInstance { rollback } => {
                generic::execute(env, ctx, *rollback).await
            }
        }
    }
}
