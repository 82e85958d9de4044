// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model shared across the cpadm update engine: plans and changes as
//! produced by the external planner, the orchestrator's view of instances,
//! and the parsed administrative state of replicated shards and coordination
//! ensembles.

mod ensemble;
mod plan;
mod shard;

pub use ensemble::{EnsembleMode, EnsembleNodeState};
pub use plan::{
    is_shadow_alias, shadow_alias, Change, ChangeKind, Instance, Plan,
    PlanError, ServiceTopology, ENSEMBLE_SERVICE, SHARD_SERVICE,
};
pub use shard::{
    PeerState, PgStatus, ReplStatus, ShardRole, ShardState,
};
