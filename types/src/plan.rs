// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Plans, changes, and instances.
//!
//! A [`Plan`] is constructed by an external planning step and consumed once
//! by the orchestrator.  The orchestrator never mutates inventory records in
//! place; [`Instance`] is its local, possibly role-annotated view of what
//! the inventory registries reported.

use crate::shard::ShardRole;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// The service name of the replicated Postgres-backed key/value store.
pub const SHARD_SERVICE: &str = "keydb";

/// The service name of the ZooKeeper-style coordination ensemble.
pub const ENSEMBLE_SERVICE: &str = "arbiter";

/// What kind of change the planner is asking for.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    /// Update a single named instance of a service.
    UpdateInstance,
    /// Update every instance of a service.
    UpdateService,
    /// Roll a service back to a previously saved configuration.
    RollbackService,
}

/// One change to apply: a target service, the image to move to, and the set
/// of instances affected.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub service: String,
    pub image: Uuid,
    pub instances: Vec<Instance>,
    /// For [`ChangeKind::UpdateInstance`], the zonename of the one instance
    /// to touch.
    pub instance: Option<String>,
}

impl Change {
    /// Restricts `instances` to the named instance (for update-instance
    /// changes) and enforces that the result is non-empty.
    pub fn normalize(&mut self) -> Result<(), PlanError> {
        if self.kind == ChangeKind::UpdateInstance {
            if let Some(zonename) = &self.instance {
                let before = self.instances.len();
                self.instances.retain(|i| &i.zonename == zonename);
                if self.instances.is_empty() && before > 0 {
                    return Err(PlanError::UnknownInstance {
                        service: self.service.clone(),
                        instance: zonename.clone(),
                    });
                }
            }
        }
        if self.instances.is_empty() {
            return Err(PlanError::EmptyChange {
                service: self.service.clone(),
            });
        }
        Ok(())
    }

    /// The instances of this change that are not leftover shadow instances
    /// from a previously aborted update.
    pub fn real_instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| !i.is_shadow())
    }
}

/// An ordered list of changes, consumed once by the orchestrator.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Plan {
    pub changes: Vec<Change>,
    pub rollback: bool,
}

impl Plan {
    pub fn normalize(&mut self) -> Result<(), PlanError> {
        for change in &mut self.changes {
            change.normalize()?;
        }
        Ok(())
    }
}

/// The orchestrator's view of one instance of a service.
///
/// `zonename` is the stable identity; `server` identifies the host carrying
/// the instance.  `role` is only filled in during shard topology analysis.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct Instance {
    pub zonename: String,
    pub alias: String,
    pub server: String,
    /// The image the instance currently runs.
    pub image: Uuid,
    pub ip: Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ShardRole>,
}

impl Instance {
    /// The abbreviated peer name a shard member reports for this instance
    /// (the first 8 characters of the zonename).
    pub fn peer_abbr(&self) -> &str {
        let end = self.zonename.len().min(8);
        &self.zonename[..end]
    }

    /// Whether this instance is a temporary shadow created by a blue/green
    /// singleton update.
    pub fn is_shadow(&self) -> bool {
        is_shadow_alias(&self.alias)
    }
}

const SHADOW_MARKER: &str = "-shadow-";

/// Constructs the alias for a shadow of the instance with alias `alias`.
/// The suffix makes the shadow's identity explicit so a later run never has
/// to guess which stray records were ours.
pub fn shadow_alias(alias: &str, id: &Uuid) -> String {
    let id = id.simple().to_string();
    format!("{}{}{}", alias, SHADOW_MARKER, &id[..8])
}

/// Whether `alias` names a shadow instance.
pub fn is_shadow_alias(alias: &str) -> bool {
    alias.contains(SHADOW_MARKER)
}

/// The closed set of update shapes, selected purely from the service
/// identity and its (non-shadow) instance population.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceTopology {
    /// A stateless singleton with no redundancy; updated blue/green via a
    /// temporary shadow instance.
    BlueGreenSingleton,
    /// A primary/sync/async replicated database shard.
    ReplicatedShard,
    /// A leader/follower coordination ensemble.
    Ensemble,
    /// A stateless service with multiple interchangeable instances.
    GenericMultiInstance,
}

impl ServiceTopology {
    pub fn of(service: &str, instances: &[Instance]) -> ServiceTopology {
        match service {
            SHARD_SERVICE => ServiceTopology::ReplicatedShard,
            ENSEMBLE_SERVICE => ServiceTopology::Ensemble,
            _ => {
                // Stale shadow instances from an aborted run must not make
                // a singleton look redundant.
                let real =
                    instances.iter().filter(|i| !i.is_shadow()).count();
                if real <= 1 {
                    ServiceTopology::BlueGreenSingleton
                } else {
                    ServiceTopology::GenericMultiInstance
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("change for service \"{service}\" affects no instances")]
    EmptyChange { service: String },

    #[error(
        "change for service \"{service}\" names unknown instance \
         \"{instance}\""
    )]
    UnknownInstance { service: String, instance: String },
}
