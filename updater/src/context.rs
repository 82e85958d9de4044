// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The mutable bag of state threaded through one change's step pipeline.

use cpadm_types::{Change, Instance};

/// The shard roles discovered for a replicated-shard change.  `async_peers`
/// preserves replication-chain order.
#[derive(Clone, Debug)]
pub struct ShardRoles {
    pub primary: Instance,
    pub sync: Instance,
    pub async_peers: Vec<Instance>,
}

/// Per-change scratch state.
///
/// Created fresh for each change, exclusively owned by that change's
/// pipeline, and discarded when the pipeline ends (success or failure).
/// Never shared across changes.
#[derive(Debug)]
pub struct StepContext {
    pub change: Change,
    /// Whether the service turned out to have redundancy.
    pub ha: bool,
    /// Filled in by shard topology discovery.
    pub shard: Option<crate::ShardRoles>,
    /// Filled in by ensemble discovery.
    pub leader: Option<Instance>,
    pub followers: Vec<Instance>,
    /// A single-node ensemble runs standalone; there is no rejoin to
    /// observe after updating it.
    pub standalone: bool,
    /// The shadow instance created by a blue/green update, tracked by
    /// identity so cleanup never has to guess.
    pub shadow: Option<Instance>,
    /// Whether this pipeline currently holds the shard write topology
    /// frozen.
    pub is_frozen: bool,
}

impl StepContext {
    pub fn new(change: Change) -> StepContext {
        StepContext {
            change,
            ha: false,
            shard: None,
            leader: None,
            followers: Vec::new(),
            standalone: false,
            shadow: None,
            is_frozen: false,
        }
    }

    /// The DNS name the service answers to.
    pub fn service_domain(&self, dns_suffix: &str) -> String {
        format!("{}.{}", self.change.service, dns_suffix)
    }
}
