// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Narrow interfaces to the cluster's registries: server/VM inventory and
//! service records, instance health, and service DNS.
//!
//! The update engine is a client of these collaborators and nothing more.
//! The REST implementations live elsewhere; this crate defines the traits
//! the engine consumes, the error they fail with, a production DNS resolver
//! (the one collaborator simple enough to carry here), and in-memory fakes
//! for tests.

use async_trait::async_trait;
use cpadm_types::Instance;
use slog_error_chain::SlogInlineError;
use std::net::IpAddr;
use uuid::Uuid;

mod dns;
pub mod fakes;

pub use dns::Resolver;

/// A collaborator call failed.
#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ClientError {
    #[error("{registry} request failed with {code}: {message}")]
    Api { registry: &'static str, code: String, message: String },

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("service {0} not found")]
    ServiceNotFound(String),

    #[error("failed to reach {registry}")]
    Transport {
        registry: &'static str,
        #[source]
        err: anyhow::Error,
    },
}

/// DNS resolution failed at the transport level.  An empty answer is not an
/// error; it comes back as an empty list.
#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum ResolveError {
    #[error(transparent)]
    Resolve(#[from] hickory_resolver::error::ResolveError),
}

/// Running-state of a VM as the inventory reports it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VmState {
    Provisioning,
    Running,
    Stopped,
    Failed,
}

/// What the health collaborator reports for one instance.
#[derive(Clone, Debug)]
pub struct InstanceHealth {
    pub zonename: String,
    /// Service-manager problems, one line per faulted service.
    pub health_errors: Vec<String>,
    /// Whether any service on the instance is in the maintenance state.
    /// Maintenance does not self-heal, so waiters treat it as fatal.
    pub in_maintenance: bool,
}

impl InstanceHealth {
    pub fn healthy(&self) -> bool {
        self.health_errors.is_empty() && !self.in_maintenance
    }
}

/// Parameters for creating a new instance of a service.
#[derive(Clone, Debug)]
pub struct CreateParams {
    pub alias: String,
    pub image: Uuid,
    /// Pin to a specific server; `None` lets the placement service choose.
    pub server: Option<String>,
    /// Whether the instance registers itself in service DNS on boot.
    pub dns_registered: bool,
}

/// The server/VM/service registries, consumed asynchronously.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn list_instances(
        &self,
        service: &str,
    ) -> Result<Vec<Instance>, ClientError>;

    async fn get_instance(
        &self,
        zonename: &str,
    ) -> Result<Instance, ClientError>;

    async fn get_vm_state(
        &self,
        zonename: &str,
    ) -> Result<VmState, ClientError>;

    async fn create_instance(
        &self,
        service: &str,
        params: &CreateParams,
    ) -> Result<Instance, ClientError>;

    /// Atomically swaps the instance's running image while preserving its
    /// identity and network location.
    async fn reprovision_instance(
        &self,
        zonename: &str,
        image: Uuid,
    ) -> Result<(), ClientError>;

    async fn stop_instance(&self, zonename: &str)
        -> Result<(), ClientError>;

    async fn delete_instance(
        &self,
        zonename: &str,
    ) -> Result<(), ClientError>;

    /// Toggles whether service DNS advertises this instance.  Propagation
    /// is asynchronous; callers observe it through [`DnsClient::resolve`].
    async fn set_dns_registration(
        &self,
        zonename: &str,
        registered: bool,
    ) -> Result<(), ClientError>;

    async fn get_service_boot_script(
        &self,
        service: &str,
    ) -> Result<Option<String>, ClientError>;

    async fn set_service_boot_script(
        &self,
        service: &str,
        script: &str,
    ) -> Result<(), ClientError>;

    async fn set_instance_boot_script(
        &self,
        zonename: &str,
        script: &str,
    ) -> Result<(), ClientError>;

    /// The boot script the image catalog ships for `image`, if any.
    async fn get_image_boot_script(
        &self,
        image: Uuid,
    ) -> Result<Option<String>, ClientError>;
}

/// The health collaborator.
#[async_trait]
pub trait HealthClient: Send + Sync {
    async fn check_health(
        &self,
        zonenames: &[String],
    ) -> Result<Vec<InstanceHealth>, ClientError>;
}

/// The DNS resolution collaborator.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn resolve(
        &self,
        domain: &str,
    ) -> Result<Vec<IpAddr>, ResolveError>;
}
