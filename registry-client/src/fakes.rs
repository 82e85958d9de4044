// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for tests.
//!
//! [`FakeInventory`] keeps instance records in a mutex-guarded map and
//! records every mutating operation so tests can assert call order.  It can
//! be wired to a [`FakeDns`] so DNS registration changes propagate
//! "instantly", the way a registrar eventually would.

use crate::{
    ClientError, CreateParams, DnsClient, HealthClient, InstanceHealth,
    InventoryClient, ResolveError, VmState,
};
use async_trait::async_trait;
use cpadm_types::Instance;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A mutating inventory operation, recorded in call order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Create { alias: String },
    Reprovision { zonename: String },
    Stop { zonename: String },
    Delete { zonename: String },
    SetDns { zonename: String, registered: bool },
}

struct InstanceRecord {
    instance: Instance,
    service: String,
    state: VmState,
    dns_registered: bool,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceRecord>,
    service_boot_scripts: BTreeMap<String, String>,
    instance_boot_scripts: BTreeMap<String, String>,
    image_boot_scripts: BTreeMap<Uuid, String>,
    fail_reprovision: BTreeMap<String, String>,
    ops: Vec<Op>,
    next_ip: u8,
}

/// An in-memory [`InventoryClient`].
pub struct FakeInventory {
    inner: Mutex<Inner>,
    dns: Arc<FakeDns>,
    dns_suffix: String,
}

impl FakeInventory {
    pub fn new(dns_suffix: &str, dns: Arc<FakeDns>) -> FakeInventory {
        FakeInventory {
            inner: Mutex::new(Inner { next_ip: 10, ..Default::default() }),
            dns,
            dns_suffix: dns_suffix.to_string(),
        }
    }

    fn domain(&self, service: &str) -> String {
        format!("{}.{}", service, self.dns_suffix)
    }

    /// Adds an instance with a generated zonename and admin IP, registered
    /// in DNS.  Returns the new record.
    pub fn add_instance(
        &self,
        service: &str,
        alias: &str,
        server: &str,
        image: Uuid,
    ) -> Instance {
        let mut inner = self.inner.lock().unwrap();
        let zonename = Uuid::new_v4().simple().to_string();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, inner.next_ip));
        inner.next_ip += 1;
        let instance = Instance {
            zonename: zonename.clone(),
            alias: alias.to_string(),
            server: server.to_string(),
            image,
            ip: Some(ip),
            role: None,
        };
        inner.instances.insert(
            zonename,
            InstanceRecord {
                instance: instance.clone(),
                service: service.to_string(),
                state: VmState::Running,
                dns_registered: true,
            },
        );
        self.dns.add_ip(&self.domain(service), ip);
        instance
    }

    pub fn set_service_script(&self, service: &str, script: &str) {
        self.inner
            .lock()
            .unwrap()
            .service_boot_scripts
            .insert(service.to_string(), script.to_string());
    }

    pub fn set_image_script(&self, image: Uuid, script: &str) {
        self.inner
            .lock()
            .unwrap()
            .image_boot_scripts
            .insert(image, script.to_string());
    }

    pub fn set_vm_state(&self, zonename: &str, state: VmState) {
        if let Some(record) =
            self.inner.lock().unwrap().instances.get_mut(zonename)
        {
            record.state = state;
        }
    }

    /// Makes every future reprovision of `zonename` fail with `message`.
    pub fn fail_reprovision_of(&self, zonename: &str, message: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_reprovision
            .insert(zonename.to_string(), message.to_string());
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.lock().unwrap().ops.clone()
    }

    /// The zonenames reprovisioned so far, in call order.
    pub fn reprovision_order(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Reprovision { zonename } => Some(zonename),
                _ => None,
            })
            .collect()
    }

    pub fn service_boot_script(&self, service: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .service_boot_scripts
            .get(service)
            .cloned()
    }

    pub fn instance_boot_script(&self, zonename: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .instance_boot_scripts
            .get(zonename)
            .cloned()
    }

    /// All instances currently known for `service`, shadows included.
    pub fn instances_of(&self, service: &str) -> Vec<Instance> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .values()
            .filter(|r| r.service == service)
            .map(|r| r.instance.clone())
            .collect()
    }
}

#[async_trait]
impl InventoryClient for FakeInventory {
    async fn list_instances(
        &self,
        service: &str,
    ) -> Result<Vec<Instance>, ClientError> {
        Ok(self.instances_of(service))
    }

    async fn get_instance(
        &self,
        zonename: &str,
    ) -> Result<Instance, ClientError> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(zonename)
            .map(|r| r.instance.clone())
            .ok_or_else(|| ClientError::InstanceNotFound(zonename.to_string()))
    }

    async fn get_vm_state(
        &self,
        zonename: &str,
    ) -> Result<VmState, ClientError> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .get(zonename)
            .map(|r| r.state)
            .ok_or_else(|| ClientError::InstanceNotFound(zonename.to_string()))
    }

    async fn create_instance(
        &self,
        service: &str,
        params: &CreateParams,
    ) -> Result<Instance, ClientError> {
        let instance = {
            let mut inner = self.inner.lock().unwrap();
            let zonename = Uuid::new_v4().simple().to_string();
            let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, inner.next_ip));
            inner.next_ip += 1;
            let instance = Instance {
                zonename: zonename.clone(),
                alias: params.alias.clone(),
                server: params
                    .server
                    .clone()
                    .unwrap_or_else(|| "server-auto".to_string()),
                image: params.image,
                ip: Some(ip),
                role: None,
            };
            inner.ops.push(Op::Create { alias: params.alias.clone() });
            inner.instances.insert(
                zonename,
                InstanceRecord {
                    instance: instance.clone(),
                    service: service.to_string(),
                    state: VmState::Running,
                    dns_registered: params.dns_registered,
                },
            );
            instance
        };
        if let Some(ip) = instance.ip {
            if params.dns_registered {
                self.dns.add_ip(&self.domain(service), ip);
            }
        }
        Ok(instance)
    }

    async fn reprovision_instance(
        &self,
        zonename: &str,
        image: Uuid,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::Reprovision { zonename: zonename.to_string() });
        if let Some(message) = inner.fail_reprovision.get(zonename) {
            let message = message.clone();
            return Err(ClientError::Api {
                registry: "vm-registry",
                code: "ReprovisionFailed".to_string(),
                message,
            });
        }
        let record = inner
            .instances
            .get_mut(zonename)
            .ok_or_else(|| ClientError::InstanceNotFound(zonename.to_string()))?;
        record.instance.image = image;
        record.state = VmState::Running;
        Ok(())
    }

    async fn stop_instance(
        &self,
        zonename: &str,
    ) -> Result<(), ClientError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ops.push(Op::Stop { zonename: zonename.to_string() });
        let record = inner
            .instances
            .get_mut(zonename)
            .ok_or_else(|| ClientError::InstanceNotFound(zonename.to_string()))?;
        record.state = VmState::Stopped;
        Ok(())
    }

    async fn delete_instance(
        &self,
        zonename: &str,
    ) -> Result<(), ClientError> {
        let record = {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push(Op::Delete { zonename: zonename.to_string() });
            inner.instances.remove(zonename).ok_or_else(|| {
                ClientError::InstanceNotFound(zonename.to_string())
            })?
        };
        if let (Some(ip), true) = (record.instance.ip, record.dns_registered)
        {
            self.dns.remove_ip(&self.domain(&record.service), ip);
        }
        Ok(())
    }

    async fn set_dns_registration(
        &self,
        zonename: &str,
        registered: bool,
    ) -> Result<(), ClientError> {
        let (service, ip) = {
            let mut inner = self.inner.lock().unwrap();
            inner.ops.push(Op::SetDns {
                zonename: zonename.to_string(),
                registered,
            });
            let record = inner.instances.get_mut(zonename).ok_or_else(
                || ClientError::InstanceNotFound(zonename.to_string()),
            )?;
            record.dns_registered = registered;
            (record.service.clone(), record.instance.ip)
        };
        if let Some(ip) = ip {
            let domain = self.domain(&service);
            if registered {
                self.dns.add_ip(&domain, ip);
            } else {
                self.dns.remove_ip(&domain, ip);
            }
        }
        Ok(())
    }

    async fn get_service_boot_script(
        &self,
        service: &str,
    ) -> Result<Option<String>, ClientError> {
        Ok(self.service_boot_script(service))
    }

    async fn set_service_boot_script(
        &self,
        service: &str,
        script: &str,
    ) -> Result<(), ClientError> {
        self.set_service_script(service, script);
        Ok(())
    }

    async fn set_instance_boot_script(
        &self,
        zonename: &str,
        script: &str,
    ) -> Result<(), ClientError> {
        self.inner
            .lock()
            .unwrap()
            .instance_boot_scripts
            .insert(zonename.to_string(), script.to_string());
        Ok(())
    }

    async fn get_image_boot_script(
        &self,
        image: Uuid,
    ) -> Result<Option<String>, ClientError> {
        Ok(self.inner.lock().unwrap().image_boot_scripts.get(&image).cloned())
    }
}

/// An in-memory DNS zone.
#[derive(Default)]
pub struct FakeDns {
    records: Mutex<BTreeMap<String, BTreeSet<IpAddr>>>,
}

impl FakeDns {
    pub fn new() -> FakeDns {
        FakeDns::default()
    }

    pub fn add_ip(&self, domain: &str, ip: IpAddr) {
        self.records
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .insert(ip);
    }

    pub fn remove_ip(&self, domain: &str, ip: IpAddr) {
        if let Some(ips) = self.records.lock().unwrap().get_mut(domain) {
            ips.remove(&ip);
        }
    }
}

#[async_trait]
impl DnsClient for FakeDns {
    async fn resolve(
        &self,
        domain: &str,
    ) -> Result<Vec<IpAddr>, ResolveError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(domain)
            .map(|ips| ips.iter().copied().collect())
            .unwrap_or_default())
    }
}

/// An in-memory [`HealthClient`]; every instance is healthy unless a test
/// says otherwise.
#[derive(Default)]
pub struct FakeHealth {
    overrides: Mutex<BTreeMap<String, InstanceHealth>>,
}

impl FakeHealth {
    pub fn new() -> FakeHealth {
        FakeHealth::default()
    }

    pub fn set_unhealthy(&self, zonename: &str, error: &str) {
        self.overrides.lock().unwrap().insert(
            zonename.to_string(),
            InstanceHealth {
                zonename: zonename.to_string(),
                health_errors: vec![error.to_string()],
                in_maintenance: false,
            },
        );
    }

    pub fn set_maintenance(&self, zonename: &str) {
        self.overrides.lock().unwrap().insert(
            zonename.to_string(),
            InstanceHealth {
                zonename: zonename.to_string(),
                health_errors: vec![
                    "svc:/cp/application:default in maintenance".to_string(),
                ],
                in_maintenance: true,
            },
        );
    }

    pub fn clear(&self, zonename: &str) {
        self.overrides.lock().unwrap().remove(zonename);
    }
}

#[async_trait]
impl HealthClient for FakeHealth {
    async fn check_health(
        &self,
        zonenames: &[String],
    ) -> Result<Vec<InstanceHealth>, ClientError> {
        let overrides = self.overrides.lock().unwrap();
        Ok(zonenames
            .iter()
            .map(|zonename| {
                overrides.get(zonename).cloned().unwrap_or_else(|| {
                    InstanceHealth {
                        zonename: zonename.clone(),
                        health_errors: Vec::new(),
                        in_maintenance: false,
                    }
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dns_registration_follows_the_instance_lifecycle() {
        let dns = Arc::new(FakeDns::new());
        let inventory =
            FakeInventory::new("cp.example.com", Arc::clone(&dns));
        let instance = inventory.add_instance(
            "catalog",
            "catalog0",
            "server-0",
            Uuid::new_v4(),
        );
        let ip = instance.ip.unwrap();
        let domain = "catalog.cp.example.com";
        assert_eq!(dns.resolve(domain).await.unwrap(), vec![ip]);

        inventory
            .set_dns_registration(&instance.zonename, false)
            .await
            .unwrap();
        assert!(dns.resolve(domain).await.unwrap().is_empty());

        inventory
            .set_dns_registration(&instance.zonename, true)
            .await
            .unwrap();
        assert_eq!(dns.resolve(domain).await.unwrap(), vec![ip]);

        inventory.delete_instance(&instance.zonename).await.unwrap();
        assert!(dns.resolve(domain).await.unwrap().is_empty());
        assert!(inventory.instances_of("catalog").is_empty());
    }

    #[tokio::test]
    async fn health_defaults_to_healthy_until_overridden() {
        let health = FakeHealth::new();
        let zonenames = vec!["z0".to_string()];

        let reports = health.check_health(&zonenames).await.unwrap();
        assert!(reports[0].healthy());

        health.set_unhealthy("z0", "svc offline");
        let reports = health.check_health(&zonenames).await.unwrap();
        assert!(!reports[0].healthy());

        health.clear("z0");
        let reports = health.check_health(&zonenames).await.unwrap();
        assert!(reports[0].healthy());
    }
}
