// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared scaffolding for the procedure integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use camino_tempfile::Utf8TempDir;
use cpadm_types::{Change, ChangeKind, Plan};
use cpadm_updater::UpdateEnv;
use registry_client::fakes::{FakeDns, FakeHealth, FakeInventory};
use registry_client::{DnsClient, HealthClient, InventoryClient};
use remote_exec::fakes::ScriptedExecutor;
use remote_exec::RemoteExecutor;
use slog::Logger;
use std::sync::Arc;
use uuid::Uuid;

pub const DNS_SUFFIX: &str = "cp.example.com";
pub const PROBE_HOST: &str = "server-probe";

pub struct TestEnv {
    pub env: UpdateEnv,
    pub exec: Arc<ScriptedExecutor>,
    pub inventory: Arc<FakeInventory>,
    pub health: Arc<FakeHealth>,
    pub dns: Arc<FakeDns>,
    /// Held so the working directory outlives the test.
    pub workdir: Utf8TempDir,
}

pub fn test_env_with_exec(exec: ScriptedExecutor) -> TestEnv {
    let log = Logger::root(slog::Discard, slog::o!());
    let exec = Arc::new(exec);
    let dns = Arc::new(FakeDns::new());
    let inventory =
        Arc::new(FakeInventory::new(DNS_SUFFIX, Arc::clone(&dns)));
    let health = Arc::new(FakeHealth::new());
    let workdir = Utf8TempDir::new().unwrap();
    let env = UpdateEnv::new(
        log,
        Arc::clone(&exec) as Arc<dyn RemoteExecutor>,
        Arc::clone(&inventory) as Arc<dyn InventoryClient>,
        Arc::clone(&health) as Arc<dyn HealthClient>,
        Arc::clone(&dns) as Arc<dyn DnsClient>,
        PROBE_HOST,
        workdir.path().to_path_buf(),
        DNS_SUFFIX,
    );
    TestEnv { env, exec, inventory, health, dns, workdir }
}

pub fn test_env() -> TestEnv {
    test_env_with_exec(ScriptedExecutor::always_ok())
}

/// An update-service change covering every instance the inventory currently
/// knows for `service`.
pub fn update_service_change(
    inventory: &FakeInventory,
    service: &str,
    image: Uuid,
) -> Change {
    Change {
        kind: ChangeKind::UpdateService,
        service: service.to_string(),
        image,
        instances: inventory.instances_of(service),
        instance: None,
    }
}

pub fn rollback_service_change(
    inventory: &FakeInventory,
    service: &str,
    image: Uuid,
) -> Change {
    Change {
        kind: ChangeKind::RollbackService,
        service: service.to_string(),
        image,
        instances: inventory.instances_of(service),
        instance: None,
    }
}

pub fn plan_of(changes: Vec<Change>) -> Plan {
    Plan { changes, rollback: false }
}
