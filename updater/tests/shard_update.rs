// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end replicated-shard updates against in-memory collaborators.

mod common;

use cpadm_types::SHARD_SERVICE;
use cpadm_updater::PlanExecutor;
use remote_exec::fakes::ScriptedExecutor;
use remote_exec::ExecOutput;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A scripted executor whose `shardctl peers` output a test can rewrite as
/// the "shard" evolves.  Every other command succeeds silently.
fn scripted_shard() -> (ScriptedExecutor, Arc<Mutex<String>>) {
    let output = Arc::new(Mutex::new(String::new()));
    let handle = Arc::clone(&output);
    let exec = ScriptedExecutor::new(move |_, command| {
        if command.contains("peers -H") {
            Ok(ExecOutput::ok(&handle.lock().unwrap()))
        } else {
            Ok(ExecOutput::ok(""))
        }
    });
    (exec, output)
}

#[tokio::test(start_paused = true)]
async fn updates_members_from_the_tail_of_the_chain() {
    let (exec, shard_output) = scripted_shard();
    let t = common::test_env_with_exec(exec);
    let old_image = Uuid::new_v4();
    let new_image = Uuid::new_v4();
    let primary =
        t.inventory.add_instance(SHARD_SERVICE, "keydb0", "server-0", old_image);
    let sync =
        t.inventory.add_instance(SHARD_SERVICE, "keydb1", "server-1", old_image);
    let tail =
        t.inventory.add_instance(SHARD_SERVICE, "keydb2", "server-2", old_image);
    *shard_output.lock().unwrap() = format!(
        "primary|{}|ok|sync\nsync|{}|ok|async\nasync|{}|ok|-\n",
        primary.peer_abbr(),
        sync.peer_abbr(),
        tail.peer_abbr(),
    );

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        SHARD_SERVICE,
        new_image,
    )]);
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.failed);

    // Tail first, then the sync, and the primary last.
    assert_eq!(
        t.inventory.reprovision_order(),
        vec![
            tail.zonename.clone(),
            sync.zonename.clone(),
            primary.zonename.clone(),
        ]
    );
    for member in t.inventory.instances_of(SHARD_SERVICE) {
        assert_eq!(member.image, new_image, "{}", member.alias);
    }

    // The topology was frozen before any member was touched and released
    // exactly once, at the end, through the old sync (the member taking
    // over as primary).
    let commands = t.exec.commands();
    let freezes: Vec<&String> =
        commands.iter().filter(|c| c.contains("freeze -r")).collect();
    assert_eq!(freezes.len(), 3, "one freeze per phase: {commands:?}");
    for freeze in &freezes {
        assert!(
            freeze.contains(&primary.zonename),
            "freezes go through the primary: {freeze}"
        );
    }
    let unfreezes: Vec<&String> =
        commands.iter().filter(|c| c.ends_with("unfreeze")).collect();
    assert_eq!(unfreezes.len(), 1, "{commands:?}");
    assert!(
        unfreezes[0].contains(&sync.zonename),
        "unfreeze must go through the old sync: {}",
        unfreezes[0]
    );
}

#[tokio::test(start_paused = true)]
async fn a_deposed_peer_stops_the_update_before_it_starts() {
    let (exec, shard_output) = scripted_shard();
    let t = common::test_env_with_exec(exec);
    let image = Uuid::new_v4();
    let primary =
        t.inventory.add_instance(SHARD_SERVICE, "keydb0", "server-0", image);
    let sync =
        t.inventory.add_instance(SHARD_SERVICE, "keydb1", "server-1", image);
    *shard_output.lock().unwrap() = format!(
        "primary|{}|ok|sync\nsync|{}|ok|-\ndeposed|badc0ffe|down|-\n",
        primary.peer_abbr(),
        sync.peer_abbr(),
    );

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        SHARD_SERVICE,
        Uuid::new_v4(),
    )]);
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(!outcome.succeeded());
    let message = outcome.failed[0].1.to_string();
    assert!(message.contains("deposed"), "{message}");
    assert!(t.inventory.reprovision_order().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refuses_a_shard_with_no_sync_member() {
    let (exec, shard_output) = scripted_shard();
    let t = common::test_env_with_exec(exec);
    let image = Uuid::new_v4();
    let primary =
        t.inventory.add_instance(SHARD_SERVICE, "keydb0", "server-0", image);
    t.inventory.add_instance(SHARD_SERVICE, "keydb1", "server-1", image);
    *shard_output.lock().unwrap() =
        format!("primary|{}|ok|-\n", primary.peer_abbr());

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        SHARD_SERVICE,
        Uuid::new_v4(),
    )]);
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(!outcome.succeeded());
    let message = outcome.failed[0].1.to_string();
    assert!(message.contains("no sync member"), "{message}");
    assert!(t.inventory.reprovision_order().is_empty());
}
