// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end coordination-ensemble updates against in-memory
//! collaborators.

mod common;

use cpadm_types::ENSEMBLE_SERVICE;
use cpadm_updater::PlanExecutor;
use remote_exec::fakes::ScriptedExecutor;
use remote_exec::ExecOutput;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// An executor scripting a permanently formed ensemble: the node at
/// `leader_ip` reports leader, every other node follower, and liveness
/// probes always pass.
fn scripted_ensemble(leader_ip: &'static str) -> ScriptedExecutor {
    ScriptedExecutor::new(move |_, command| {
        if command.contains("echo srvr") {
            if command.contains(leader_ip) {
                Ok(ExecOutput::ok("Mode: leader\n"))
            } else {
                Ok(ExecOutput::ok("Mode: follower\n"))
            }
        } else if command.contains("echo ruok") {
            Ok(ExecOutput::ok("imok"))
        } else {
            Ok(ExecOutput::ok(""))
        }
    })
}

#[tokio::test(start_paused = true)]
async fn updates_followers_before_the_leader() {
    // The inventory hands out admin IPs starting at 10.0.0.10, so the
    // first instance added is the scripted leader.
    let t = common::test_env_with_exec(scripted_ensemble("10.0.0.10"));
    let new_image = Uuid::new_v4();
    let leader = t.inventory.add_instance(
        ENSEMBLE_SERVICE,
        "arbiter0",
        "server-0",
        Uuid::new_v4(),
    );
    let follower_a = t.inventory.add_instance(
        ENSEMBLE_SERVICE,
        "arbiter1",
        "server-1",
        Uuid::new_v4(),
    );
    let follower_b = t.inventory.add_instance(
        ENSEMBLE_SERVICE,
        "arbiter2",
        "server-2",
        Uuid::new_v4(),
    );

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        ENSEMBLE_SERVICE,
        new_image,
    )]);
    let start = tokio::time::Instant::now();
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.failed);

    // Both followers (in either order) strictly before the leader.
    let order = t.inventory.reprovision_order();
    assert_eq!(order.len(), 3);
    assert_eq!(
        order[..2].iter().cloned().collect::<BTreeSet<_>>(),
        [follower_a.zonename.clone(), follower_b.zonename.clone()]
            .into_iter()
            .collect::<BTreeSet<_>>()
    );
    assert_eq!(order[2], leader.zonename);
    for node in t.inventory.instances_of(ENSEMBLE_SERVICE) {
        assert_eq!(node.image, new_image, "{}", node.alias);
    }

    // The followers settle in parallel (one 60s window), the leader in its
    // own.
    assert_eq!(start.elapsed(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn a_standalone_node_skips_the_rejoin_waits() {
    let exec = ScriptedExecutor::new(|_, command| {
        if command.contains("echo srvr") {
            Ok(ExecOutput::ok("Mode: standalone\n"))
        } else if command.contains("echo ruok") {
            panic!("no liveness wait for a standalone node");
        } else {
            Ok(ExecOutput::ok(""))
        }
    });
    let t = common::test_env_with_exec(exec);
    let new_image = Uuid::new_v4();
    let node = t.inventory.add_instance(
        ENSEMBLE_SERVICE,
        "arbiter0",
        "server-0",
        Uuid::new_v4(),
    );

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        ENSEMBLE_SERVICE,
        new_image,
    )]);
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.failed);
    assert_eq!(t.inventory.reprovision_order(), vec![node.zonename]);
}

#[tokio::test(start_paused = true)]
async fn refuses_an_ensemble_that_is_not_formed() {
    // Two leaders: a split observation, not a formed ensemble.
    let exec = ScriptedExecutor::new(|_, command| {
        if command.contains("echo srvr") {
            Ok(ExecOutput::ok("Mode: leader\n"))
        } else {
            Ok(ExecOutput::ok(""))
        }
    });
    let t = common::test_env_with_exec(exec);
    for alias in ["arbiter0", "arbiter1"] {
        t.inventory.add_instance(
            ENSEMBLE_SERVICE,
            alias,
            "server-0",
            Uuid::new_v4(),
        );
    }

    let plan = common::plan_of(vec![common::update_service_change(
        &t.inventory,
        ENSEMBLE_SERVICE,
        Uuid::new_v4(),
    )]);
    let outcome =
        PlanExecutor::new(t.env.clone()).execute(&plan).await.unwrap();
    assert!(!outcome.succeeded());
    let message = outcome.failed[0].1.to_string();
    assert!(message.contains("not fully formed"), "{message}");
    assert!(t.inventory.reprovision_order().is_empty());
}
