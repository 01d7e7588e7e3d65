// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use anvil_lib::{
        error::Error,
        event::EventKind,
        network::IpAllocType,
        node::PowerState,
        status::NodeStatus,
        test_env::*,
        workflows::{Requester, StopOutcome},
    };
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn power_on_dispatches_to_a_routable_rack() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Ready);
        env.attach_bmc(&node.system_id, &["rack01"]);

        let node = env.store.get_node(&node.system_id).unwrap();
        let state = env.power.power_on(&node).await.unwrap();
        assert_eq!(state, PowerState::On);
        assert!(env.racks[0]
            .calls()
            .iter()
            .any(|c| c == &format!("on {}", node.system_id)));
    }

    #[tokio::test]
    async fn broadcast_rediscovery_persists_routable_sets() {
        let rack01 = FakeRack::new("rack01");
        let rack02 = FakeRack::new("rack02");
        *rack01.query_fails.lock().unwrap() = true;
        let env = TestEnv::with_racks(vec![rack01.clone(), rack02.clone()]);

        let node = env.add_machine("host0", NodeStatus::Ready);
        // A BMC nobody is known to reach.
        let bmc = env.attach_bmc(&node.system_id, &[]);
        rack02.set_power_state(&node.system_id, PowerState::Off);

        let node = env.store.get_node(&node.system_id).unwrap();
        let state = env.power.power_on(&node).await.unwrap();
        assert_eq!(state, PowerState::On);

        // The broadcast learned who can reach the BMC and recorded the
        // state it saw in passing.
        let bmc = env.store.get_bmc(bmc.id).unwrap();
        assert_eq!(bmc.routable_rack_ids, vec!["rack02".to_string()]);
        assert_eq!(bmc.non_routable_rack_ids, vec!["rack01".to_string()]);
        let observed = env.store.get_node(&node.system_id).unwrap();
        assert_eq!(observed.power_state, PowerState::Off);

        // The actual dispatch went through the routable rack.
        assert!(rack02
            .calls()
            .iter()
            .any(|c| c == &format!("on {}", node.system_id)));
        assert!(!rack01
            .calls()
            .iter()
            .any(|c| c.starts_with("on ")));
    }

    #[tokio::test]
    async fn boot_vlan_racks_are_the_fallback_route() {
        let rack01 = FakeRack::new("rack01");
        // Queries never make it through, so rediscovery finds nothing;
        // control operations still work once connected.
        *rack01.query_fails.lock().unwrap() = true;
        let env = TestEnv::with_racks(vec![rack01.clone()]);

        let node = env.add_machine("host0", NodeStatus::Ready);
        env.attach_bmc(&node.system_id, &[]);
        env.with_network(&node.system_id, "10.0.0.0/24", IpAllocType::Auto, None)
            .unwrap();
        let fabric = env.store.default_fabric();
        let mut vlan = env.store.get_vlan(fabric.default_vlan).unwrap();
        vlan.dhcp_on = true;
        vlan.primary_rack = Some("rack01".to_string());
        env.store.save_vlan(vlan).unwrap();

        let node = env.store.get_node(&node.system_id).unwrap();
        let state = env.power.power_on(&node).await.unwrap();
        assert_eq!(state, PowerState::On);
        assert!(rack01
            .calls()
            .iter()
            .any(|c| c == &format!("on {}", node.system_id)));
    }

    #[tokio::test]
    async fn no_route_to_bmc_is_reported_by_hostname() {
        let rack01 = FakeRack::new("rack01");
        *rack01.query_fails.lock().unwrap() = true;
        let env = TestEnv::with_racks(vec![rack01]);

        let node = env.add_machine("host0", NodeStatus::Ready);
        env.attach_bmc(&node.system_id, &[]);

        let node = env.store.get_node(&node.system_id).unwrap();
        let err = env.power.power_on(&node).await.unwrap_err();
        assert!(matches!(err, Error::PowerProblem(_)));
        assert_eq!(
            err.to_string(),
            "No rack controllers can access the BMC of node host0"
        );
    }

    #[tokio::test]
    async fn missing_driver_packages_block_the_dispatch() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Ready);
        env.attach_bmc(&node.system_id, &["rack01"]);
        *env.racks[0].missing_packages.lock().unwrap() =
            vec!["ipmitool".to_string(), "freeipmi".to_string()];

        let node = env.store.get_node(&node.system_id).unwrap();
        let err = env.power.power_on(&node).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Power control software is missing from the rack controller rack01. \
             To proceed, install the freeipmi and ipmitool packages."
        );
        assert!(!env.racks[0].calls().iter().any(|c| c.starts_with("on ")));
    }

    #[tokio::test]
    async fn agent_failure_surfaces_as_a_power_problem() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Ready);
        env.attach_bmc(&node.system_id, &["rack01"]);
        *env.racks[0].fail_message.lock().unwrap() =
            Some("IPMI: session could not be established".to_string());

        let node = env.store.get_node(&node.system_id).unwrap();
        let err = env.power.power_on(&node).await.unwrap_err();
        assert!(matches!(err, Error::PowerProblem(_)));
        assert!(err.to_string().contains("session could not be established"));
    }

    #[tokio::test]
    async fn query_records_an_audit_event_each_way() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        env.attach_bmc(&node.system_id, &["rack01"]);
        env.racks[0].set_power_state(&node.system_id, PowerState::On);

        let state = env
            .machines
            .query_power(&node.system_id, &Requester::admin("admin"))
            .await
            .unwrap();
        assert_eq!(state, PowerState::On);
        let observed = env.store.get_node(&node.system_id).unwrap();
        assert_eq!(observed.power_state, PowerState::On);
        assert!(observed.power_state_updated.is_some());
        assert!(env
            .events
            .events()
            .iter()
            .any(|e| e.kind == EventKind::PowerQueried));

        *env.racks[0].fail_message.lock().unwrap() = Some("BMC went away".to_string());
        assert!(env
            .machines
            .query_power(&node.system_id, &Requester::admin("admin"))
            .await
            .is_err());
        assert!(env
            .events
            .events()
            .iter()
            .any(|e| e.kind == EventKind::PowerQueryFailed));
    }

    #[tokio::test]
    async fn manual_power_type_answers_unknown_without_a_rack_call() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        let bmc = env
            .store
            .get_or_create_bmc("manual", BTreeMap::new());
        let mut record = env.store.get_node(&node.system_id).unwrap();
        record.bmc_id = Some(bmc.id);
        env.store.save_node(record).unwrap();

        let state = env
            .machines
            .query_power(&node.system_id, &Requester::admin("admin"))
            .await
            .unwrap();
        assert_eq!(state, PowerState::Unknown);
        assert!(env.racks[0].calls().is_empty());
    }

    #[tokio::test]
    async fn stop_without_a_bmc_is_nothing_to_do() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        let outcome = env
            .machines
            .stop(&node.system_id, &Requester::admin("admin"), None)
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::NothingToDo);
        assert!(env.racks[0].calls().is_empty());
    }

    #[test]
    fn power_info_is_soft_on_missing_configuration() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let node = env.store.get_node(&node.system_id).unwrap();
        let info = env.power.effective_power_info(&node);
        assert!(!info.can_be_started);
        assert!(!info.can_be_stopped);
        assert!(!info.can_be_queried);
        assert!(info.power_type.is_none());
    }
}
