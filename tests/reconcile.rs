// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use anvil_lib::{
        error::Error,
        network::{
            reconcile::InterfaceReconciler, InterfaceKind, IpAllocType, ReportedInterface,
            ReportedLink, TopologyReport,
        },
        status::NodeStatus,
        test_env::*,
    };

    fn report(entries: Vec<(&str, ReportedInterface)>) -> TopologyReport {
        TopologyReport {
            interfaces: entries
                .into_iter()
                .map(|(name, iface)| (name.to_string(), iface))
                .collect(),
        }
    }

    fn bond(parents: &[&str], links: Vec<ReportedLink>) -> ReportedInterface {
        ReportedInterface {
            kind: "bond".to_string(),
            mac_address: None,
            enabled: true,
            parents: parents.iter().map(|p| p.to_string()).collect(),
            vid: None,
            links,
        }
    }

    fn vlan_sub(parent: &str, vid: u16, links: Vec<ReportedLink>) -> ReportedInterface {
        ReportedInterface {
            kind: "vlan".to_string(),
            mac_address: None,
            enabled: true,
            parents: vec![parent.to_string()],
            vid: Some(vid),
            links,
        }
    }

    #[test]
    fn bond_members_exist_before_the_bond_and_share_its_vlan() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        // First sighting: two standalone NICs land on separate fabrics.
        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    ("eth1", ReportedInterface::physical("aa:bb:cc:00:00:02", vec![])),
                ]),
            )
            .unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let eth1 = env.store.interface_by_name(&node.system_id, "eth1").unwrap();
        assert_ne!(eth0.vlan_id, eth1.vlan_id);

        // The admin then bonds them; members follow the bond onto one VLAN.
        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    ("eth1", ReportedInterface::physical("aa:bb:cc:00:00:02", vec![])),
                    ("bond0", bond(&["eth0", "eth1"], vec![ReportedLink::dhcp()])),
                ]),
            )
            .unwrap();
        let bond0 = env.store.interface_by_name(&node.system_id, "bond0").unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let eth1 = env.store.interface_by_name(&node.system_id, "eth1").unwrap();
        assert_eq!(bond0.kind, InterfaceKind::Bond);
        assert_eq!(bond0.parents, vec![eth0.id, eth1.id]);
        assert_eq!(eth0.vlan_id, bond0.vlan_id);
        assert_eq!(eth1.vlan_id, bond0.vlan_id);
    }

    #[test]
    fn unreported_interfaces_are_deleted_children_first() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    ("eth1", ReportedInterface::physical("aa:bb:cc:00:00:02", vec![])),
                    ("bond0", bond(&["eth0", "eth1"], vec![ReportedLink::dhcp()])),
                    ("bond0.100", vlan_sub("bond0", 100, vec![])),
                ]),
            )
            .unwrap();
        assert_eq!(env.store.interfaces_for_node(&node.system_id).len(), 4);

        // The bond was torn down on the host; only the NICs remain.
        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    ("eth1", ReportedInterface::physical("aa:bb:cc:00:00:02", vec![])),
                ]),
            )
            .unwrap();
        let names: Vec<String> = env
            .store
            .interfaces_for_node(&node.system_id)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"eth0".to_string()));
        assert!(names.contains(&"eth1".to_string()));
    }

    #[test]
    fn static_address_on_unknown_network_creates_the_subnet() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    ("eth1", ReportedInterface::physical("aa:bb:cc:00:00:02", vec![])),
                    (
                        "bond0",
                        bond(
                            &["eth0", "eth1"],
                            vec![ReportedLink::static_addr("192.168.10.2/24")],
                        ),
                    ),
                ]),
            )
            .unwrap();

        let subnet = env
            .store
            .subnets()
            .into_iter()
            .find(|s| s.cidr.to_string() == "192.168.10.0/24")
            .unwrap();
        let bond0 = env.store.interface_by_name(&node.system_id, "bond0").unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let eth1 = env.store.interface_by_name(&node.system_id, "eth1").unwrap();
        assert_eq!(Some(subnet.vlan_id), bond0.vlan_id);
        assert_eq!(eth0.vlan_id, bond0.vlan_id);
        assert_eq!(eth1.vlan_id, bond0.vlan_id);

        let links = env.store.links_for_interface(&bond0);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].alloc_type, IpAllocType::Sticky);
        assert_eq!(
            links[0].address,
            Some("192.168.10.2".parse().unwrap())
        );
        assert_eq!(links[0].subnet_id, Some(subnet.id));
    }

    #[test]
    fn re_reporting_the_same_configuration_changes_nothing() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        let topology = report(vec![(
            "eth0",
            ReportedInterface::physical(
                "aa:bb:cc:00:00:01",
                vec![
                    ReportedLink::static_addr("192.168.10.2/24"),
                    ReportedLink::dhcp(),
                ],
            ),
        )]);
        reconciler.update_interfaces(&node.system_id, &topology).unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let before: Vec<u64> = {
            let mut ids: Vec<u64> = env
                .store
                .links_for_interface(&eth0)
                .iter()
                .map(|l| l.id)
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(before.len(), 2);

        reconciler.update_interfaces(&node.system_id, &topology).unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let mut after: Vec<u64> = env
            .store
            .links_for_interface(&eth0)
            .iter()
            .map(|l| l.id)
            .collect();
        after.sort();
        assert_eq!(before, after);
    }

    #[test]
    fn discovered_links_are_replaced_wholesale() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        let discovered = |addr: &str| ReportedLink {
            mode: "discovered".to_string(),
            address: Some(addr.to_string()),
            gateway: None,
        };
        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![(
                    "eth0",
                    ReportedInterface::physical(
                        "aa:bb:cc:00:00:01",
                        vec![discovered("10.1.0.5/24")],
                    ),
                )]),
            )
            .unwrap();
        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![(
                    "eth0",
                    ReportedInterface::physical(
                        "aa:bb:cc:00:00:01",
                        vec![discovered("10.1.0.9/24")],
                    ),
                )]),
            )
            .unwrap();
        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let links = env.store.links_for_interface(&eth0);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].address, Some("10.1.0.9".parse().unwrap()));
    }

    #[test]
    fn unknown_interface_type_aborts_before_any_mutation() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        let err = reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("eth0", ReportedInterface::physical("aa:bb:cc:00:00:01", vec![])),
                    (
                        "tun0",
                        ReportedInterface {
                            kind: "tunnel".to_string(),
                            mac_address: None,
                            enabled: true,
                            parents: Vec::new(),
                            vid: None,
                            links: Vec::new(),
                        },
                    ),
                ]),
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadReport(_)));
        assert!(env.store.interfaces_for_node(&node.system_id).is_empty());
    }

    #[test]
    fn a_mac_that_moved_nodes_is_claimed_by_the_newest_report() {
        let env = TestEnv::new();
        let old = env.add_machine("host0", NodeStatus::New);
        let new = env.add_machine("host1", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &old.system_id,
                &report(vec![(
                    "eth0",
                    ReportedInterface::physical(
                        "aa:bb:cc:00:00:01",
                        vec![ReportedLink::static_addr("192.168.10.2/24")],
                    ),
                )]),
            )
            .unwrap();

        reconciler
            .update_interfaces(
                &new.system_id,
                &report(vec![(
                    "ens3",
                    ReportedInterface::physical("aa:bb:cc:00:00:01", vec![]),
                )]),
            )
            .unwrap();

        assert!(env.store.interfaces_for_node(&old.system_id).is_empty());
        let claimed = env.store.interface_by_name(&new.system_id, "ens3").unwrap();
        assert_eq!(claimed.mac_address.as_deref(), Some("aa:bb:cc:00:00:01"));
        // The address history belonged to the old host and was dropped.
        assert!(env.store.links_for_interface(&claimed).is_empty());
    }

    #[test]
    fn a_claimed_mac_displaces_a_same_named_interface() {
        let env = TestEnv::new();
        let donor = env.add_machine("host0", NodeStatus::New);
        let claimant = env.add_machine("host1", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &donor.system_id,
                &report(vec![(
                    "ens3",
                    ReportedInterface::physical("aa:bb:cc:00:00:01", vec![]),
                )]),
            )
            .unwrap();
        reconciler
            .update_interfaces(
                &claimant.system_id,
                &report(vec![(
                    "ens3",
                    ReportedInterface::physical("aa:bb:cc:00:00:02", vec![]),
                )]),
            )
            .unwrap();

        // The first NIC is physically moved into the claimant, replacing
        // its old card under the same name.
        reconciler
            .update_interfaces(
                &claimant.system_id,
                &report(vec![(
                    "ens3",
                    ReportedInterface::physical("aa:bb:cc:00:00:01", vec![]),
                )]),
            )
            .unwrap();

        let ifaces = env.store.interfaces_for_node(&claimant.system_id);
        assert_eq!(ifaces.len(), 1);
        assert_eq!(ifaces[0].name, "ens3");
        assert_eq!(ifaces[0].mac_address.as_deref(), Some("aa:bb:cc:00:00:01"));
        assert!(env.store.interfaces_for_node(&donor.system_id).is_empty());
        assert!(env
            .store
            .physical_interface_by_mac("aa:bb:cc:00:00:02")
            .is_none());
    }

    #[test]
    fn vlan_interface_follows_a_statically_addressed_parent() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    (
                        "eth0",
                        ReportedInterface::physical(
                            "aa:bb:cc:00:00:01",
                            vec![ReportedLink::static_addr("192.168.10.2/24")],
                        ),
                    ),
                    ("eth0.100", vlan_sub("eth0", 100, vec![])),
                ]),
            )
            .unwrap();

        let eth0 = env.store.interface_by_name(&node.system_id, "eth0").unwrap();
        let tagged = env
            .store
            .interface_by_name(&node.system_id, "eth0.100")
            .unwrap();
        assert_eq!(tagged.kind, InterfaceKind::Vlan);
        assert_eq!(tagged.vid, Some(100));
        assert_eq!(tagged.parents, vec![eth0.id]);

        let parent_vlan = env.store.get_vlan(eth0.vlan_id.unwrap()).unwrap();
        let tagged_vlan = env.store.get_vlan(tagged.vlan_id.unwrap()).unwrap();
        assert_eq!(tagged_vlan.fabric_id, parent_vlan.fabric_id);
        assert_eq!(tagged_vlan.vid, 100);
    }

    #[test]
    fn subnets_learn_their_gateway_once() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        let with_gateway = |gw: &str| {
            report(vec![(
                "eth0",
                ReportedInterface::physical(
                    "aa:bb:cc:00:00:01",
                    vec![ReportedLink {
                        mode: "static".to_string(),
                        address: Some("192.168.10.2/24".to_string()),
                        gateway: Some(gw.parse().unwrap()),
                    }],
                ),
            )])
        };
        reconciler
            .update_interfaces(&node.system_id, &with_gateway("192.168.10.1"))
            .unwrap();
        reconciler
            .update_interfaces(&node.system_id, &with_gateway("192.168.10.254"))
            .unwrap();

        let subnet = env
            .store
            .subnets()
            .into_iter()
            .find(|s| s.cidr.to_string() == "192.168.10.0/24")
            .unwrap();
        assert_eq!(subnet.gateway_ip, Some("192.168.10.1".parse().unwrap()));
    }

    #[test]
    fn parentless_bond_is_skipped_but_a_bare_bridge_is_kept() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::New);
        let reconciler = InterfaceReconciler::new(env.store.clone());

        reconciler
            .update_interfaces(
                &node.system_id,
                &report(vec![
                    ("bond0", bond(&[], vec![])),
                    (
                        "virbr0",
                        ReportedInterface {
                            kind: "bridge".to_string(),
                            mac_address: Some("aa:bb:cc:00:00:09".to_string()),
                            enabled: true,
                            parents: Vec::new(),
                            vid: None,
                            links: vec![ReportedLink::static_addr("192.168.122.1/24")],
                        },
                    ),
                ]),
            )
            .unwrap();

        assert!(env.store.interface_by_name(&node.system_id, "bond0").is_none());
        let bridge = env
            .store
            .interface_by_name(&node.system_id, "virbr0")
            .unwrap();
        assert_eq!(bridge.kind, InterfaceKind::Bridge);
    }
}
