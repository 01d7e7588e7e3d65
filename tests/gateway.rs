// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use anvil_lib::{
        network::{
            gateway::{GatewayPolicy, GatewaySelector},
            Interface, InterfaceKind, IpAllocType, IpLink, Subnet,
        },
        status::NodeStatus,
        test_env::*,
    };

    fn selector(env: &TestEnv) -> GatewaySelector {
        GatewaySelector::new(env.store.clone(), GatewayPolicy::default())
    }

    /// Wire one interface with one addressed link on its own fabric.
    /// Returns the interface and the link.
    #[allow(clippy::too_many_arguments)]
    fn wire(
        env: &TestEnv,
        system_id: &str,
        name: &str,
        kind: InterfaceKind,
        cidr: &str,
        gateway: Option<&str>,
        alloc_type: IpAllocType,
        address: &str,
        dhcp_on: bool,
    ) -> (Interface, IpLink, Subnet) {
        let fabric = env.store.create_next_fabric();
        let mut vlan = env.store.get_vlan(fabric.default_vlan).unwrap();
        vlan.dhcp_on = dhcp_on;
        env.store.save_vlan(vlan).unwrap();
        let subnet = env
            .store
            .create_subnet(
                cidr,
                fabric.default_vlan,
                cidr.parse().unwrap(),
                gateway.map(|g| g.parse().unwrap()),
                Vec::new(),
            )
            .unwrap();
        let iface = env
            .store
            .create_interface(Interface {
                id: 0,
                node: system_id.to_string(),
                name: name.to_string(),
                kind,
                mac_address: Some(format!("52:54:00:00:{:02x}:01", subnet.id as u8)),
                enabled: true,
                vlan_id: Some(fabric.default_vlan),
                parents: Vec::new(),
                vid: None,
                acquired: false,
                link_ids: Vec::new(),
            })
            .unwrap();
        let link = env
            .store
            .create_link(
                iface.id,
                IpLink {
                    id: 0,
                    alloc_type,
                    address: Some(address.parse().unwrap()),
                    subnet_id: Some(subnet.id),
                },
            )
            .unwrap();
        let iface = env.store.get_interface(iface.id).unwrap();
        (iface, link, subnet)
    }

    #[test]
    fn bridge_on_a_dhcp_vlan_beats_a_physical_sticky_path() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);

        let (_phys, _, _) = wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Sticky,
            "10.1.0.10",
            false,
        );
        let (bridge, _, bridge_subnet) = wire(
            &env,
            &node.system_id,
            "br0",
            InterfaceKind::Bridge,
            "10.2.0.0/24",
            Some("10.2.0.1"),
            IpAllocType::Auto,
            "10.2.0.10",
            true,
        );

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, v6) = selector(&env).default_gateways(&node);
        let v4 = v4.unwrap();
        assert!(v6.is_none());
        assert_eq!(v4.interface_id, bridge.id);
        assert_eq!(v4.subnet_id, bridge_subnet.id);
        assert_eq!(v4.gateway_ip, "10.2.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn allocation_type_breaks_ties_between_equal_interfaces() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);

        let (_auto_iface, _, _) = wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Auto,
            "10.1.0.10",
            false,
        );
        let (sticky_iface, _, _) = wire(
            &env,
            &node.system_id,
            "eth1",
            InterfaceKind::Physical,
            "10.2.0.0/24",
            Some("10.2.0.1"),
            IpAllocType::Sticky,
            "10.2.0.10",
            false,
        );

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, _) = selector(&env).default_gateways(&node);
        assert_eq!(v4.unwrap().interface_id, sticky_iface.id);
    }

    #[test]
    fn dhcp_and_discovered_addresses_never_nominate_a_gateway() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Dhcp,
            "10.1.0.10",
            true,
        );
        wire(
            &env,
            &node.system_id,
            "eth1",
            InterfaceKind::Physical,
            "10.2.0.0/24",
            Some("10.2.0.1"),
            IpAllocType::Discovered,
            "10.2.0.10",
            false,
        );

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, v6) = selector(&env).default_gateways(&node);
        assert!(v4.is_none());
        assert!(v6.is_none());
    }

    #[test]
    fn a_pinned_gateway_link_wins_outright() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);

        let (_bridge, _, _) = wire(
            &env,
            &node.system_id,
            "br0",
            InterfaceKind::Bridge,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Sticky,
            "10.1.0.10",
            true,
        );
        let (vlan_iface, pinned_link, pinned_subnet) = wire(
            &env,
            &node.system_id,
            "eth0.30",
            InterfaceKind::Vlan,
            "10.3.0.0/24",
            Some("10.3.0.1"),
            IpAllocType::Sticky,
            "10.3.0.10",
            false,
        );

        let mut record = env.store.get_node(&node.system_id).unwrap();
        record.gateway_link_ipv4 = Some(pinned_link.id);
        env.store.save_node(record).unwrap();

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, _) = selector(&env).default_gateways(&node);
        let v4 = v4.unwrap();
        assert_eq!(v4.interface_id, vlan_iface.id);
        assert_eq!(v4.subnet_id, pinned_subnet.id);
    }

    #[test]
    fn families_are_selected_independently() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Sticky,
            "10.1.0.10",
            false,
        );
        wire(
            &env,
            &node.system_id,
            "eth1",
            InterfaceKind::Physical,
            "fd00:10::/64",
            Some("fd00:10::1"),
            IpAllocType::Sticky,
            "fd00:10::10",
            false,
        );

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, v6) = selector(&env).default_gateways(&node);
        assert_eq!(
            v4.unwrap().gateway_ip,
            "10.1.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            v6.unwrap().gateway_ip,
            "fd00:10::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn disabled_interfaces_are_invisible_to_selection() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        let (iface, _, _) = wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Sticky,
            "10.1.0.10",
            false,
        );
        let mut iface = iface;
        iface.enabled = false;
        env.store.save_interface(iface).unwrap();

        let node = env.store.get_node(&node.system_id).unwrap();
        let (v4, _) = selector(&env).default_gateways(&node);
        assert!(v4.is_none());
    }

    #[test]
    fn dns_prefers_explicit_servers_on_the_gateway_subnet() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);
        let (_, _, subnet) = wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "10.1.0.0/24",
            Some("10.1.0.1"),
            IpAllocType::Sticky,
            "10.1.0.10",
            false,
        );
        let mut subnet = subnet;
        subnet.dns_servers = vec!["10.1.0.2".parse().unwrap()];
        env.store.save_subnet(subnet).unwrap();

        let mut record = env.store.get_node(&node.system_id).unwrap();
        record.boot_cluster_ip = Some("10.0.0.1".parse().unwrap());
        env.store.save_node(record).unwrap();

        let node = env.store.get_node(&node.system_id).unwrap();
        let servers = selector(&env).default_dns_servers(&node);
        assert_eq!(servers, vec!["10.1.0.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn dns_falls_back_to_the_boot_cluster_address() {
        let env = TestEnv::new();
        let node = env.add_machine("host0", NodeStatus::Deployed);

        // No gateways at all: the cluster address is all we have.
        let mut record = env.store.get_node(&node.system_id).unwrap();
        record.boot_cluster_ip = Some("10.0.0.1".parse().unwrap());
        env.store.save_node(record).unwrap();
        let node_record = env.store.get_node(&node.system_id).unwrap();
        assert_eq!(
            selector(&env).default_dns_servers(&node_record),
            vec!["10.0.0.1".parse::<IpAddr>().unwrap()]
        );

        // An IPv6-only default route makes the IPv4 cluster address
        // unreachable for name resolution.
        wire(
            &env,
            &node.system_id,
            "eth0",
            InterfaceKind::Physical,
            "fd00:10::/64",
            Some("fd00:10::1"),
            IpAllocType::Sticky,
            "fd00:10::10",
            false,
        );
        let node_record = env.store.get_node(&node.system_id).unwrap();
        assert!(selector(&env).default_dns_servers(&node_record).is_empty());
    }
}
