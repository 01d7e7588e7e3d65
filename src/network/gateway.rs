// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Default gateway and DNS selection. A node rarely has one obvious
//! uplink; this module ranks every interface/subnet path that offers a
//! gateway and picks the best per address family.

use std::net::IpAddr;
use std::sync::Arc;

use crate::network::{Interface, InterfaceKind, IpAllocType, IpLink};
use crate::node::{InterfaceId, NodeRecord};
use crate::store::Store;

/// The ranking rules, kept as an explicit value so the preference order
/// can evolve (or be swapped in tests) without touching the selection
/// algorithm. Lower rank wins.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    pub bond_bridge_rank: u8,
    pub boot_physical_rank: u8,
    pub physical_rank: u8,
    pub vlan_rank: u8,
    pub alias_rank: u8,
    pub other_rank: u8,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        GatewayPolicy {
            bond_bridge_rank: 1,
            boot_physical_rank: 2,
            physical_rank: 3,
            vlan_rank: 4,
            alias_rank: 5,
            other_rank: 6,
        }
    }
}

impl GatewayPolicy {
    fn interface_rank(&self, iface: &Interface, boot_iface: Option<InterfaceId>) -> u8 {
        match iface.kind {
            InterfaceKind::Bond | InterfaceKind::Bridge => self.bond_bridge_rank,
            InterfaceKind::Physical if Some(iface.id) == boot_iface => self.boot_physical_rank,
            InterfaceKind::Physical => self.physical_rank,
            InterfaceKind::Vlan => self.vlan_rank,
            InterfaceKind::Alias => self.alias_rank,
        }
    }

    /// Only deliberately-assigned addresses can nominate a gateway.
    fn alloc_rank(&self, alloc: IpAllocType) -> Option<u8> {
        match alloc {
            IpAllocType::Sticky => Some(1),
            IpAllocType::UserReserved => Some(2),
            IpAllocType::Auto => Some(3),
            IpAllocType::Dhcp | IpAllocType::Discovered => None,
        }
    }
}

/// One resolved default route for a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultGateway {
    pub interface_id: InterfaceId,
    pub subnet_id: u64,
    pub gateway_ip: IpAddr,
}

pub struct GatewaySelector {
    store: Arc<Store>,
    policy: GatewayPolicy,
}

impl GatewaySelector {
    pub fn new(store: Arc<Store>, policy: GatewayPolicy) -> Self {
        GatewaySelector { store, policy }
    }

    /// Best-guess default gateways, (IPv4, IPv6). A gateway link pinned
    /// on the node wins outright for its family, as long as its subnet
    /// still has a gateway address; otherwise candidates are ranked by
    /// DHCP-managed VLAN, interface type, allocation type, and finally
    /// interface id.
    pub fn default_gateways(
        &self,
        node: &NodeRecord,
    ) -> (Option<DefaultGateway>, Option<DefaultGateway>) {
        let pinned_v4 = node
            .gateway_link_ipv4
            .and_then(|link_id| self.resolve_pinned(node, link_id, true));
        let pinned_v6 = node
            .gateway_link_ipv6
            .and_then(|link_id| self.resolve_pinned(node, link_id, false));

        let mut best_v4 = pinned_v4;
        let mut best_v6 = pinned_v6;
        if best_v4.is_some() && best_v6.is_some() {
            return (best_v4, best_v6);
        }

        let mut candidates = self.ranked_candidates(node);
        candidates.sort_by_key(|(rank, _)| *rank);
        for (_, gw) in candidates {
            match gw.gateway_ip {
                IpAddr::V4(_) if best_v4.is_none() => best_v4 = Some(gw),
                IpAddr::V6(_) if best_v6.is_none() => best_v6 = Some(gw),
                _ => {}
            }
        }
        (best_v4, best_v6)
    }

    /// The DNS servers this node should be handed: explicit servers on a
    /// gateway subnet when available (IPv4 family first), otherwise the
    /// boot cluster address, provided its family matches a family the
    /// node actually routes.
    pub fn default_dns_servers(&self, node: &NodeRecord) -> Vec<IpAddr> {
        let (v4, v6) = self.default_gateways(node);
        for gw in [&v4, &v6].into_iter().flatten() {
            if let Ok(subnet) = self.store.get_subnet(gw.subnet_id) {
                if !subnet.dns_servers.is_empty() {
                    return subnet.dns_servers;
                }
            }
        }
        let Some(cluster_ip) = node.boot_cluster_ip else {
            return Vec::new();
        };
        let family_routed = match cluster_ip {
            IpAddr::V4(_) => v4.is_some(),
            IpAddr::V6(_) => v6.is_some(),
        };
        if family_routed || (v4.is_none() && v6.is_none()) {
            vec![cluster_ip]
        } else {
            Vec::new()
        }
    }

    fn resolve_pinned(
        &self,
        node: &NodeRecord,
        link_id: u64,
        want_v4: bool,
    ) -> Option<DefaultGateway> {
        let link = self.store.get_link(link_id).ok()?;
        let subnet = link.subnet_id.and_then(|id| self.store.get_subnet(id).ok())?;
        let gateway_ip = subnet.gateway_ip?;
        if gateway_ip.is_ipv4() != want_v4 {
            return None;
        }
        let iface = self
            .store
            .interfaces_for_node(&node.system_id)
            .into_iter()
            .find(|i| i.link_ids.contains(&link_id))?;
        Some(DefaultGateway {
            interface_id: iface.id,
            subnet_id: subnet.id,
            gateway_ip,
        })
    }

    /// Every (interface, link, subnet) path that offers a gateway, keyed
    /// by its rank tuple.
    fn ranked_candidates(
        &self,
        node: &NodeRecord,
    ) -> Vec<((bool, u8, u8, InterfaceId), DefaultGateway)> {
        let mut out = Vec::new();
        for iface in self.store.interfaces_for_node(&node.system_id) {
            if !iface.enabled {
                continue;
            }
            let dhcp_on = iface
                .vlan_id
                .and_then(|id| self.store.get_vlan(id).ok())
                .map(|v| v.dhcp_on)
                .unwrap_or(false);
            let iface_rank = self.policy.interface_rank(&iface, node.boot_interface_id);
            for link in self.store.links_for_interface(&iface) {
                let Some(candidate) = self.candidate_from_link(&iface, &link) else {
                    continue;
                };
                let Some(alloc_rank) = self.policy.alloc_rank(link.alloc_type) else {
                    continue;
                };
                // false < true, so DHCP-managed VLANs sort first.
                out.push(((!dhcp_on, iface_rank, alloc_rank, iface.id), candidate));
            }
        }
        out
    }

    fn candidate_from_link(&self, iface: &Interface, link: &IpLink) -> Option<DefaultGateway> {
        let subnet = link.subnet_id.and_then(|id| self.store.get_subnet(id).ok())?;
        let gateway_ip = subnet.gateway_ip?;
        Some(DefaultGateway {
            interface_id: iface.id,
            subnet_id: subnet.id,
            gateway_ip,
        })
    }
}
