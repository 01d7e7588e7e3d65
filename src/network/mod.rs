// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The durable network model: fabrics group VLANs, VLANs carry subnets,
//! interfaces sit on VLANs and hold IP links. Also the wire shape of the
//! raw topology report a rack agent sends about its own interfaces.

pub mod gateway;
pub mod reconcile;
pub mod topo;

use std::collections::BTreeMap;
use std::net::IpAddr;

use cidr::IpCidr;
use serde::{Deserialize, Serialize};

use crate::node::{InterfaceId, IpLinkId};

pub type FabricId = u64;
pub type VlanId = u64;
pub type SubnetId = u64;

/// A broadcast-domain grouping of VLANs. Every fabric is created with a
/// default VLAN (VID 0) that untagged traffic belongs to.
#[derive(Debug, Clone)]
pub struct Fabric {
    pub id: FabricId,
    pub name: String,
    pub default_vlan: VlanId,
}

#[derive(Debug, Clone)]
pub struct Vlan {
    pub id: VlanId,
    pub fabric_id: FabricId,
    /// Unique within the fabric.
    pub vid: u16,
    pub dhcp_on: bool,
    /// Rack controllers managing DHCP on this VLAN, by system id. These
    /// double as the power-control fallback agents for nodes booting here.
    pub primary_rack: Option<String>,
    pub secondary_rack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub id: SubnetId,
    pub name: String,
    pub vlan_id: VlanId,
    pub cidr: IpCidr,
    pub gateway_ip: Option<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
}

impl Subnet {
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.cidr.contains(&addr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceKind {
    Physical,
    Bond,
    Bridge,
    Vlan,
    Alias,
}

#[derive(Debug, Clone)]
pub struct Interface {
    pub id: InterfaceId,
    /// Owning node's system id. An interface belongs to exactly one node.
    pub node: String,
    pub name: String,
    pub kind: InterfaceKind,
    pub mac_address: Option<String>,
    pub enabled: bool,
    pub vlan_id: Option<VlanId>,
    pub parents: Vec<InterfaceId>,
    /// VID configured on a vlan sub-interface.
    pub vid: Option<u16>,
    /// Bridges created at allocation time over existing interfaces; they
    /// are unwound on release, handing their addresses back to the parent.
    pub acquired: bool,
    pub link_ids: Vec<IpLinkId>,
}

/// How an address ended up on an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpAllocType {
    /// Assigned by the region when the node is deployed.
    Auto,
    /// Persistent, user- or reconciliation-assigned.
    Sticky,
    UserReserved,
    /// Leased by an external DHCP server; address may be unresolved.
    Dhcp,
    /// Passively observed (lease/ARP); replaced wholesale on every report.
    Discovered,
}

/// An IP address association. Shared between interfaces when several
/// legitimately hold the same address (a bridge and its parent).
#[derive(Debug, Clone)]
pub struct IpLink {
    pub id: IpLinkId,
    pub alloc_type: IpAllocType,
    pub address: Option<IpAddr>,
    pub subnet_id: Option<SubnetId>,
}

/// Raw per-controller topology report, as deserialized from an agent.
/// Keys are interface names; values describe the interface as the agent
/// sees it on the host.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyReport {
    pub interfaces: BTreeMap<String, ReportedInterface>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportedInterface {
    /// "physical", "vlan", "bond", or "bridge". Anything else aborts the
    /// whole report.
    #[serde(rename = "type")]
    pub kind: String,
    pub mac_address: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub parents: Vec<String>,
    /// Configured VID, for vlan sub-interfaces.
    pub vid: Option<u16>,
    #[serde(default)]
    pub links: Vec<ReportedLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportedLink {
    /// "dhcp" or "static".
    pub mode: String,
    /// Address in `addr/prefix` notation, when known.
    pub address: Option<String>,
    pub gateway: Option<IpAddr>,
}

fn default_true() -> bool {
    true
}

impl ReportedInterface {
    pub fn physical(mac: &str, links: Vec<ReportedLink>) -> Self {
        ReportedInterface {
            kind: "physical".to_string(),
            mac_address: Some(mac.to_string()),
            enabled: true,
            parents: Vec::new(),
            vid: None,
            links,
        }
    }
}

impl ReportedLink {
    pub fn dhcp() -> Self {
        ReportedLink {
            mode: "dhcp".to_string(),
            address: None,
            gateway: None,
        }
    }

    pub fn static_addr(address: &str) -> Self {
        ReportedLink {
            mode: "static".to_string(),
            address: Some(address.to_string()),
            gateway: None,
        }
    }
}
