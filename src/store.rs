// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The in-memory persistence collaborator. All durable state lives here:
//! nodes, BMCs, and the network model. Methods take the table lock, act,
//! and release it before returning; the lock is never held across an
//! await, so workflows interleave mutations with agent calls freely.
//!
//! The save path is where the data-model rules live: the status
//! transition table, the previous-status bookkeeping, the monitoring
//! deadline rule, and the orphaned-BMC sweep.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Mutex;

use cidr::IpCidr;
use log::info;

use crate::error::{Error, Result};
use crate::network::{
    Fabric, FabricId, Interface, InterfaceKind, IpLink, Subnet, SubnetId, Vlan, VlanId,
};
use crate::node::{BmcId, InterfaceId, IpLinkId, NodeRecord};
use crate::power::driver::Bmc;
use crate::status::{is_transition_allowed, NodeStatus};

#[derive(Default)]
struct Tables {
    nodes: BTreeMap<String, NodeRecord>,
    bmcs: BTreeMap<BmcId, Bmc>,
    fabrics: BTreeMap<FabricId, Fabric>,
    vlans: BTreeMap<VlanId, Vlan>,
    subnets: BTreeMap<SubnetId, Subnet>,
    interfaces: BTreeMap<InterfaceId, Interface>,
    links: BTreeMap<IpLinkId, IpLink>,
    next_id: u64,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Drop `bmc_id` if no node references it any longer. Best effort:
    /// a BMC that survives a missed sweep is picked up by the next one.
    fn sweep_bmc(&mut self, bmc_id: BmcId) {
        let referenced = self.nodes.values().any(|n| n.bmc_id == Some(bmc_id));
        if !referenced && self.bmcs.remove(&bmc_id).is_some() {
            info!("removed orphaned BMC {bmc_id}");
        }
    }
}

#[derive(Default)]
pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // Poisoning means another thread panicked mid-mutation; there is
        // no sane recovery for shared in-memory tables.
        self.tables.lock().unwrap()
    }

    // ----- nodes -----

    pub fn add_node(&self, node: NodeRecord) -> Result<NodeRecord> {
        let mut t = self.lock();
        if t.nodes.contains_key(&node.system_id) {
            return Err(Error::Duplicate {
                entity: "node",
                value: node.system_id,
            });
        }
        if t.nodes.values().any(|n| n.hostname == node.hostname) {
            return Err(Error::Duplicate {
                entity: "hostname",
                value: node.hostname,
            });
        }
        t.nodes.insert(node.system_id.clone(), node.clone());
        Ok(node)
    }

    pub fn get_node(&self, system_id: &str) -> Result<NodeRecord> {
        self.lock()
            .nodes
            .get(system_id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity: "node",
                value: system_id.to_string(),
            })
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.lock().nodes.values().cloned().collect()
    }

    /// Persist a modified node. This is the chokepoint for the status
    /// rules:
    ///
    /// * a status change must be an edge in the transition table;
    /// * on a change, the old status is recorded as `previous_status`,
    ///   except while inside the rescue-mode cycle, so that exiting
    ///   rescue mode can still see where the node came from;
    /// * a node saved in a non-monitored status loses any deadline, so a
    ///   stale deadline can never fail a node that has moved on.
    pub fn save_node(&self, mut node: NodeRecord) -> Result<NodeRecord> {
        let mut t = self.lock();
        let old = t.nodes.get(&node.system_id).ok_or_else(|| Error::NotFound {
            entity: "node",
            value: node.system_id.clone(),
        })?;

        if node.status != old.status {
            if !is_transition_allowed(old.status, node.status) {
                return Err(Error::StateViolation(format!(
                    "Invalid transition: {} -> {}.",
                    old.status, node.status
                )));
            }
            if !in_rescue_cycle(old.status) {
                node.previous_status = Some(old.status);
            }
        }
        if !node.status.is_monitored() {
            node.status_expires = None;
        }

        let old_bmc = old.bmc_id;
        t.nodes.insert(node.system_id.clone(), node.clone());
        if let Some(bmc_id) = old_bmc {
            if node.bmc_id != Some(bmc_id) {
                t.sweep_bmc(bmc_id);
            }
        }
        Ok(node)
    }

    pub fn delete_node(&self, system_id: &str) -> Result<()> {
        let mut t = self.lock();
        let node = t.nodes.remove(system_id).ok_or_else(|| Error::NotFound {
            entity: "node",
            value: system_id.to_string(),
        })?;
        let iface_ids: Vec<InterfaceId> = t
            .interfaces
            .values()
            .filter(|i| i.node == system_id)
            .map(|i| i.id)
            .collect();
        for id in iface_ids {
            remove_interface(&mut t, id);
        }
        if let Some(bmc_id) = node.bmc_id {
            t.sweep_bmc(bmc_id);
        }
        info!("deleted node {node}");
        Ok(())
    }

    /// Record a reported power state without any lifecycle side effects.
    /// Lifecycle consequences of a state change (finishing a release,
    /// resolving a rescue exit) belong to the machine service.
    pub fn set_power_state(&self, system_id: &str, state: crate::node::PowerState) -> Result<()> {
        let mut t = self.lock();
        let node = t.nodes.get_mut(system_id).ok_or_else(|| Error::NotFound {
            entity: "node",
            value: system_id.to_string(),
        })?;
        node.power_state = state;
        node.power_state_updated = Some(chrono::Utc::now());
        Ok(())
    }

    // ----- BMCs -----

    /// Find the BMC with exactly this power type and parameter set, or
    /// create it. Nodes configured identically share one BMC row.
    pub fn get_or_create_bmc(
        &self,
        power_type: &str,
        power_parameters: BTreeMap<String, String>,
    ) -> Bmc {
        let mut t = self.lock();
        if let Some(bmc) = t
            .bmcs
            .values()
            .find(|b| b.power_type == power_type && b.power_parameters == power_parameters)
        {
            return bmc.clone();
        }
        let bmc = Bmc {
            id: t.next_id(),
            power_type: power_type.to_string(),
            power_parameters,
            routable_rack_ids: Vec::new(),
            non_routable_rack_ids: Vec::new(),
        };
        t.bmcs.insert(bmc.id, bmc.clone());
        bmc
    }

    pub fn get_bmc(&self, id: BmcId) -> Result<Bmc> {
        self.lock().bmcs.get(&id).cloned().ok_or_else(|| Error::NotFound {
            entity: "bmc",
            value: id.to_string(),
        })
    }

    pub fn save_bmc(&self, bmc: Bmc) -> Result<()> {
        let mut t = self.lock();
        if !t.bmcs.contains_key(&bmc.id) {
            return Err(Error::NotFound {
                entity: "bmc",
                value: bmc.id.to_string(),
            });
        }
        t.bmcs.insert(bmc.id, bmc);
        Ok(())
    }

    // ----- fabrics / VLANs / subnets -----

    /// The fabric new untagged interfaces land on when nothing better is
    /// known. Created on first use, together with its untagged VLAN.
    pub fn default_fabric(&self) -> Fabric {
        {
            let t = self.lock();
            if let Some(fabric) = t.fabrics.values().find(|f| f.name == "fabric-0") {
                return fabric.clone();
            }
        }
        match self.create_fabric("fabric-0") {
            Ok(fabric) => fabric,
            // Lost a race with another creator; it exists now.
            Err(_) => {
                let t = self.lock();
                t.fabrics
                    .values()
                    .find(|f| f.name == "fabric-0")
                    .cloned()
                    .unwrap_or_else(|| unreachable!("fabric-0 must exist after create"))
            }
        }
    }

    /// Create a fabric under the next free auto-generated name.
    pub fn create_next_fabric(&self) -> Fabric {
        for i in 0.. {
            match self.create_fabric(&format!("fabric-{i}")) {
                Ok(fabric) => return fabric,
                Err(_) => continue,
            }
        }
        unreachable!("an unused fabric name always exists")
    }

    pub fn create_fabric(&self, name: &str) -> Result<Fabric> {
        let mut t = self.lock();
        if t.fabrics.values().any(|f| f.name == name) {
            return Err(Error::Duplicate {
                entity: "fabric",
                value: name.to_string(),
            });
        }
        let fabric_id = t.next_id();
        let vlan = Vlan {
            id: t.next_id(),
            fabric_id,
            vid: 0,
            dhcp_on: false,
            primary_rack: None,
            secondary_rack: None,
        };
        let fabric = Fabric {
            id: fabric_id,
            name: name.to_string(),
            default_vlan: vlan.id,
        };
        t.vlans.insert(vlan.id, vlan);
        t.fabrics.insert(fabric.id, fabric.clone());
        Ok(fabric)
    }

    pub fn get_fabric(&self, id: FabricId) -> Result<Fabric> {
        self.lock().fabrics.get(&id).cloned().ok_or_else(|| Error::NotFound {
            entity: "fabric",
            value: id.to_string(),
        })
    }

    pub fn create_vlan(&self, fabric_id: FabricId, vid: u16, dhcp_on: bool) -> Result<Vlan> {
        let mut t = self.lock();
        if !t.fabrics.contains_key(&fabric_id) {
            return Err(Error::NotFound {
                entity: "fabric",
                value: fabric_id.to_string(),
            });
        }
        if t.vlans
            .values()
            .any(|v| v.fabric_id == fabric_id && v.vid == vid)
        {
            return Err(Error::Duplicate {
                entity: "vlan",
                value: format!("fabric {fabric_id} vid {vid}"),
            });
        }
        let vlan = Vlan {
            id: t.next_id(),
            fabric_id,
            vid,
            dhcp_on,
            primary_rack: None,
            secondary_rack: None,
        };
        t.vlans.insert(vlan.id, vlan.clone());
        Ok(vlan)
    }

    pub fn get_or_create_vlan(&self, fabric_id: FabricId, vid: u16) -> Result<Vlan> {
        {
            let t = self.lock();
            if let Some(vlan) = t
                .vlans
                .values()
                .find(|v| v.fabric_id == fabric_id && v.vid == vid)
            {
                return Ok(vlan.clone());
            }
        }
        self.create_vlan(fabric_id, vid, false)
    }

    pub fn get_vlan(&self, id: VlanId) -> Result<Vlan> {
        self.lock().vlans.get(&id).cloned().ok_or_else(|| Error::NotFound {
            entity: "vlan",
            value: id.to_string(),
        })
    }

    pub fn save_vlan(&self, vlan: Vlan) -> Result<()> {
        let mut t = self.lock();
        if !t.vlans.contains_key(&vlan.id) {
            return Err(Error::NotFound {
                entity: "vlan",
                value: vlan.id.to_string(),
            });
        }
        t.vlans.insert(vlan.id, vlan);
        Ok(())
    }

    pub fn create_subnet(
        &self,
        name: &str,
        vlan_id: VlanId,
        cidr: IpCidr,
        gateway_ip: Option<IpAddr>,
        dns_servers: Vec<IpAddr>,
    ) -> Result<Subnet> {
        let mut t = self.lock();
        if !t.vlans.contains_key(&vlan_id) {
            return Err(Error::NotFound {
                entity: "vlan",
                value: vlan_id.to_string(),
            });
        }
        if t.subnets.values().any(|s| s.cidr == cidr) {
            return Err(Error::Duplicate {
                entity: "subnet",
                value: cidr.to_string(),
            });
        }
        let subnet = Subnet {
            id: t.next_id(),
            name: name.to_string(),
            vlan_id,
            cidr,
            gateway_ip,
            dns_servers,
        };
        t.subnets.insert(subnet.id, subnet.clone());
        Ok(subnet)
    }

    pub fn get_subnet(&self, id: SubnetId) -> Result<Subnet> {
        self.lock().subnets.get(&id).cloned().ok_or_else(|| Error::NotFound {
            entity: "subnet",
            value: id.to_string(),
        })
    }

    pub fn save_subnet(&self, subnet: Subnet) -> Result<()> {
        let mut t = self.lock();
        if !t.subnets.contains_key(&subnet.id) {
            return Err(Error::NotFound {
                entity: "subnet",
                value: subnet.id.to_string(),
            });
        }
        t.subnets.insert(subnet.id, subnet);
        Ok(())
    }

    /// The most specific subnet whose network contains `addr`.
    pub fn subnet_containing(&self, addr: IpAddr) -> Option<Subnet> {
        self.lock()
            .subnets
            .values()
            .filter(|s| s.contains(addr))
            .max_by_key(|s| s.cidr.network_length())
            .cloned()
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.lock().subnets.values().cloned().collect()
    }

    // ----- interfaces -----

    /// Insert a new interface and return it with its id assigned. A MAC
    /// may appear on at most one physical interface across all nodes, and
    /// a name at most once per node.
    pub fn create_interface(&self, mut iface: Interface) -> Result<Interface> {
        let mut t = self.lock();
        if !t.nodes.contains_key(&iface.node) {
            return Err(Error::NotFound {
                entity: "node",
                value: iface.node,
            });
        }
        if t.interfaces
            .values()
            .any(|i| i.node == iface.node && i.name == iface.name)
        {
            return Err(Error::Duplicate {
                entity: "interface",
                value: format!("{} on {}", iface.name, iface.node),
            });
        }
        if iface.kind == InterfaceKind::Physical {
            if let Some(mac) = &iface.mac_address {
                if t.interfaces
                    .values()
                    .any(|i| i.kind == InterfaceKind::Physical && i.mac_address.as_ref() == Some(mac))
                {
                    return Err(Error::Duplicate {
                        entity: "mac address",
                        value: mac.clone(),
                    });
                }
            }
        }
        iface.id = t.next_id();
        t.interfaces.insert(iface.id, iface.clone());
        Ok(iface)
    }

    pub fn get_interface(&self, id: InterfaceId) -> Result<Interface> {
        self.lock()
            .interfaces
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                entity: "interface",
                value: id.to_string(),
            })
    }

    pub fn save_interface(&self, iface: Interface) -> Result<()> {
        let mut t = self.lock();
        if !t.interfaces.contains_key(&iface.id) {
            return Err(Error::NotFound {
                entity: "interface",
                value: iface.id.to_string(),
            });
        }
        t.interfaces.insert(iface.id, iface);
        Ok(())
    }

    /// Delete an interface, detaching its links. Links still held by
    /// another interface survive; the rest are deleted with it.
    pub fn delete_interface(&self, id: InterfaceId) -> Result<()> {
        let mut t = self.lock();
        if !t.interfaces.contains_key(&id) {
            return Err(Error::NotFound {
                entity: "interface",
                value: id.to_string(),
            });
        }
        remove_interface(&mut t, id);
        Ok(())
    }

    pub fn interfaces_for_node(&self, system_id: &str) -> Vec<Interface> {
        self.lock()
            .interfaces
            .values()
            .filter(|i| i.node == system_id)
            .cloned()
            .collect()
    }

    pub fn interface_by_name(&self, system_id: &str, name: &str) -> Option<Interface> {
        self.lock()
            .interfaces
            .values()
            .find(|i| i.node == system_id && i.name == name)
            .cloned()
    }

    pub fn physical_interface_by_mac(&self, mac: &str) -> Option<Interface> {
        self.lock()
            .interfaces
            .values()
            .find(|i| i.kind == InterfaceKind::Physical && i.mac_address.as_deref() == Some(mac))
            .cloned()
    }

    // ----- IP links -----

    /// Create a link and attach it to `iface_id`.
    pub fn create_link(&self, iface_id: InterfaceId, mut link: IpLink) -> Result<IpLink> {
        let mut t = self.lock();
        if !t.interfaces.contains_key(&iface_id) {
            return Err(Error::NotFound {
                entity: "interface",
                value: iface_id.to_string(),
            });
        }
        link.id = t.next_id();
        if let Some(iface) = t.interfaces.get_mut(&iface_id) {
            iface.link_ids.push(link.id);
        }
        t.links.insert(link.id, link.clone());
        Ok(link)
    }

    pub fn get_link(&self, id: IpLinkId) -> Result<IpLink> {
        self.lock().links.get(&id).cloned().ok_or_else(|| Error::NotFound {
            entity: "ip link",
            value: id.to_string(),
        })
    }

    pub fn save_link(&self, link: IpLink) -> Result<()> {
        let mut t = self.lock();
        if !t.links.contains_key(&link.id) {
            return Err(Error::NotFound {
                entity: "ip link",
                value: link.id.to_string(),
            });
        }
        t.links.insert(link.id, link);
        Ok(())
    }

    /// Detach a link from one interface. The link row itself is deleted
    /// only when no other interface still holds it.
    pub fn detach_link(&self, iface_id: InterfaceId, link_id: IpLinkId) -> Result<()> {
        let mut t = self.lock();
        let iface = t.interfaces.get_mut(&iface_id).ok_or_else(|| Error::NotFound {
            entity: "interface",
            value: iface_id.to_string(),
        })?;
        iface.link_ids.retain(|&l| l != link_id);
        let still_held = t.interfaces.values().any(|i| i.link_ids.contains(&link_id));
        if !still_held {
            t.links.remove(&link_id);
        }
        Ok(())
    }

    /// Attach an existing link to an additional interface (a bridge
    /// sharing its parent's address).
    pub fn attach_link(&self, iface_id: InterfaceId, link_id: IpLinkId) -> Result<()> {
        let mut t = self.lock();
        if !t.links.contains_key(&link_id) {
            return Err(Error::NotFound {
                entity: "ip link",
                value: link_id.to_string(),
            });
        }
        let iface = t.interfaces.get_mut(&iface_id).ok_or_else(|| Error::NotFound {
            entity: "interface",
            value: iface_id.to_string(),
        })?;
        if !iface.link_ids.contains(&link_id) {
            iface.link_ids.push(link_id);
        }
        Ok(())
    }

    /// Every concrete address currently assigned to any link.
    pub fn assigned_addresses(&self) -> Vec<IpAddr> {
        self.lock().links.values().filter_map(|l| l.address).collect()
    }

    pub fn links_for_interface(&self, iface: &Interface) -> Vec<IpLink> {
        let t = self.lock();
        iface
            .link_ids
            .iter()
            .filter_map(|id| t.links.get(id).cloned())
            .collect()
    }
}

/// The rescue-mode cycle, during which `previous_status` is frozen.
fn in_rescue_cycle(status: NodeStatus) -> bool {
    matches!(
        status,
        NodeStatus::EnteringRescueMode
            | NodeStatus::RescueMode
            | NodeStatus::ExitingRescueMode
            | NodeStatus::FailedEnteringRescueMode
            | NodeStatus::FailedExitingRescueMode
    )
}

fn remove_interface(t: &mut Tables, id: InterfaceId) {
    let Some(iface) = t.interfaces.remove(&id) else {
        return;
    };
    for link_id in iface.link_ids {
        let still_held = t.interfaces.values().any(|i| i.link_ids.contains(&link_id));
        if !still_held {
            t.links.remove(&link_id);
        }
    }
    // Children that depended on this interface lose the parent edge.
    for child in t.interfaces.values_mut() {
        child.parents.retain(|&p| p != id);
    }
    if let Some(node) = t.nodes.get_mut(&iface.node) {
        if node.boot_interface_id == Some(id) {
            node.boot_interface_id = None;
        }
    }
}
