// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Interface reconciliation: fold a raw topology report from a rack agent
//! into the durable interface/VLAN/fabric/subnet graph for that node.
//!
//! The report is observed truth about the host; the graph is our model of
//! it. Reconciliation upserts each reported interface in parent-first
//! order, places new interfaces on a VLAN by looking at where their
//! addresses actually live, reconciles their address links with minimal
//! churn, and finally deletes whatever the report no longer mentions,
//! children first.
//!
//! Ambiguous placement is never fatal: the reconciler always picks some
//! consistent VLAN and logs a warning. The one hard error is an unknown
//! interface type, which means the report itself cannot be trusted.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use cidr::IpCidr;
use log::{info, warn};

use super::topo::dependency_order;
use super::{
    Interface, InterfaceKind, IpAllocType, IpLink, ReportedInterface, ReportedLink, Subnet,
    TopologyReport, Vlan,
};
use crate::error::{Error, Result};
use crate::node::InterfaceId;
use crate::store::Store;

pub struct InterfaceReconciler {
    store: Arc<Store>,
}

impl InterfaceReconciler {
    pub fn new(store: Arc<Store>) -> Self {
        InterfaceReconciler { store }
    }

    /// Reconcile `report` against the stored interfaces of `system_id`.
    pub fn update_interfaces(&self, system_id: &str, report: &TopologyReport) -> Result<()> {
        // Validate every type up front so a bad report aborts before any
        // mutation.
        for (name, reported) in &report.interfaces {
            parse_kind(&reported.kind).ok_or_else(|| {
                Error::BadReport(format!(
                    "interface {name} has unknown type {:?}",
                    reported.kind
                ))
            })?;
        }

        let order = dependency_order(report);
        let mut touched: BTreeSet<InterfaceId> = BTreeSet::new();
        for name in &order {
            let reported = &report.interfaces[name];
            if let Some(iface) = self.update_one(system_id, name, reported)? {
                touched.insert(iface.id);
            }
        }

        self.delete_untouched(system_id, &touched);
        Ok(())
    }

    fn update_one(
        &self,
        system_id: &str,
        name: &str,
        reported: &ReportedInterface,
    ) -> Result<Option<Interface>> {
        let kind = parse_kind(&reported.kind)
            .unwrap_or_else(|| unreachable!("types validated before processing"));
        match kind {
            InterfaceKind::Physical => {
                self.update_physical(system_id, name, reported).map(Some)
            }
            InterfaceKind::Vlan => self.update_vlan_iface(system_id, name, reported),
            InterfaceKind::Bond | InterfaceKind::Bridge => {
                self.update_child_iface(system_id, name, kind, reported)
            }
            // parse_kind never yields Alias; aliases arrive as links.
            InterfaceKind::Alias => unreachable!(),
        }
    }

    // ----- physical -----

    fn update_physical(
        &self,
        system_id: &str,
        name: &str,
        reported: &ReportedInterface,
    ) -> Result<Interface> {
        let mac = reported.mac_address.as_deref().ok_or_else(|| {
            Error::BadReport(format!("physical interface {name} has no MAC address"))
        })?;

        let mut iface = match self.store.physical_interface_by_mac(mac) {
            Some(mut existing) => {
                if existing.node != system_id {
                    // The MAC moved. Trust the newest report: take the
                    // interface over and drop its stale address history.
                    warn!(
                        "MAC {mac} moved from node {} to {system_id}; claiming interface",
                        existing.node
                    );
                    for link_id in std::mem::take(&mut existing.link_ids) {
                        self.store.detach_link(existing.id, link_id)?;
                    }
                    existing.node = system_id.to_string();
                }
                // Renaming must not leave two same-named interfaces on
                // one node; whatever held the name before is stale.
                if let Some(conflict) = self.store.interface_by_name(system_id, name) {
                    if conflict.id != existing.id {
                        warn!(
                            "interface {name} on {system_id} displaced by MAC {mac}; \
                             removing the old record"
                        );
                        self.store.delete_interface(conflict.id)?;
                    }
                }
                existing.name = name.to_string();
                existing
            }
            None => {
                let vlan = self.place_new_physical(system_id, &reported.links);
                self.store.create_interface(Interface {
                    id: 0,
                    node: system_id.to_string(),
                    name: name.to_string(),
                    kind: InterfaceKind::Physical,
                    mac_address: Some(mac.to_string()),
                    enabled: reported.enabled,
                    vlan_id: Some(vlan.id),
                    parents: Vec::new(),
                    vid: None,
                    acquired: false,
                    link_ids: Vec::new(),
                })?
            }
        };
        iface.enabled = reported.enabled;
        self.store.save_interface(iface.clone())?;
        self.update_links(&mut iface, &reported.links, false)?;
        Ok(iface)
    }

    /// Choose a VLAN for a never-before-seen physical interface. A static
    /// link landing in a known subnet pins it to that subnet's VLAN; the
    /// node's first interface otherwise joins the default fabric; anything
    /// else gets a fabric of its own until evidence says better.
    fn place_new_physical(&self, system_id: &str, links: &[ReportedLink]) -> Vlan {
        if let Some(vlan) = self.vlan_from_links(links) {
            return vlan;
        }
        if self.store.interfaces_for_node(system_id).is_empty() {
            let fabric = self.store.default_fabric();
            if let Ok(vlan) = self.store.get_vlan(fabric.default_vlan) {
                return vlan;
            }
        }
        let fabric = self.store.create_next_fabric();
        match self.store.get_vlan(fabric.default_vlan) {
            Ok(vlan) => vlan,
            Err(_) => unreachable!("every fabric is created with a default VLAN"),
        }
    }

    // ----- vlan sub-interfaces -----

    fn update_vlan_iface(
        &self,
        system_id: &str,
        name: &str,
        reported: &ReportedInterface,
    ) -> Result<Option<Interface>> {
        let Some(parent) = reported
            .parents
            .first()
            .and_then(|p| self.store.interface_by_name(system_id, p))
        else {
            warn!("vlan interface {name} on {system_id} has no materialized parent; skipping");
            return Ok(None);
        };
        let vid = reported.vid.unwrap_or(0);
        let parent_fabric = match parent.vlan_id.and_then(|id| self.store.get_vlan(id).ok()) {
            Some(vlan) => vlan.fabric_id,
            None => self.store.default_fabric().id,
        };

        let parent_has_sticky = self
            .store
            .links_for_interface(&parent)
            .iter()
            .any(|l| l.alloc_type == IpAllocType::Sticky);

        // With a statically-addressed parent the parent's fabric is
        // authoritative; otherwise let this interface's own links vote,
        // as long as they agree with the configured VID.
        let (vlan, force_vlan) = if parent_has_sticky {
            (self.store.get_or_create_vlan(parent_fabric, vid)?, true)
        } else {
            match self.vlan_from_links(&reported.links) {
                Some(vlan) if vlan.vid == vid => (vlan, false),
                Some(vlan) => {
                    warn!(
                        "vlan interface {name} has VID {vid} but its addresses live on \
                         VID {}; keeping the parent's fabric",
                        vlan.vid
                    );
                    (self.store.get_or_create_vlan(parent_fabric, vid)?, true)
                }
                None => (self.store.get_or_create_vlan(parent_fabric, vid)?, true),
            }
        };

        let mut iface = match self.store.interface_by_name(system_id, name) {
            Some(existing) => existing,
            None => self.store.create_interface(Interface {
                id: 0,
                node: system_id.to_string(),
                name: name.to_string(),
                kind: InterfaceKind::Vlan,
                mac_address: parent.mac_address.clone(),
                enabled: reported.enabled,
                vlan_id: None,
                parents: Vec::new(),
                vid: Some(vid),
                acquired: false,
                link_ids: Vec::new(),
            })?,
        };
        iface.enabled = reported.enabled;
        iface.vid = Some(vid);
        iface.vlan_id = Some(vlan.id);
        iface.parents = vec![parent.id];
        self.store.save_interface(iface.clone())?;
        self.update_links(&mut iface, &reported.links, force_vlan)?;
        Ok(Some(iface))
    }

    // ----- bonds and bridges -----

    fn update_child_iface(
        &self,
        system_id: &str,
        name: &str,
        kind: InterfaceKind,
        reported: &ReportedInterface,
    ) -> Result<Option<Interface>> {
        let parents: Vec<Interface> = reported
            .parents
            .iter()
            .filter_map(|p| self.store.interface_by_name(system_id, p))
            .collect();
        if parents.is_empty() && kind == InterfaceKind::Bond {
            // A bond with no members cannot be placed anywhere useful.
            // Standalone bridges are legitimate (virtual-only hosts).
            warn!("bond {name} on {system_id} has no materialized parents; skipping");
            return Ok(None);
        }

        let vlan = match self.vlan_from_links(&reported.links) {
            Some(vlan) => vlan,
            None => match parents.first().and_then(|p| p.vlan_id) {
                Some(vlan_id) => self.store.get_vlan(vlan_id)?,
                None => {
                    let fabric = self.store.default_fabric();
                    self.store.get_vlan(fabric.default_vlan)?
                }
            },
        };

        let mut iface = match self.store.interface_by_name(system_id, name) {
            Some(existing) => existing,
            None => self.store.create_interface(Interface {
                id: 0,
                node: system_id.to_string(),
                name: name.to_string(),
                kind,
                mac_address: reported
                    .mac_address
                    .clone()
                    .or_else(|| parents.first().and_then(|p| p.mac_address.clone())),
                enabled: reported.enabled,
                vlan_id: None,
                parents: Vec::new(),
                vid: None,
                acquired: false,
                link_ids: Vec::new(),
            })?,
        };
        iface.enabled = reported.enabled;
        iface.vlan_id = Some(vlan.id);
        iface.parents = parents.iter().map(|p| p.id).collect();
        self.store.save_interface(iface.clone())?;

        // Members follow the aggregate onto its VLAN.
        for mut parent in parents {
            if parent.vlan_id != Some(vlan.id) {
                parent.vlan_id = Some(vlan.id);
                self.store.save_interface(parent)?;
            }
        }

        self.update_links(&mut iface, &reported.links, false)?;
        Ok(Some(iface))
    }

    // ----- links -----

    /// Reconcile the address links on one interface. Discovered links are
    /// observations and get replaced wholesale; DHCP links are matched by
    /// allocation type and static links by exact address, so a re-report
    /// of the same configuration touches nothing.
    fn update_links(
        &self,
        iface: &mut Interface,
        links: &[ReportedLink],
        force_vlan: bool,
    ) -> Result<()> {
        let existing = self.store.links_for_interface(iface);
        for link in &existing {
            if link.alloc_type == IpAllocType::Discovered {
                self.store.detach_link(iface.id, link.id)?;
            }
        }

        let mut unmatched: Vec<IpLink> = existing
            .into_iter()
            .filter(|l| l.alloc_type != IpAllocType::Discovered)
            .collect();

        for link in links {
            match link.mode.as_str() {
                "dhcp" => {
                    if let Some(pos) = unmatched
                        .iter()
                        .position(|l| l.alloc_type == IpAllocType::Dhcp)
                    {
                        unmatched.remove(pos);
                    } else {
                        self.store.create_link(
                            iface.id,
                            IpLink {
                                id: 0,
                                alloc_type: IpAllocType::Dhcp,
                                address: None,
                                subnet_id: None,
                            },
                        )?;
                    }
                }
                "static" => self.reconcile_static_link(iface, link, &mut unmatched, force_vlan)?,
                "discovered" => {
                    let (address, subnet) = self.resolve_address(iface, link, false)?;
                    self.store.create_link(
                        iface.id,
                        IpLink {
                            id: 0,
                            alloc_type: IpAllocType::Discovered,
                            address,
                            subnet_id: subnet.map(|s| s.id),
                        },
                    )?;
                }
                other => {
                    return Err(Error::BadReport(format!(
                        "interface {} reported a link with unknown mode {other:?}",
                        iface.name
                    )));
                }
            }
        }

        // Whatever the report stopped mentioning is gone from the host.
        for link in unmatched {
            self.store.detach_link(iface.id, link.id)?;
        }
        *iface = self.store.get_interface(iface.id)?;
        Ok(())
    }

    fn reconcile_static_link(
        &self,
        iface: &Interface,
        link: &ReportedLink,
        unmatched: &mut Vec<IpLink>,
        force_vlan: bool,
    ) -> Result<()> {
        let (address, subnet) = self.resolve_address(iface, link, true)?;
        let Some(address) = address else {
            warn!(
                "static link on {} carries no parseable address; ignoring it",
                iface.name
            );
            return Ok(());
        };

        if force_vlan {
            if let Some(subnet) = &subnet {
                if subnet.vlan_id != iface.vlan_id.unwrap_or(0) {
                    warn!(
                        "static address {address} on {} belongs to subnet {} on another \
                         VLAN; rejecting this link",
                        iface.name, subnet.name
                    );
                    return Ok(());
                }
            }
        }

        if let Some(subnet) = &subnet {
            self.backfill_gateway(subnet, link);
        }

        if let Some(pos) = unmatched
            .iter()
            .position(|l| l.alloc_type == IpAllocType::Sticky && l.address == Some(address))
        {
            unmatched.remove(pos);
        } else {
            self.store.create_link(
                iface.id,
                IpLink {
                    id: 0,
                    alloc_type: IpAllocType::Sticky,
                    address: Some(address),
                    subnet_id: subnet.map(|s| s.id),
                },
            )?;
        }
        Ok(())
    }

    /// Parse a reported `addr/prefix`, find its subnet, and (for static
    /// links) create the subnet when it is new to us.
    fn resolve_address(
        &self,
        iface: &Interface,
        link: &ReportedLink,
        create_subnet: bool,
    ) -> Result<(Option<IpAddr>, Option<Subnet>)> {
        let Some(raw) = link.address.as_deref() else {
            return Ok((None, None));
        };
        let (addr_part, prefix) = match raw.split_once('/') {
            Some((a, p)) => (a, p.parse::<u8>().ok()),
            None => (raw, None),
        };
        let address: IpAddr = match addr_part.parse() {
            Ok(a) => a,
            Err(_) => {
                warn!("unparseable address {raw:?} on {}; ignoring", iface.name);
                return Ok((None, None));
            }
        };

        if let Some(subnet) = self.store.subnet_containing(address) {
            return Ok((Some(address), Some(subnet)));
        }
        if !create_subnet {
            return Ok((Some(address), None));
        }
        let Some(prefix) = prefix else {
            return Ok((Some(address), None));
        };
        let Ok(cidr) = IpCidr::from_str(&format!(
            "{}/{prefix}",
            network_address(address, prefix)
        )) else {
            warn!("cannot derive a network from {raw:?} on {}", iface.name);
            return Ok((Some(address), None));
        };
        let vlan_id = match iface.vlan_id {
            Some(id) => id,
            None => self.store.default_fabric().default_vlan,
        };
        info!("discovered new subnet {cidr} via {} on {}", iface.name, iface.node);
        let subnet = self
            .store
            .create_subnet(&cidr.to_string(), vlan_id, cidr, link.gateway, Vec::new())?;
        Ok((Some(address), Some(subnet)))
    }

    /// A subnet learns its gateway from a report only when it has none
    /// yet and the reported gateway actually lives inside the subnet.
    fn backfill_gateway(&self, subnet: &Subnet, link: &ReportedLink) {
        let Some(gateway) = link.gateway else { return };
        if subnet.gateway_ip.is_some() || !subnet.contains(gateway) {
            return;
        }
        let mut updated = subnet.clone();
        updated.gateway_ip = Some(gateway);
        if self.store.save_subnet(updated).is_ok() {
            info!("subnet {} learned gateway {gateway}", subnet.name);
        }
    }

    /// The first static link whose address falls into a known subnet
    /// nominates that subnet's VLAN.
    fn vlan_from_links(&self, links: &[ReportedLink]) -> Option<Vlan> {
        for link in links {
            if link.mode != "static" {
                continue;
            }
            let Some(raw) = link.address.as_deref() else {
                continue;
            };
            let addr_part = raw.split('/').next().unwrap_or(raw);
            let Ok(address) = addr_part.parse::<IpAddr>() else {
                continue;
            };
            if let Some(subnet) = self.store.subnet_containing(address) {
                return self.store.get_vlan(subnet.vlan_id).ok();
            }
        }
        None
    }

    /// Delete every stored interface the report no longer mentions,
    /// children before parents.
    fn delete_untouched(&self, system_id: &str, touched: &BTreeSet<InterfaceId>) {
        let mut stale: Vec<Interface> = self
            .store
            .interfaces_for_node(system_id)
            .into_iter()
            .filter(|i| !touched.contains(&i.id))
            .collect();
        while !stale.is_empty() {
            // Safe to remove: nothing stale depends on it.
            let removable: Vec<InterfaceId> = stale
                .iter()
                .filter(|i| {
                    !stale
                        .iter()
                        .any(|other| other.id != i.id && other.parents.contains(&i.id))
                })
                .map(|i| i.id)
                .collect();
            let removable = if removable.is_empty() {
                // Dependency loop among stale rows; force progress.
                vec![stale[0].id]
            } else {
                removable
            };
            for id in &removable {
                info!("removing interface {id} from {system_id}; no longer reported");
                if let Err(err) = self.store.delete_interface(*id) {
                    warn!("could not remove interface {id}: {err}");
                }
            }
            stale.retain(|i| !removable.contains(&i.id));
        }
    }
}

fn parse_kind(raw: &str) -> Option<InterfaceKind> {
    match raw {
        "physical" => Some(InterfaceKind::Physical),
        "vlan" => Some(InterfaceKind::Vlan),
        "bond" => Some(InterfaceKind::Bond),
        "bridge" => Some(InterfaceKind::Bridge),
        _ => None,
    }
}

/// Mask `address` down to the first address of its `prefix`-length network.
fn network_address(address: IpAddr, prefix: u8) -> IpAddr {
    match address {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix).min(32))
            };
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - u128::from(prefix).min(128))
            };
            IpAddr::V6((bits & mask).into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_address_masks() {
        let addr: IpAddr = "192.168.1.77".parse().unwrap();
        assert_eq!(
            network_address(addr, 24),
            "192.168.1.0".parse::<IpAddr>().unwrap()
        );
        let v6: IpAddr = "fd00::1:2:3".parse().unwrap();
        assert_eq!(network_address(v6, 64), "fd00::".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn parse_kind_rejects_garbage() {
        assert!(parse_kind("physical").is_some());
        assert!(parse_kind("loopback").is_none());
    }
}
