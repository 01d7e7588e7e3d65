// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Starting a node. For an allocated node this means starting a
//! deployment: auto addresses are claimed, the storage and network
//! preconditions are validated, and the node reboots into the installer.
//! For anything else it is a plain power-on.

use std::collections::BTreeSet;
use std::net::IpAddr;

use log::{info, warn};

use super::{Machines, Requester, StartOutcome};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::network::Subnet;
use crate::node::{IpLinkId, NodeRecord, PowerState};
use crate::scripts::ScriptSetKind;
use crate::status::NodeStatus;

impl Machines {
    /// Power a node on, implicitly starting a deployment when the node is
    /// allocated. Returns `ManualPowerRequired` (not an error) when the
    /// power type cannot start machines.
    pub async fn start(&self, system_id: &str, requester: &Requester) -> Result<StartOutcome> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;

        let deploying = node.status == NodeStatus::Allocated;
        let previous_status = node.status;
        let mut claimed: Vec<IpLinkId> = Vec::new();

        let node = if deploying {
            self.record(
                &node,
                EventKind::RequestStartDeployment,
                "start deployment",
                format!("requested by {}", requester.username),
            );
            claimed = self.claim_auto_ips(&node)?;
            if let Err(err) = self.validate_for_deploy(&node) {
                self.release_claimed_ips(&claimed);
                return Err(err);
            }
            let mut node = node;
            if node.osystem.is_empty() {
                node.osystem = self.config.default_osystem.clone();
                node.distro_series = self.config.default_distro_series.clone();
            }
            let script_set = self
                .scripts
                .create(&node.system_id, ScriptSetKind::Installation);
            if let Some(old) = node.current_installation_script_set.replace(script_set) {
                self.scripts.delete(old);
            }
            node.status = NodeStatus::Deploying;
            let timeout = self.config.deploying_timeout;
            self.deadline_in(&mut node, timeout);
            match self.store.save_node(node) {
                Ok(node) => node,
                Err(err) => {
                    self.release_claimed_ips(&claimed);
                    return Err(err);
                }
            }
        } else {
            self.record(
                &node,
                EventKind::RequestStart,
                "start",
                format!("requested by {}", requester.username),
            );
            node
        };

        let info = self.power.effective_power_info(&node);
        if !info.can_be_started {
            info!("{node} must be started manually; its power type cannot start it");
            return Ok(StartOutcome::ManualPowerRequired);
        }

        // Deployment starts may power-cycle a running node to reboot it
        // into the installer; a plain start never cycles.
        let result = if deploying && node.power_state == PowerState::On {
            self.power.power_cycle(&node).await
        } else {
            self.power.power_on(&node).await
        };
        match result {
            Ok(state) => {
                self.store.set_power_state(&node.system_id, state)?;
                Ok(StartOutcome::Started)
            }
            Err(err) => {
                warn!("{node}: start failed, reverting to {previous_status}: {err}");
                self.release_claimed_ips(&claimed);
                let mut reverted = self.node(system_id)?;
                reverted.status = previous_status;
                if deploying {
                    if let Some(set) = reverted.current_installation_script_set.take() {
                        self.scripts.delete(set);
                    }
                }
                self.store.save_node(reverted)?;
                Err(err)
            }
        }
    }

    /// All the reasons this node cannot deploy right now, in one error.
    fn validate_for_deploy(&self, node: &NodeRecord) -> Result<()> {
        let mut violations: Vec<(String, String)> = Vec::new();

        let interfaces = self.store.interfaces_for_node(&node.system_id);
        let networked = interfaces
            .iter()
            .any(|i| i.enabled && i.vlan_id.is_some() && !i.link_ids.is_empty());
        if !networked {
            violations.push((
                "network".to_string(),
                "Node must be configured to use a network.".to_string(),
            ));
        }
        for issue in crate::storage::layout_issues(node) {
            violations.push(("storage".to_string(), issue));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(violations))
        }
    }

    /// Resolve every unassigned auto-mode link to a concrete address.
    /// Addresses claimed earlier in the same call are excluded so two
    /// links on one subnet never collide. Returns the claimed link ids so
    /// a failing start can hand the addresses back.
    pub(crate) fn claim_auto_ips(&self, node: &NodeRecord) -> Result<Vec<IpLinkId>> {
        let mut taken: BTreeSet<IpAddr> = self.store.assigned_addresses().into_iter().collect();
        let mut claimed = Vec::new();
        for iface in self.store.interfaces_for_node(&node.system_id) {
            for mut link in self.store.links_for_interface(&iface) {
                if link.alloc_type != crate::network::IpAllocType::Auto
                    || link.address.is_some()
                {
                    continue;
                }
                let Some(subnet) = link.subnet_id.and_then(|id| self.store.get_subnet(id).ok())
                else {
                    continue;
                };
                let Some(address) = next_free_address(&subnet, &taken) else {
                    self.release_claimed_ips(&claimed);
                    return Err(Error::Validation(vec![(
                        "network".to_string(),
                        format!("No free addresses left on subnet {}.", subnet.name),
                    )]));
                };
                taken.insert(address);
                link.address = Some(address);
                self.store.save_link(link.clone())?;
                claimed.push(link.id);
                info!("{node}: claimed {address} on {} for {}", subnet.name, iface.name);
            }
        }
        Ok(claimed)
    }

    pub(crate) fn release_claimed_ips(&self, claimed: &[IpLinkId]) {
        for &id in claimed {
            if let Ok(mut link) = self.store.get_link(id) {
                link.address = None;
                if let Err(err) = self.store.save_link(link) {
                    warn!("could not release claimed address on link {id}: {err}");
                }
            }
        }
    }
}

/// The lowest usable address in `subnet` not already taken. Skips the
/// network and (for IPv4) broadcast addresses and the gateway.
fn next_free_address(subnet: &Subnet, taken: &BTreeSet<IpAddr>) -> Option<IpAddr> {
    let usable = |addr: &IpAddr| {
        !taken.contains(addr) && subnet.gateway_ip.as_ref() != Some(addr)
    };
    match subnet.cidr.first_address() {
        IpAddr::V4(first) => {
            let base = u32::from(first);
            let host_bits = 32 - u32::from(subnet.cidr.network_length());
            let span = if host_bits >= 32 { u32::MAX } else { (1u32 << host_bits) - 1 };
            // Skip .0 and the broadcast address.
            for offset in 1..span {
                let addr = IpAddr::V4((base + offset).into());
                if usable(&addr) {
                    return Some(addr);
                }
            }
            None
        }
        IpAddr::V6(first) => {
            let base = u128::from(first);
            // v6 subnets are enormous; a bounded scan is plenty.
            for offset in 1..4096u128 {
                let addr = IpAddr::V6((base + offset).into());
                if subnet.contains(addr) && usable(&addr) {
                    return Some(addr);
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidr::IpCidr;
    use std::str::FromStr;

    fn subnet(cidr: &str, gateway: Option<&str>) -> Subnet {
        Subnet {
            id: 1,
            name: cidr.to_string(),
            vlan_id: 1,
            cidr: IpCidr::from_str(cidr).unwrap(),
            gateway_ip: gateway.map(|g| g.parse().unwrap()),
            dns_servers: vec![],
        }
    }

    #[test]
    fn skips_network_gateway_and_taken() {
        let s = subnet("10.0.0.0/24", Some("10.0.0.1"));
        let mut taken = BTreeSet::new();
        taken.insert("10.0.0.2".parse().unwrap());
        assert_eq!(
            next_free_address(&s, &taken),
            Some("10.0.0.3".parse().unwrap())
        );
    }

    #[test]
    fn exhausted_subnet_yields_none() {
        let s = subnet("192.168.0.0/30", None);
        let mut taken = BTreeSet::new();
        taken.insert("192.168.0.1".parse().unwrap());
        taken.insert("192.168.0.2".parse().unwrap());
        // .0 is the network, .3 the broadcast.
        assert_eq!(next_free_address(&s, &taken), None);
    }
}
