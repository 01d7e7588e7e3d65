// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The node record: identity, classification, status, ownership, power and
//! boot linkage, and the flags the lifecycle workflows consult.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::status::NodeStatus;
use crate::storage::BlockDevice;

pub type BmcId = u64;
pub type InterfaceId = u64;
pub type IpLinkId = u64;
pub type ScriptSetId = u64;

/// Characters used in generated system ids. Deliberately excludes letters
/// and digits that are easily confused when read aloud or transcribed.
const SYSTEM_ID_CHARS: &[u8] = b"abcdefghkmnpqrstwxyz346789";

/// Generate a new, random node system id. Uniqueness is enforced by the
/// store when the node is created.
pub fn generate_system_id() -> String {
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| SYSTEM_ID_CHARS[rng.gen_range(0..SYSTEM_ID_CHARS.len())] as char)
        .collect()
}

/// What kind of node a record describes. The kind gates which workflows
/// apply: machines get the full provisioning lifecycle, controllers are
/// never power-managed, devices are passive records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Machine,
    Device,
    RackController,
    RegionController,
    RegionAndRackController,
}

impl NodeKind {
    pub fn is_machine(self) -> bool {
        self == NodeKind::Machine
    }

    pub fn is_controller(self) -> bool {
        matches!(
            self,
            NodeKind::RackController
                | NodeKind::RegionController
                | NodeKind::RegionAndRackController
        )
    }

    pub fn is_rack_controller(self) -> bool {
        matches!(
            self,
            NodeKind::RackController | NodeKind::RegionAndRackController
        )
    }

    pub fn is_region_controller(self) -> bool {
        matches!(
            self,
            NodeKind::RegionController | NodeKind::RegionAndRackController
        )
    }
}

/// Last known power state of a node, as reported by a rack agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    Unknown,
    Error,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                PowerState::On => "on",
                PowerState::Off => "off",
                PowerState::Unknown => "unknown",
                PowerState::Error => "error",
            }
        )
    }
}

/// A managed machine, device, or controller.
///
/// This is a plain data record; all mutation goes through the store, whose
/// save path enforces the status transition table and the deadline rules.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub system_id: String,
    pub hostname: String,
    pub domain: String,
    pub kind: NodeKind,
    pub architecture: String,
    pub bios_boot_method: String,

    pub status: NodeStatus,
    /// The status the node held before entering the rescue-mode cycle;
    /// used to decide where to resume when rescue mode is exited.
    pub previous_status: Option<NodeStatus>,
    /// Deadline after which the monitor sweeper forcibly fails the node.
    pub status_expires: Option<DateTime<Utc>>,

    pub owner: Option<String>,
    pub agent_name: String,
    pub token: Option<String>,
    pub owner_data: BTreeMap<String, String>,

    pub bmc_id: Option<BmcId>,
    /// Node-scoped overrides laid over the BMC's power parameters.
    pub instance_power_parameters: BTreeMap<String, String>,
    pub power_state: PowerState,
    pub power_state_updated: Option<DateTime<Utc>>,

    pub boot_interface_id: Option<InterfaceId>,
    pub boot_cluster_ip: Option<std::net::IpAddr>,
    pub boot_disk: Option<String>,
    pub gateway_link_ipv4: Option<IpLinkId>,
    pub gateway_link_ipv6: Option<IpLinkId>,

    pub current_commissioning_script_set: Option<ScriptSetId>,
    pub current_installation_script_set: Option<ScriptSetId>,

    pub osystem: String,
    pub distro_series: String,
    pub license_key: String,
    pub error_description: String,

    pub enable_ssh: bool,
    pub skip_networking: bool,
    pub skip_storage: bool,
    pub netboot: bool,
    /// Ephemeral (composed) machines are deleted on release rather than
    /// parked as Ready.
    pub dynamic: bool,

    pub parent: Option<String>,
    pub block_devices: Vec<BlockDevice>,
}

impl NodeRecord {
    pub fn new(hostname: &str, kind: NodeKind) -> Self {
        NodeRecord {
            system_id: generate_system_id(),
            hostname: hostname.to_string(),
            domain: "anvil".to_string(),
            kind,
            architecture: "amd64/generic".to_string(),
            bios_boot_method: "pxe".to_string(),
            status: NodeStatus::New,
            previous_status: None,
            status_expires: None,
            owner: None,
            agent_name: String::new(),
            token: None,
            owner_data: BTreeMap::new(),
            bmc_id: None,
            instance_power_parameters: BTreeMap::new(),
            power_state: PowerState::Unknown,
            power_state_updated: None,
            boot_interface_id: None,
            boot_cluster_ip: None,
            boot_disk: None,
            gateway_link_ipv4: None,
            gateway_link_ipv6: None,
            current_commissioning_script_set: None,
            current_installation_script_set: None,
            osystem: String::new(),
            distro_series: String::new(),
            license_key: String::new(),
            error_description: String::new(),
            enable_ssh: false,
            skip_networking: false,
            skip_storage: false,
            netboot: true,
            dynamic: false,
            parent: None,
            block_devices: Vec::new(),
        }
    }

    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.hostname, self.domain)
    }

    /// Return architecture and subarchitecture as a tuple.
    pub fn split_arch(&self) -> (&str, &str) {
        match self.architecture.split_once('/') {
            Some((arch, subarch)) => (arch, subarch),
            None => (self.architecture.as_str(), ""),
        }
    }

    /// A node's effective power type comes from its BMC; the node record
    /// alone cannot answer it. This helper only reports whether a BMC
    /// reference exists at all.
    pub fn has_bmc(&self) -> bool {
        self.bmc_id.is_some()
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{} ({})", self.hostname, self.system_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_ids_use_the_restricted_charset() {
        for _ in 0..100 {
            let id = generate_system_id();
            assert_eq!(id.len(), 6);
            assert!(id.bytes().all(|b| SYSTEM_ID_CHARS.contains(&b)));
        }
    }

    #[test]
    fn split_arch() {
        let mut node = NodeRecord::new("host0", NodeKind::Machine);
        node.architecture = "arm64/xgene-uboot".to_string();
        assert_eq!(node.split_arch(), ("arm64", "xgene-uboot"));
    }
}
