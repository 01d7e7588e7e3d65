// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Power driver descriptions and the BMC record.
//!
//! The registry is a plain value handed to the orchestrator, not a
//! process-wide singleton; tests construct their own with exactly the
//! drivers they need.

use std::collections::BTreeMap;

use crate::agent::PowerParams;
use crate::node::{NodeRecord, PowerState};
use crate::status::NodeStatus;

/// Description of one power driver the rack agents may carry.
#[derive(Debug, Clone)]
pub struct PowerDriver {
    pub name: String,
    /// Whether the driver can report a power state, as opposed to
    /// fire-and-forget control (e.g. wake-on-lan cannot be queried).
    pub queryable: bool,
    /// Parameter keys that are scoped to an individual node rather than
    /// to the (possibly shared) BMC.
    pub node_param_keys: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PowerDriverRegistry {
    drivers: BTreeMap<String, PowerDriver>,
}

impl PowerDriverRegistry {
    pub fn new(drivers: Vec<PowerDriver>) -> Self {
        PowerDriverRegistry {
            drivers: drivers
                .into_iter()
                .map(|driver| (driver.name.clone(), driver))
                .collect(),
        }
    }

    /// A registry with the common drivers, convenient for tests and for
    /// deployments that don't customize the driver set.
    pub fn well_known() -> Self {
        let node_keys = |keys: &[&str]| keys.iter().map(|k| k.to_string()).collect();
        PowerDriverRegistry::new(vec![
            PowerDriver {
                name: "ipmi".to_string(),
                queryable: true,
                node_param_keys: node_keys(&["power_id", "mac_address", "boot_mode"]),
            },
            PowerDriver {
                name: "virsh".to_string(),
                queryable: true,
                node_param_keys: node_keys(&["power_id", "mac_address", "boot_mode"]),
            },
            PowerDriver {
                name: "redfish".to_string(),
                queryable: true,
                node_param_keys: node_keys(&["node_id", "power_id", "mac_address", "boot_mode"]),
            },
            PowerDriver {
                name: "wedge".to_string(),
                queryable: false,
                node_param_keys: node_keys(&["power_id", "mac_address", "boot_mode"]),
            },
            PowerDriver {
                name: "manual".to_string(),
                queryable: false,
                node_param_keys: node_keys(&["boot_mode"]),
            },
        ])
    }

    pub fn get(&self, power_type: &str) -> Option<&PowerDriver> {
        self.drivers.get(power_type)
    }
}

/// How (and whether) a node's power can be controlled. Derived, never
/// persisted. The `can_be_*` fields are hints: `false` means the node
/// almost certainly cannot be controlled that way; `true` means it is
/// worth trying, with no guarantees.
#[derive(Debug, Clone)]
pub struct PowerInfo {
    pub can_be_started: bool,
    pub can_be_stopped: bool,
    pub can_be_queried: bool,
    pub power_type: Option<String>,
    pub power_parameters: PowerParams,
}

impl PowerInfo {
    /// The all-false info for a node whose power type is unconfigured.
    pub fn unconfigured() -> Self {
        PowerInfo {
            can_be_started: false,
            can_be_stopped: false,
            can_be_queried: false,
            power_type: None,
            power_parameters: PowerParams::new(),
        }
    }
}

/// The out-of-band management endpoint for one or more nodes. Shared when
/// several nodes sit behind one physical controller, so mutations here
/// affect every sharing node.
#[derive(Debug, Clone)]
pub struct Bmc {
    pub id: u64,
    pub power_type: String,
    pub power_parameters: PowerParams,
    /// Racks confirmed (by query) to reach this BMC's address, and racks
    /// confirmed not to. Both are cached discovery results.
    pub routable_rack_ids: Vec<String>,
    pub non_routable_rack_ids: Vec<String>,
}

impl Bmc {
    /// A BMC is accessible when at least one rack is known to route to it.
    pub fn is_accessible(&self) -> bool {
        !self.routable_rack_ids.is_empty()
    }

    pub fn client_identifiers(&self) -> Vec<String> {
        self.routable_rack_ids.clone()
    }

    pub fn update_routable_racks(
        &mut self,
        routable: Vec<String>,
        non_routable: Vec<String>,
    ) {
        self.routable_rack_ids = routable;
        self.non_routable_rack_ids = non_routable;
    }
}

/// Merge a node's effective power parameters: BMC parameters overlaid by
/// the node's own overrides, then the well-known defaults for anything
/// still missing.
pub fn effective_power_parameters(
    node: &NodeRecord,
    bmc: Option<&Bmc>,
    boot_mac: Option<&str>,
) -> PowerParams {
    let mut params = match bmc {
        Some(bmc) => bmc.power_parameters.clone(),
        None => PowerParams::new(),
    };
    for (key, value) in &node.instance_power_parameters {
        params.insert(key.clone(), value.clone());
    }

    let mut setdefault = |key: &str, value: &str| {
        params
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
    };
    setdefault("system_id", &node.system_id);
    // Tool paths the templates still expect to be told about.
    setdefault("fence_cdu", "/usr/sbin/fence_cdu");
    setdefault("ipmipower", "/usr/sbin/ipmipower");
    setdefault("ipmitool", "/usr/bin/ipmitool");
    setdefault("ipmi_chassis_config", "/usr/sbin/ipmi-chassis-config");
    setdefault("ipmi_config", "ipmi.conf");
    if matches!(bmc, Some(bmc) if bmc.power_type == "virsh") {
        setdefault("power_address", "qemu://localhost/system");
    } else {
        setdefault("power_address", "");
    }
    setdefault("username", "");
    setdefault("power_id", &node.system_id);
    setdefault("power_driver", "");
    setdefault("power_pass", "");
    setdefault("power_off_mode", "");

    if !params.contains_key("mac_address") {
        if let Some(mac) = boot_mac {
            params.insert("mac_address".to_string(), mac.to_string());
        }
    }

    // Tells the boot template whether this is a PXE boot or a local boot.
    let boot_mode = if node.status == NodeStatus::Deployed || !node.kind.is_machine() {
        "local"
    } else {
        "pxe"
    };
    params.insert("boot_mode".to_string(), boot_mode.to_string());

    params
}

/// Split a merged parameter map back into (BMC-scoped, node-scoped) halves
/// according to the driver's declared scoping. The node-scoped half of a
/// just-merged map reproduces the node's override set for those keys.
pub fn scope_power_parameters(
    driver: &PowerDriver,
    params: &PowerParams,
) -> (PowerParams, PowerParams) {
    let mut bmc_scoped = PowerParams::new();
    let mut node_scoped = PowerParams::new();
    for (key, value) in params {
        if driver.node_param_keys.iter().any(|k| k == key) {
            node_scoped.insert(key.clone(), value.clone());
        } else {
            bmc_scoped.insert(key.clone(), value.clone());
        }
    }
    (bmc_scoped, node_scoped)
}

/// Opportunistically fold a reported power state into a `PowerState`.
pub fn parse_power_state(raw: &str) -> PowerState {
    match raw {
        "on" => PowerState::On,
        "off" => PowerState::Off,
        "error" => PowerState::Error,
        _ => PowerState::Unknown,
    }
}
