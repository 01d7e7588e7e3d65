// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Shared fixtures for the test suites: an environment wiring the store,
//! a set of scriptable fake rack agents, and the services under test.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent::{AgentClient, AgentConnector, AgentError, AgentReply, PowerParams};
use crate::config::Config;
use crate::error::Result;
use crate::event::RecordingEventSink;
use crate::network::{Interface, InterfaceKind, IpAllocType, IpLink, Subnet};
use crate::node::{NodeKind, NodeRecord, PowerState};
use crate::power::driver::{Bmc, PowerDriverRegistry};
use crate::power::PowerOrchestrator;
use crate::scripts::SimpleScriptSets;
use crate::status::NodeStatus;
use crate::store::Store;
use crate::workflows::Machines;

/// One scriptable fake rack agent.
pub struct FakeRack {
    pub ident: String,
    pub reachable: Mutex<bool>,
    pub missing_packages: Mutex<Vec<String>>,
    /// When set, every power call answers `Failed` with this message.
    pub fail_message: Mutex<Option<String>>,
    /// When set, only queries fail; control operations still work. Models
    /// a rack that cannot route to the BMC's query port.
    pub query_fails: Mutex<bool>,
    /// Simulated hardware power state per node system id.
    pub power_states: Mutex<BTreeMap<String, PowerState>>,
    /// Call log: "(op) (system_id)".
    pub calls: Mutex<Vec<String>>,
}

impl FakeRack {
    pub fn new(ident: &str) -> Arc<Self> {
        Arc::new(FakeRack {
            ident: ident.to_string(),
            reachable: Mutex::new(true),
            missing_packages: Mutex::new(Vec::new()),
            fail_message: Mutex::new(None),
            query_fails: Mutex::new(false),
            power_states: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        *self.reachable.lock().unwrap() = reachable;
    }

    pub fn set_power_state(&self, system_id: &str, state: PowerState) {
        self.power_states
            .lock()
            .unwrap()
            .insert(system_id.to_string(), state);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, op: &str, system_id: &str, resulting: PowerState) -> AgentReply {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op} {system_id}"));
        if let Some(message) = self.fail_message.lock().unwrap().clone() {
            return AgentReply::Failed(message);
        }
        self.set_power_state(system_id, resulting);
        AgentReply::Success(resulting)
    }
}

struct FakeClient {
    rack: Arc<FakeRack>,
}

#[async_trait]
impl AgentClient for FakeClient {
    fn ident(&self) -> &str {
        &self.rack.ident
    }

    async fn power_on(
        &self,
        system_id: &str,
        _hostname: &str,
        _power_type: &str,
        _params: &PowerParams,
    ) -> std::result::Result<AgentReply, AgentError> {
        Ok(self.rack.answer("on", system_id, PowerState::On))
    }

    async fn power_off(
        &self,
        system_id: &str,
        _hostname: &str,
        _power_type: &str,
        _params: &PowerParams,
    ) -> std::result::Result<AgentReply, AgentError> {
        Ok(self.rack.answer("off", system_id, PowerState::Off))
    }

    async fn power_cycle(
        &self,
        system_id: &str,
        _hostname: &str,
        _power_type: &str,
        _params: &PowerParams,
    ) -> std::result::Result<AgentReply, AgentError> {
        Ok(self.rack.answer("cycle", system_id, PowerState::On))
    }

    async fn power_query(
        &self,
        system_id: &str,
        _hostname: &str,
        _power_type: &str,
        _params: &PowerParams,
    ) -> std::result::Result<AgentReply, AgentError> {
        self.rack
            .calls
            .lock()
            .unwrap()
            .push(format!("query {system_id}"));
        if let Some(message) = self.rack.fail_message.lock().unwrap().clone() {
            return Ok(AgentReply::Failed(message));
        }
        if *self.rack.query_fails.lock().unwrap() {
            return Ok(AgentReply::Failed("no route to BMC".to_string()));
        }
        let state = self
            .rack
            .power_states
            .lock()
            .unwrap()
            .get(system_id)
            .copied()
            .unwrap_or(PowerState::Unknown);
        Ok(AgentReply::Success(state))
    }

    async fn missing_power_packages(
        &self,
        _power_type: &str,
    ) -> std::result::Result<Vec<String>, AgentError> {
        Ok(self.rack.missing_packages.lock().unwrap().clone())
    }
}

pub struct FakeConnector {
    pub racks: Vec<Arc<FakeRack>>,
}

#[async_trait]
impl AgentConnector for FakeConnector {
    async fn connect(
        &self,
        idents: &[String],
    ) -> std::result::Result<Box<dyn AgentClient>, AgentError> {
        for ident in idents {
            for rack in &self.racks {
                if &rack.ident == ident && *rack.reachable.lock().unwrap() {
                    return Ok(Box::new(FakeClient { rack: rack.clone() }));
                }
            }
        }
        Err(AgentError::ConnectionUnavailable)
    }

    async fn all_rack_idents(&self) -> Vec<String> {
        self.racks.iter().map(|r| r.ident.clone()).collect()
    }
}

/// Everything a test needs, wired together.
pub struct TestEnv {
    pub store: Arc<Store>,
    pub racks: Vec<Arc<FakeRack>>,
    pub events: Arc<RecordingEventSink>,
    pub scripts: Arc<SimpleScriptSets>,
    pub power: Arc<PowerOrchestrator>,
    pub machines: Machines,
}

impl TestEnv {
    pub fn new() -> Self {
        TestEnv::with_racks(vec![FakeRack::new("rack01")])
    }

    pub fn with_racks(racks: Vec<Arc<FakeRack>>) -> Self {
        TestEnv::with_config(racks, Config::default())
    }

    pub fn with_config(racks: Vec<Arc<FakeRack>>, config: Config) -> Self {
        let store = Arc::new(Store::new());
        let events = Arc::new(RecordingEventSink::default());
        let scripts = Arc::new(SimpleScriptSets::default());
        let connector = Arc::new(FakeConnector {
            racks: racks.clone(),
        });
        let power = Arc::new(PowerOrchestrator::new(
            store.clone(),
            connector,
            PowerDriverRegistry::well_known(),
            events.clone(),
        ));
        let machines = Machines::new(
            store.clone(),
            power.clone(),
            events.clone(),
            scripts.clone(),
            config,
        );
        TestEnv {
            store,
            racks,
            events,
            scripts,
            power,
            machines,
        }
    }

    pub fn add_machine(&self, hostname: &str, status: NodeStatus) -> NodeRecord {
        let mut node = NodeRecord::new(hostname, NodeKind::Machine);
        node.status = status;
        self.store.add_node(node).unwrap()
    }

    /// Attach an IPMI BMC whose routable set is exactly `routable`.
    pub fn attach_bmc(&self, system_id: &str, routable: &[&str]) -> Bmc {
        let mut params = BTreeMap::new();
        params.insert("power_address".to_string(), format!("10.9.0.{system_id}"));
        let mut bmc = self.store.get_or_create_bmc("ipmi", params);
        bmc.update_routable_racks(
            routable.iter().map(|r| r.to_string()).collect(),
            Vec::new(),
        );
        self.store.save_bmc(bmc.clone()).unwrap();
        let mut node = self.store.get_node(system_id).unwrap();
        node.bmc_id = Some(bmc.id);
        self.store.save_node(node).unwrap();
        bmc
    }

    /// Give the node a deployable single-disk storage layout.
    pub fn with_root_storage(&self, system_id: &str) {
        use crate::storage::{BlockDevice, Filesystem, FsType, Partition};
        let mut node = self.store.get_node(system_id).unwrap();
        let mut disk = BlockDevice::new("sda");
        disk.boot_disk = true;
        disk.partitions.push(Partition {
            name: "sda1".to_string(),
            filesystem: Some(Filesystem {
                fstype: FsType::Ext4,
                mount_point: Some("/".to_string()),
                acquired: false,
            }),
        });
        node.block_devices.push(disk);
        self.store.save_node(node).unwrap();
    }

    /// Wire up eth0 on a fresh subnet, with one link of `alloc_type`.
    /// Returns (interface, subnet).
    pub fn with_network(
        &self,
        system_id: &str,
        cidr: &str,
        alloc_type: IpAllocType,
        address: Option<&str>,
    ) -> Result<(Interface, Subnet)> {
        let fabric = self.store.default_fabric();
        let subnet = match self.store.create_subnet(
            cidr,
            fabric.default_vlan,
            cidr.parse().unwrap(),
            None,
            Vec::new(),
        ) {
            Ok(subnet) => subnet,
            Err(_) => self
                .store
                .subnets()
                .into_iter()
                .find(|s| s.cidr.to_string() == cidr)
                .unwrap(),
        };
        let iface = self.store.create_interface(Interface {
            id: 0,
            node: system_id.to_string(),
            name: "eth0".to_string(),
            kind: InterfaceKind::Physical,
            mac_address: Some(format!("52:54:00:00:00:{:02x}", subnet.id as u8)),
            enabled: true,
            vlan_id: Some(fabric.default_vlan),
            parents: Vec::new(),
            vid: None,
            acquired: false,
            link_ids: Vec::new(),
        })?;
        self.store.create_link(
            iface.id,
            IpLink {
                id: 0,
                alloc_type,
                address: address.map(|a| a.parse().unwrap()),
                subnet_id: Some(subnet.id),
            },
        )?;
        let mut node = self.store.get_node(system_id).unwrap();
        node.boot_interface_id = Some(iface.id);
        self.store.save_node(node).unwrap();
        let iface = self.store.get_interface(iface.id)?;
        Ok((iface, subnet))
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        TestEnv::new()
    }
}
