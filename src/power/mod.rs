// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Power orchestration: turning "power this node on" into a conversation
//! with whichever rack agent can actually reach the node's BMC.
//!
//! The hard part is routing. A BMC caches which racks were last able to
//! reach it; when that cache is empty the orchestrator first broadcasts a
//! power query through every known rack and persists who answered, then
//! proceeds over the freshly-learned routable set. Racks that serve DHCP
//! on the node's boot VLAN act as a fallback when the cached racks have
//! all gone away.

pub mod driver;

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, warn};

use crate::agent::{bounded, AgentClient, AgentConnector, AgentError, AgentReply, PowerParams};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventLog};
use crate::node::{NodeRecord, PowerState};
use crate::power::driver::{effective_power_parameters, PowerDriverRegistry, PowerInfo};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    On,
    Off,
    Cycle,
    Query,
}

pub struct PowerOrchestrator {
    store: Arc<Store>,
    connector: Arc<dyn AgentConnector>,
    registry: PowerDriverRegistry,
    events: Arc<dyn EventLog>,
}

impl PowerOrchestrator {
    pub fn new(
        store: Arc<Store>,
        connector: Arc<dyn AgentConnector>,
        registry: PowerDriverRegistry,
        events: Arc<dyn EventLog>,
    ) -> Self {
        PowerOrchestrator {
            store,
            connector,
            registry,
            events,
        }
    }

    /// Derive how this node's power can be controlled right now. Soft on
    /// missing configuration: a node with no BMC, or a BMC with a blank
    /// power type, yields the all-false info rather than an error.
    pub fn effective_power_info(&self, node: &NodeRecord) -> PowerInfo {
        let bmc = node.bmc_id.and_then(|id| self.store.get_bmc(id).ok());
        let power_type = bmc
            .as_ref()
            .map(|b| b.power_type.clone())
            .filter(|t| !t.is_empty());
        let Some(power_type) = power_type else {
            return PowerInfo::unconfigured();
        };
        let boot_mac = node
            .boot_interface_id
            .and_then(|id| self.store.get_interface(id).ok())
            .and_then(|iface| iface.mac_address);
        let power_parameters =
            effective_power_parameters(node, bmc.as_ref(), boot_mac.as_deref());

        // Manual nodes are flipped by a human; controllers host the very
        // services doing the flipping. Neither is ours to start or stop.
        let controllable = power_type != "manual" && !node.kind.is_controller();
        let can_be_queried = self
            .registry
            .get(&power_type)
            .map(|d| d.queryable)
            .unwrap_or(false);
        PowerInfo {
            can_be_started: controllable,
            can_be_stopped: controllable,
            can_be_queried,
            power_type: Some(power_type),
            power_parameters,
        }
    }

    pub async fn power_on(&self, node: &NodeRecord) -> Result<PowerState> {
        self.control(node, PowerOp::On).await
    }

    pub async fn power_off(&self, node: &NodeRecord) -> Result<PowerState> {
        self.control(node, PowerOp::Off).await
    }

    pub async fn power_cycle(&self, node: &NodeRecord) -> Result<PowerState> {
        self.control(node, PowerOp::Cycle).await
    }

    /// Ask the node's BMC for its current power state. Emits an audit
    /// event either way; recording the answer on the node is the machine
    /// service's job.
    pub async fn power_query(&self, node: &NodeRecord) -> Result<PowerState> {
        match self.control(node, PowerOp::Query).await {
            Ok(state) => {
                self.events.record(Event {
                    system_id: node.system_id.clone(),
                    kind: EventKind::PowerQueried,
                    action: "query".to_string(),
                    description: format!("Power state queried: {state}"),
                });
                Ok(state)
            }
            Err(err) => {
                self.events.record(Event {
                    system_id: node.system_id.clone(),
                    kind: EventKind::PowerQueryFailed,
                    action: "query".to_string(),
                    description: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The common control path for every operation.
    async fn control(&self, node: &NodeRecord, op: PowerOp) -> Result<PowerState> {
        let bmc_id = node.bmc_id.ok_or_else(|| {
            Error::UnknownPowerType(format!("{node} does not have a configured BMC"))
        })?;
        let mut bmc = self.store.get_bmc(bmc_id)?;
        let info = self.effective_power_info(node);
        let power_type = info.power_type.clone().ok_or_else(|| {
            Error::UnknownPowerType(format!("{node} has no power type configured"))
        })?;

        if !bmc.is_accessible() {
            // Nobody is known to reach this BMC. Rediscover by asking
            // every rack to query it, and remember who could.
            debug!("rediscovering routable racks for BMC of {node}");
            let (state, routable, non_routable) = self
                .broadcast_query(node, &power_type, &info.power_parameters)
                .await;
            bmc.update_routable_racks(routable, non_routable);
            self.store.save_bmc(bmc.clone())?;
            if let Some(state) = state {
                // A fresh answer came back anyway; keep it.
                self.store.set_power_state(&node.system_id, state)?;
            }
        }

        let idents = bmc.client_identifiers();
        let fallback = self.fallback_idents(node, &idents);
        if idents.is_empty() && fallback.is_empty() {
            return Err(Error::PowerProblem(format!(
                "No rack controllers can access the BMC of node {}",
                node.hostname
            )));
        }

        let client = match self.connector.connect(&idents).await {
            Ok(client) => client,
            Err(AgentError::ConnectionUnavailable) if !fallback.is_empty() => {
                debug!(
                    "falling back to boot-VLAN racks {:?} for {node}",
                    fallback
                );
                self.connector.connect(&fallback).await.map_err(Error::from)?
            }
            Err(err) => return Err(err.into()),
        };

        self.confirm_driver_operable(client.as_ref(), &power_type)
            .await?;

        let secs = crate::agent_call_timeout();
        let ident = client.ident().to_string();
        let reply = match op {
            PowerOp::On => {
                bounded(
                    &ident,
                    secs,
                    client.power_on(
                        &node.system_id,
                        &node.hostname,
                        &power_type,
                        &info.power_parameters,
                    ),
                )
                .await?
            }
            PowerOp::Off => {
                bounded(
                    &ident,
                    secs,
                    client.power_off(
                        &node.system_id,
                        &node.hostname,
                        &power_type,
                        &info.power_parameters,
                    ),
                )
                .await?
            }
            PowerOp::Cycle => {
                bounded(
                    &ident,
                    secs,
                    client.power_cycle(
                        &node.system_id,
                        &node.hostname,
                        &power_type,
                        &info.power_parameters,
                    ),
                )
                .await?
            }
            PowerOp::Query => {
                bounded(
                    &ident,
                    secs,
                    client.power_query(
                        &node.system_id,
                        &node.hostname,
                        &power_type,
                        &info.power_parameters,
                    ),
                )
                .await?
            }
        };

        match reply {
            AgentReply::Success(state) => Ok(state),
            AgentReply::Failed(message) => Err(Error::PowerProblem(message)),
        }
    }

    /// Verify the chosen rack actually carries the driver software before
    /// dispatching, so the admin sees a package list instead of a cryptic
    /// driver failure.
    async fn confirm_driver_operable(
        &self,
        client: &dyn AgentClient,
        power_type: &str,
    ) -> Result<()> {
        let secs = crate::agent_call_timeout();
        let ident = client.ident().to_string();
        let missing = bounded(&ident, secs, client.missing_power_packages(power_type)).await?;
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::missing_packages(&ident, missing))
        }
    }

    /// Query the BMC through every known rack at once. Racks whose query
    /// succeeds are routable; racks that error, fail, or time out are not.
    async fn broadcast_query(
        &self,
        node: &NodeRecord,
        power_type: &str,
        params: &PowerParams,
    ) -> (Option<PowerState>, Vec<String>, Vec<String>) {
        let idents = self.connector.all_rack_idents().await;
        let secs = crate::agent_broadcast_timeout();

        let attempts = idents.into_iter().map(|ident| async move {
            let outcome = async {
                let client = self
                    .connector
                    .connect(std::slice::from_ref(&ident))
                    .await?;
                bounded(
                    &ident,
                    secs,
                    client.power_query(&node.system_id, &node.hostname, power_type, params),
                )
                .await
            }
            .await;
            (ident, outcome)
        });

        let mut state = None;
        let mut routable = Vec::new();
        let mut non_routable = Vec::new();
        for (ident, outcome) in join_all(attempts).await {
            match outcome {
                Ok(AgentReply::Success(s)) => {
                    if state.is_none() {
                        state = Some(s);
                    }
                    routable.push(ident);
                }
                Ok(AgentReply::Failed(message)) => {
                    warn!("rack {ident} could not query BMC of {node}: {message}");
                    non_routable.push(ident);
                }
                Err(err) => {
                    warn!("rack {ident} unreachable while probing BMC of {node}: {err}");
                    non_routable.push(ident);
                }
            }
        }
        (state, routable, non_routable)
    }

    /// Racks serving DHCP on the node's boot VLAN, minus any already in
    /// the primary set. They are physically adjacent to the node and make
    /// a reasonable last resort.
    fn fallback_idents(&self, node: &NodeRecord, primary: &[String]) -> Vec<String> {
        let Some(boot_iface) = node
            .boot_interface_id
            .and_then(|id| self.store.get_interface(id).ok())
        else {
            return Vec::new();
        };
        let Some(vlan) = boot_iface.vlan_id.and_then(|id| self.store.get_vlan(id).ok())
        else {
            return Vec::new();
        };
        [vlan.primary_rack, vlan.secondary_rack]
            .into_iter()
            .flatten()
            .filter(|ident| !primary.contains(ident))
            .collect()
    }
}
