// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The lifecycle workflows. Every workflow follows one shape: check the
//! caller's capability, record an audit event, make the synchronous state
//! change and save it, then perform the hardware-facing part through the
//! power orchestrator. A failure before the save leaves nothing behind; a
//! failure after it compensates (reverting status, releasing claimed
//! addresses) and re-raises.

pub mod commission;
pub mod deploy;
pub mod release;
pub mod rescue;

use std::sync::Arc;

use chrono::{Duration, Utc};
use log::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind, EventLog};
use crate::node::{NodeRecord, PowerState};
use crate::power::PowerOrchestrator;
use crate::scripts::ScriptSetFactory;
use crate::status::{is_transition_allowed, NodeStatus};
use crate::store::Store;

/// The caller on whose behalf a workflow runs.
#[derive(Debug, Clone)]
pub struct Requester {
    pub username: String,
    pub is_admin: bool,
}

impl Requester {
    pub fn user(username: &str) -> Self {
        Requester {
            username: username.to_string(),
            is_admin: false,
        }
    }

    pub fn admin(username: &str) -> Self {
        Requester {
            username: username.to_string(),
            is_admin: true,
        }
    }
}

/// How a start request ended. A node whose power type cannot be started
/// is not an error; somebody has to walk over and press the button.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    ManualPowerRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NothingToDo,
}

/// The machine lifecycle service.
pub struct Machines {
    pub(crate) store: Arc<Store>,
    pub(crate) power: Arc<PowerOrchestrator>,
    pub(crate) events: Arc<dyn EventLog>,
    pub(crate) scripts: Arc<dyn ScriptSetFactory>,
    pub(crate) config: Config,
}

impl Machines {
    pub fn new(
        store: Arc<Store>,
        power: Arc<PowerOrchestrator>,
        events: Arc<dyn EventLog>,
        scripts: Arc<dyn ScriptSetFactory>,
        config: Config,
    ) -> Self {
        Machines {
            store,
            power,
            events,
            scripts,
            config,
        }
    }

    pub(crate) fn node(&self, system_id: &str) -> Result<NodeRecord> {
        self.store.get_node(system_id)
    }

    pub(crate) fn check_edit(&self, node: &NodeRecord, requester: &Requester) -> Result<()> {
        let allowed = requester.is_admin
            || node.owner.is_none()
            || node.owner.as_deref() == Some(requester.username.as_str());
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "{} cannot edit {node}",
                requester.username
            )))
        }
    }

    /// Reject up front a status change the save guard would refuse, so
    /// workflows never half-apply side effects before the rejection.
    pub(crate) fn ensure_transition(&self, node: &NodeRecord, to: NodeStatus) -> Result<()> {
        if is_transition_allowed(node.status, to) {
            Ok(())
        } else {
            Err(Error::StateViolation(format!(
                "Invalid transition: {} -> {}.",
                node.status, to
            )))
        }
    }

    pub(crate) fn record(&self, node: &NodeRecord, kind: EventKind, action: &str, desc: String) {
        self.events.record(Event {
            system_id: node.system_id.clone(),
            kind,
            action: action.to_string(),
            description: desc,
        });
    }

    pub(crate) fn deadline_in(&self, node: &mut NodeRecord, secs: u64) {
        node.status_expires = Some(Utc::now() + Duration::seconds(secs as i64));
    }

    // ----- power-state ingestion -----

    /// Record a power state reported for a node and apply its lifecycle
    /// consequences: a releasing node observed OFF has finished releasing,
    /// and a node exiting rescue mode resolves against where it came from.
    pub async fn update_power_state(&self, system_id: &str, state: PowerState) -> Result<()> {
        let mut node = self.node(system_id)?;
        node.power_state = state;
        node.power_state_updated = Some(Utc::now());

        match node.status {
            NodeStatus::Releasing if state == PowerState::Off => {
                let node = self.store.save_node(node)?;
                self.finalize_release(node)?;
            }
            NodeStatus::ExitingRescueMode => {
                let resumed = match (node.previous_status, state) {
                    (Some(NodeStatus::Broken), PowerState::Off) => NodeStatus::Broken,
                    (Some(NodeStatus::Deployed), PowerState::On) => NodeStatus::Deployed,
                    _ => NodeStatus::FailedExitingRescueMode,
                };
                if resumed == NodeStatus::Broken {
                    node.owner = None;
                }
                node.status = resumed;
                self.store.save_node(node)?;
            }
            _ => {
                self.store.save_node(node)?;
            }
        }
        Ok(())
    }

    // ----- stop -----

    /// Power a node off. `stop_mode` ("hard"/"soft") rides along as a
    /// power-parameter hint without being persisted.
    pub async fn stop(
        &self,
        system_id: &str,
        requester: &Requester,
        stop_mode: Option<&str>,
    ) -> Result<StopOutcome> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        self.record(
            &node,
            EventKind::RequestStop,
            "stop",
            format!("requested by {}", requester.username),
        );

        let info = self.power.effective_power_info(&node);
        if !info.can_be_stopped {
            info!("{node} cannot be stopped by its power type; nothing to do");
            return Ok(StopOutcome::NothingToDo);
        }
        let mut target = node.clone();
        if let Some(mode) = stop_mode {
            target
                .instance_power_parameters
                .insert("power_off_mode".to_string(), mode.to_string());
        }
        let state = self.power.power_off(&target).await?;
        self.store.set_power_state(&node.system_id, state)?;
        Ok(StopOutcome::Stopped)
    }

    /// Ask the node's BMC for its power state and fold the answer back
    /// into the record. Unqueryable power types answer `Unknown`.
    pub async fn query_power(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<PowerState> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        let info = self.power.effective_power_info(&node);
        if !info.can_be_queried {
            return Ok(PowerState::Unknown);
        }
        let state = self.power.power_query(&node).await?;
        self.update_power_state(system_id, state).await?;
        Ok(state)
    }

    /// Hard power cycle, without any lifecycle implications.
    pub async fn power_cycle(&self, system_id: &str, requester: &Requester) -> Result<()> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        let state = self.power.power_cycle(&node).await?;
        self.store.set_power_state(&node.system_id, state)?;
        Ok(())
    }

    // ----- aborts -----

    /// Abort whatever cancellable operation the node is in the middle of.
    pub async fn abort_operation(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        match node.status {
            NodeStatus::Commissioning => self.abort_commissioning(system_id, requester).await,
            NodeStatus::Deploying => self.abort_deploying(system_id, requester).await,
            NodeStatus::DiskErasing => self.abort_disk_erasing(system_id, requester).await,
            status => Err(Error::StateViolation(format!(
                "Cannot abort in current state: node {node} is in state {status}."
            ))),
        }
    }

    /// Shared abort machinery: verify the node is exactly in
    /// `in_progress`, try to power it off, then park it at `target`.
    pub(crate) async fn abort_to(
        &self,
        system_id: &str,
        requester: &Requester,
        in_progress: NodeStatus,
        target: NodeStatus,
        kind: EventKind,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        if node.status != in_progress {
            return Err(Error::StateViolation(format!(
                "Cannot abort {in_progress} of {node} while it is {}.",
                node.status
            )));
        }
        self.record(
            &node,
            kind,
            "abort",
            format!("requested by {}", requester.username),
        );

        let info = self.power.effective_power_info(&node);
        if info.can_be_stopped {
            let state = self.power.power_off(&node).await?;
            self.store.set_power_state(&node.system_id, state)?;
            info!("{node}: operation aborted, hardware powered off");
        } else {
            warn!("{node}: operation aborted, but the hardware must be powered off manually");
        }

        let mut node = self.node(system_id)?;
        node.status = target;
        let node = self.store.save_node(node)?;
        Ok(node)
    }

    // ----- mark failed / broken / fixed -----

    /// Move an in-progress node to its failed counterpart. Idempotent:
    /// already-failed and still-new nodes are left untouched.
    pub fn mark_failed(&self, system_id: &str, message: &str) -> Result<()> {
        let mut node = self.node(system_id)?;
        if node.status == NodeStatus::New || node.status.is_failed() {
            return Ok(());
        }
        let Some(failed) = node.status.failed_counterpart() else {
            return Err(Error::StateViolation(format!(
                "The status of {node} is {}; this status cannot be transitioned to a \
                 corresponding failed status.",
                node.status
            )));
        };
        warn!("{node} marked failed: {message}");
        self.record(
            &node,
            EventKind::RequestMarkFailed,
            "mark failed",
            message.to_string(),
        );
        node.status = failed;
        node.error_description = message.to_string();
        self.store.save_node(node)?;
        Ok(())
    }

    /// Take a node out of service. A node in the releasable band is
    /// released first (best effort), then forced BROKEN and disowned.
    pub async fn mark_broken(
        &self,
        system_id: &str,
        requester: &Requester,
        message: &str,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        self.record(
            &node,
            EventKind::RequestMarkBroken,
            "mark broken",
            message.to_string(),
        );

        if node.status.is_releasable() && node.owner.is_some() {
            if let Err(err) = self.release(system_id, requester).await {
                warn!("{node}: release while marking broken failed: {err}");
            }
        }

        let mut node = self.node(system_id)?;
        node.status = NodeStatus::Broken;
        node.owner = None;
        node.error_description = message.to_string();
        let node = self.store.save_node(node)?;
        Ok(node)
    }

    /// Return a repaired node to service.
    pub fn mark_fixed(&self, system_id: &str, requester: &Requester) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        if node.status != NodeStatus::Broken {
            return Err(Error::StateViolation(format!(
                "Can't mark {node} as fixed; it is not broken."
            )));
        }
        if node.power_state == PowerState::On {
            return Err(Error::StateViolation(format!(
                "Can't mark {node} as fixed while it is powered on."
            )));
        }
        self.record(&node, EventKind::RequestMarkFixed, "mark fixed", String::new());

        let mut node = node;
        node.status = NodeStatus::Ready;
        node.owner = None;
        node.error_description.clear();
        node.osystem.clear();
        node.distro_series.clear();
        node.license_key.clear();
        if let Some(set) = node.current_installation_script_set.take() {
            self.scripts.delete(set);
        }
        let node = self.store.save_node(node)?;
        Ok(node)
    }

    // ----- acquire -----

    /// Allocate a node to a user. The commissioned filesystem layout is
    /// copied into an acquired layer so release can discard exactly what
    /// allocation added; with `bridge_all`, every configured interface
    /// additionally gets an acquired bridge carrying its addresses.
    pub fn acquire(
        &self,
        system_id: &str,
        requester: &Requester,
        agent_name: &str,
        token: Option<&str>,
        bridge_all: bool,
    ) -> Result<NodeRecord> {
        let mut node = self.node(system_id)?;
        if let Some(owner) = &node.owner {
            return Err(Error::StateViolation(format!(
                "{node} is already acquired by {owner}."
            )));
        }
        self.ensure_transition(&node, NodeStatus::Allocated)?;
        self.record(
            &node,
            EventKind::RequestAcquire,
            "acquire",
            format!("acquired by {}", requester.username),
        );

        crate::storage::create_acquired_filesystems(&mut node);
        if bridge_all {
            self.create_acquired_bridges(&node)?;
        }

        node.status = NodeStatus::Allocated;
        node.owner = Some(requester.username.clone());
        node.agent_name = agent_name.to_string();
        node.token = token.map(str::to_string);
        let node = self.store.save_node(node)?;
        info!("{node} allocated to {}", requester.username);
        Ok(node)
    }

    /// Bridge every configured non-bridge interface, moving its addresses
    /// onto the bridge. The bridges are flagged acquired so release can
    /// unwind them.
    fn create_acquired_bridges(&self, node: &NodeRecord) -> Result<()> {
        use crate::network::{Interface, InterfaceKind};
        for iface in self.store.interfaces_for_node(&node.system_id) {
            if iface.kind == InterfaceKind::Bridge || iface.vlan_id.is_none() || !iface.enabled {
                continue;
            }
            let bridge = self.store.create_interface(Interface {
                id: 0,
                node: node.system_id.clone(),
                name: format!("br-{}", iface.name),
                kind: InterfaceKind::Bridge,
                mac_address: iface.mac_address.clone(),
                enabled: true,
                vlan_id: iface.vlan_id,
                parents: vec![iface.id],
                vid: None,
                acquired: true,
                link_ids: Vec::new(),
            })?;
            for link_id in &iface.link_ids {
                self.store.attach_link(bridge.id, *link_id)?;
                self.store.detach_link(iface.id, *link_id)?;
            }
        }
        Ok(())
    }
}
