// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Commissioning: boot the node into an ephemeral environment that
//! inventories its hardware. The node's storage and network configuration
//! are wiped first (unless explicitly kept) because commissioning
//! rediscovers both from scratch.

use log::{info, warn};

use super::{Machines, Requester};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::network::InterfaceKind;
use crate::node::{NodeRecord, PowerState};
use crate::scripts::ScriptSetKind;
use crate::status::NodeStatus;

impl Machines {
    /// Start commissioning. Fails fast without a configured power type:
    /// a node we cannot power-cycle cannot be commissioned unattended.
    pub async fn start_commissioning(
        &self,
        system_id: &str,
        requester: &Requester,
        enable_ssh: bool,
        skip_networking: bool,
        skip_storage: bool,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        self.ensure_transition(&node, NodeStatus::Commissioning)?;
        if self.power.effective_power_info(&node).power_type.is_none() {
            return Err(Error::UnknownPowerType(format!(
                "Unconfigured power type. Please configure the power type of {node} and \
                 try again."
            )));
        }
        self.record(
            &node,
            EventKind::RequestStartCommissioning,
            "start commissioning",
            format!("requested by {}", requester.username),
        );

        let mut node = node;
        node.enable_ssh = enable_ssh;
        node.skip_networking = skip_networking;
        node.skip_storage = skip_storage;
        if !skip_storage {
            crate::storage::clear_full_configuration(&mut node);
        }
        if !skip_networking {
            self.clear_network_config(&node)?;
            // The boot interface may have been a stacked interface that
            // clear_network_config just deleted; this clone must not write
            // the dead reference back on save.
            if let Some(id) = node.boot_interface_id {
                if self.store.get_interface(id).is_err() {
                    node.boot_interface_id = None;
                }
            }
        }
        let script_set = self
            .scripts
            .create(&node.system_id, ScriptSetKind::Commissioning);
        if let Some(old) = node.current_commissioning_script_set.replace(script_set) {
            self.scripts.delete(old);
        }
        node.status = NodeStatus::Commissioning;
        node.owner = Some(requester.username.clone());
        let timeout = self.config.commissioning_timeout;
        self.deadline_in(&mut node, timeout);
        let node = self.store.save_node(node)?;

        // Cycle if the node is up to guarantee a clean commissioning
        // boot; a cold node just gets started. A failure here does not
        // revert the status: the node stays in the monitored
        // COMMISSIONING state and the deadline sweeper will fail it.
        let result = if node.power_state == PowerState::On {
            self.power.power_cycle(&node).await
        } else {
            self.power.power_on(&node).await
        };
        match result {
            Ok(state) => {
                self.store.set_power_state(&node.system_id, state)?;
                info!("{node}: commissioning started");
                Ok(node)
            }
            Err(err) => {
                warn!("{node}: could not power on for commissioning: {err}");
                Err(err)
            }
        }
    }

    /// Abort a commissioning run, powering the node off and returning it
    /// to NEW with no owner.
    pub async fn abort_commissioning(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        let node = self
            .abort_to(
                system_id,
                requester,
                NodeStatus::Commissioning,
                NodeStatus::New,
                EventKind::RequestAbortCommissioning,
            )
            .await?;
        let mut node = node;
        node.owner = None;
        let node = self.store.save_node(node)?;
        Ok(node)
    }

    /// Abort a deployment, powering the node off and returning it to the
    /// allocated (pre-deploy) state with its owner intact.
    pub async fn abort_deploying(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        self.abort_to(
            system_id,
            requester,
            NodeStatus::Deploying,
            NodeStatus::Allocated,
            EventKind::RequestAbortDeployment,
        )
        .await
    }

    /// Drop all networking configuration ahead of commissioning: stacked
    /// interfaces are deleted outright, physical interfaces survive but
    /// lose their addresses.
    pub(crate) fn clear_network_config(&self, node: &NodeRecord) -> Result<()> {
        let interfaces = self.store.interfaces_for_node(&node.system_id);
        // Children first, to keep parent references valid while deleting.
        let mut stacked: Vec<_> = interfaces
            .iter()
            .filter(|i| i.kind != InterfaceKind::Physical)
            .cloned()
            .collect();
        while !stacked.is_empty() {
            let removable: Vec<u64> = stacked
                .iter()
                .filter(|i| !stacked.iter().any(|o| o.parents.contains(&i.id)))
                .map(|i| i.id)
                .collect();
            let removable = if removable.is_empty() {
                vec![stacked[0].id]
            } else {
                removable
            };
            for id in &removable {
                self.store.delete_interface(*id)?;
            }
            stacked.retain(|i| !removable.contains(&i.id));
        }
        for iface in interfaces.iter().filter(|i| i.kind == InterfaceKind::Physical) {
            for link_id in &iface.link_ids {
                self.store.detach_link(iface.id, *link_id)?;
            }
        }
        Ok(())
    }
}
