// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Rescue mode: boot a deployed or broken node into an ephemeral
//! environment for hands-on debugging, then put it back exactly where it
//! was. The exit path is resolved by power observation: a previously
//! broken node is expected to land OFF, a previously deployed one to come
//! back ON.

use log::warn;

use super::{Machines, Requester};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::node::NodeRecord;
use crate::status::NodeStatus;

impl Machines {
    /// Boot the node into the rescue environment. Requires a configured
    /// power type; there is no such thing as manual rescue entry.
    pub async fn start_rescue_mode(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        if !matches!(node.status, NodeStatus::Deployed | NodeStatus::Broken) {
            return Err(Error::StateViolation(format!(
                "{node} cannot enter rescue mode in its current state ({}).",
                node.status
            )));
        }
        if self.power.effective_power_info(&node).power_type.is_none() {
            return Err(Error::UnknownPowerType(format!(
                "Unconfigured power type. Please configure the power type of {node} and \
                 try again."
            )));
        }
        self.record(
            &node,
            EventKind::RequestStartRescueMode,
            "start rescue mode",
            format!("requested by {}", requester.username),
        );

        let mut node = node;
        node.status = NodeStatus::EnteringRescueMode;
        let timeout = self.config.entering_rescue_mode_timeout;
        self.deadline_in(&mut node, timeout);
        let node = self.store.save_node(node)?;

        match self.power.power_cycle(&node).await {
            Ok(state) => {
                self.store.set_power_state(&node.system_id, state)?;
                // The rescue environment is booting; it announces itself
                // once up.
                let mut node = self.node(system_id)?;
                node.status = NodeStatus::RescueMode;
                let node = self.store.save_node(node)?;
                Ok(node)
            }
            Err(err) => {
                warn!("{node}: could not boot the rescue environment: {err}");
                let mut failed = self.node(system_id)?;
                failed.status = NodeStatus::FailedEnteringRescueMode;
                self.store.save_node(failed)?;
                Err(err)
            }
        }
    }

    /// Leave rescue mode. The node is powered toward the state its
    /// pre-rescue status implies; the final transition happens when that
    /// state is observed by `update_power_state`.
    pub async fn stop_rescue_mode(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        if node.status != NodeStatus::RescueMode {
            return Err(Error::StateViolation(format!(
                "{node} cannot exit rescue mode in its current state ({}).",
                node.status
            )));
        }
        self.record(
            &node,
            EventKind::RequestStopRescueMode,
            "stop rescue mode",
            format!("requested by {}", requester.username),
        );

        let mut node = node;
        node.status = NodeStatus::ExitingRescueMode;
        let node = self.store.save_node(node)?;

        let result = match node.previous_status {
            Some(NodeStatus::Broken) => self.power.power_off(&node).await,
            Some(NodeStatus::Deployed) => self.power.power_cycle(&node).await,
            other => {
                warn!(
                    "{node}: no resumable pre-rescue status ({other:?}); marking the exit failed"
                );
                let mut failed = self.node(system_id)?;
                failed.status = NodeStatus::FailedExitingRescueMode;
                return self.store.save_node(failed);
            }
        };
        match result {
            Ok(state) => {
                self.update_power_state(&node.system_id, state).await?;
                self.node(system_id)
            }
            Err(err) => {
                warn!("{node}: rescue-mode exit power action failed: {err}");
                let mut failed = self.node(system_id)?;
                failed.status = NodeStatus::FailedExitingRescueMode;
                self.store.save_node(failed)?;
                Err(err)
            }
        }
    }
}
