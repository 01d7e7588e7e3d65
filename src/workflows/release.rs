// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Releasing a node back to the pool, optionally via disk erasure. The
//! tricky part is knowing when the hardware has actually powered down:
//! a queryable node parks in RELEASING until an OFF observation arrives,
//! a non-queryable one is finalized on faith.

use log::{info, warn};

use super::{Machines, Requester};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::network::IpAllocType;
use crate::node::{NodeKind, NodeRecord, PowerState};
use crate::status::NodeStatus;

impl Machines {
    /// Release a node from its owner. Requires the node to be owned and
    /// in the releasable band.
    pub async fn release(&self, system_id: &str, requester: &Requester) -> Result<()> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        if node.owner.is_none() {
            return Err(Error::StateViolation(format!(
                "{node} cannot be released because it has no owner."
            )));
        }
        if !node.status.is_releasable() {
            return Err(Error::StateViolation(format!(
                "{node} cannot be released in its current state ({}).",
                node.status
            )));
        }
        self.record(
            &node,
            EventKind::RequestRelease,
            "release",
            format!("requested by {}", requester.username),
        );

        let mut node = node;
        node.token = None;
        node.agent_name.clear();
        node.netboot = true;
        node.osystem.clear();
        node.distro_series.clear();
        node.license_key.clear();
        if let Some(set) = node.current_installation_script_set.take() {
            self.scripts.delete(set);
        }
        let node = self.store.save_node(node)?;
        self.delete_non_machine_children(&node);

        let info = self.power.effective_power_info(&node);
        if node.power_state == PowerState::Off {
            self.finalize_release(node)?;
            return Ok(());
        }
        if info.can_be_queried {
            // Power down and wait for the OFF observation to finish the
            // job via update_power_state.
            let mut node = node;
            node.status = NodeStatus::Releasing;
            let timeout = self.config.releasing_timeout;
            self.deadline_in(&mut node, timeout);
            let node = self.store.save_node(node)?;
            if info.can_be_stopped {
                let state = self.power.power_off(&node).await?;
                self.store.set_power_state(&node.system_id, state)?;
            }
            Ok(())
        } else {
            // No way to observe the power-down; stop best-effort and
            // finalize immediately.
            if info.can_be_stopped {
                if let Err(err) = self.power.power_off(&node).await {
                    warn!("{node}: stop during release failed: {err}");
                }
            }
            self.finalize_release(node)?;
            Ok(())
        }
    }

    /// Release, or erase-then-release when the deployment-wide erase
    /// policy demands it.
    pub async fn release_or_erase(&self, system_id: &str, requester: &Requester) -> Result<()> {
        if self.config.enable_disk_erasing_on_release {
            self.start_disk_erasing(system_id, requester).await?;
            Ok(())
        } else {
            self.release(system_id, requester).await
        }
    }

    /// Finish a release: unwind acquired interface configuration, discard
    /// the acquired filesystem layer, then either delete the node (a
    /// dynamic machine only existed for its owner) or park it READY.
    pub(crate) fn finalize_release(&self, node: NodeRecord) -> Result<()> {
        let mut node = node;
        if node.status != NodeStatus::Releasing {
            // Route through RELEASING so the transition table sees the
            // same path regardless of which branch finalized.
            node.status = NodeStatus::Releasing;
            node = self.store.save_node(node)?;
        }
        self.release_interface_config(&node)?;
        crate::storage::clear_acquired_filesystems(&mut node);

        if node.dynamic {
            info!("{node} was dynamic; deleting it on release");
            return self.store.delete_node(&node.system_id);
        }
        node.status = NodeStatus::Ready;
        node.owner = None;
        node.owner_data.clear();
        let node = self.store.save_node(node)?;
        info!("{node} released");
        Ok(())
    }

    /// Undo what acquire did to the interfaces: acquired bridges hand
    /// their addresses back to their parent and disappear; auto addresses
    /// lose their assignment.
    pub(crate) fn release_interface_config(&self, node: &NodeRecord) -> Result<()> {
        for iface in self.store.interfaces_for_node(&node.system_id) {
            if iface.acquired {
                if let Some(&parent) = iface.parents.first() {
                    for link_id in &iface.link_ids {
                        self.store.attach_link(parent, *link_id)?;
                    }
                }
                self.store.delete_interface(iface.id)?;
            }
        }
        for iface in self.store.interfaces_for_node(&node.system_id) {
            for mut link in self.store.links_for_interface(&iface) {
                if link.alloc_type == IpAllocType::Auto && link.address.is_some() {
                    link.address = None;
                    self.store.save_link(link)?;
                }
            }
        }
        Ok(())
    }

    /// Children composed under this machine (devices and the like) go
    /// with it; machine children live independent lives.
    fn delete_non_machine_children(&self, node: &NodeRecord) {
        for child in self.store.nodes() {
            if child.parent.as_deref() == Some(node.system_id.as_str())
                && child.kind != NodeKind::Machine
            {
                if let Err(err) = self.store.delete_node(&child.system_id) {
                    warn!("could not delete child {child} of {node}: {err}");
                }
            }
        }
    }

    // ----- disk erasing -----

    /// Boot the node into the disk-erase environment. Any failure, before
    /// or after the power action, lands the node in FAILED_DISK_ERASING
    /// rather than reverting, because the disks' state is unknown once an
    /// erase was requested.
    pub async fn start_disk_erasing(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        let node = self.node(system_id)?;
        self.check_edit(&node, requester)?;
        self.ensure_transition(&node, NodeStatus::DiskErasing)?;
        self.record(
            &node,
            EventKind::RequestEraseDisk,
            "erase disks",
            format!(
                "requested by {} (secure={}, quick={})",
                requester.username,
                self.config.disk_erase_with_secure_erase,
                self.config.disk_erase_with_quick_erase
            ),
        );

        let mut node = node;
        node.status = NodeStatus::DiskErasing;
        let node = self.store.save_node(node)?;

        let result = if node.power_state == PowerState::On {
            self.power.power_cycle(&node).await
        } else {
            self.power.power_on(&node).await
        };
        match result {
            Ok(state) => {
                self.store.set_power_state(&node.system_id, state)?;
                Ok(node)
            }
            Err(err) => {
                warn!("{node}: could not boot the erase environment: {err}");
                let mut failed = self.node(system_id)?;
                failed.status = NodeStatus::FailedDiskErasing;
                self.store.save_node(failed)?;
                Err(err)
            }
        }
    }

    /// Abort an in-progress erase. The target is FAILED_DISK_ERASING, not
    /// the pre-erase status: a partially-erased disk set is not something
    /// to silently hand back.
    pub async fn abort_disk_erasing(
        &self,
        system_id: &str,
        requester: &Requester,
    ) -> Result<NodeRecord> {
        self.abort_to(
            system_id,
            requester,
            NodeStatus::DiskErasing,
            NodeStatus::FailedDiskErasing,
            EventKind::RequestAbortEraseDisk,
        )
        .await
    }
}
