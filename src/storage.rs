// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! A deliberately small model of a node's storage: just enough structure
//! to validate a deployment (root and /boot mounts, bcache rules) and to
//! support the acquired-filesystem layer that release discards.

use serde::{Deserialize, Serialize};

use crate::node::NodeRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsType {
    Ext4,
    Xfs,
    Btrfs,
    Fat32,
    Swap,
    BcacheCache,
    BcacheBacking,
}

impl FsType {
    /// Whether a user can mount this filesystem type (cache and backing
    /// volumes exist only to compose a bcache device).
    pub fn user_mountable(self) -> bool {
        !matches!(self, FsType::BcacheCache | FsType::BcacheBacking)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filesystem {
    pub fstype: FsType,
    pub mount_point: Option<String>,
    /// Acquired filesystems are the allocation-time copy of the layout;
    /// they are discarded on release, leaving the commissioned layout.
    pub acquired: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    pub filesystem: Option<Filesystem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    pub name: String,
    pub boot_disk: bool,
    /// A virtual device layered on a bcache volume. The deploy validator
    /// refuses to boot from such a device.
    pub on_bcache: bool,
    pub partitions: Vec<Partition>,
    pub filesystem: Option<Filesystem>,
}

impl BlockDevice {
    pub fn new(name: &str) -> Self {
        BlockDevice {
            name: name.to_string(),
            boot_disk: false,
            on_bcache: false,
            partitions: Vec::new(),
            filesystem: None,
        }
    }

    fn filesystems(&self) -> impl Iterator<Item = &Filesystem> {
        self.filesystem
            .iter()
            .chain(self.partitions.iter().filter_map(|p| p.filesystem.as_ref()))
    }

    fn filesystems_mut(&mut self) -> impl Iterator<Item = &mut Filesystem> {
        self.filesystem
            .iter_mut()
            .chain(
                self.partitions
                    .iter_mut()
                    .filter_map(|p| p.filesystem.as_mut()),
            )
    }
}

/// Return the problems that would prevent deploying this node's current
/// storage layout. An empty list means the layout is deployable.
///
/// Rules: a storage device must exist; `/` must be mounted; when `/` sits
/// on a bcache volume a separate non-bcache `/boot` is mandatory; arm64
/// machines need a dedicated `/boot` unless they boot via UEFI.
pub fn layout_issues(node: &NodeRecord) -> Vec<String> {
    let mut has_boot_disk = false;
    let mut root_mounted = false;
    let mut root_on_bcache = false;
    let mut boot_mounted = false;

    for device in &node.block_devices {
        if device.boot_disk {
            has_boot_disk = true;
        }
        for fs in device.filesystems() {
            match fs.mount_point.as_deref() {
                Some("/") => {
                    root_mounted = true;
                    if device.on_bcache {
                        root_on_bcache = true;
                    }
                }
                Some("/boot") if !device.on_bcache => {
                    boot_mounted = true;
                }
                _ => {}
            }
        }
    }

    let mut issues = Vec::new();
    if !has_boot_disk {
        issues.push("Specify a storage device to be able to deploy this node.".to_string());
    }
    if !root_mounted {
        issues.push(
            "Mount the root '/' filesystem to be able to deploy this node.".to_string(),
        );
    }
    if root_mounted && root_on_bcache && !boot_mounted {
        issues.push(
            "This node cannot be deployed because it cannot boot from a bcache volume. \
             Mount /boot on a non-bcache device to be able to deploy this node."
                .to_string(),
        );
    }
    let (arch, _) = node.split_arch();
    if !boot_mounted && arch == "arm64" && node.bios_boot_method != "uefi" {
        issues.push(
            "This node cannot be deployed because it needs a separate /boot partition. \
             Mount /boot on a device to be able to deploy this node."
                .to_string(),
        );
    }
    issues
}

/// Copy every user-mountable filesystem into the acquired layer. From this
/// point until release, mutations apply to the copies; releasing discards
/// them, restoring the commissioned layout untouched.
pub fn create_acquired_filesystems(node: &mut NodeRecord) {
    clear_acquired_filesystems(node);
    for device in &mut node.block_devices {
        let acquired: Vec<Filesystem> = device
            .filesystems()
            .filter(|fs| fs.fstype.user_mountable() && !fs.acquired)
            .map(|fs| Filesystem {
                acquired: true,
                ..fs.clone()
            })
            .collect();
        // The acquired copies live beside the originals on the same
        // device; only one layer is ever active at a time.
        for fs in acquired {
            device.partitions.push(Partition {
                name: format!("{}-acquired", device.name),
                filesystem: Some(fs),
            });
        }
    }
}

/// Drop the acquired filesystem layer.
pub fn clear_acquired_filesystems(node: &mut NodeRecord) {
    for device in &mut node.block_devices {
        device
            .partitions
            .retain(|p| !matches!(&p.filesystem, Some(fs) if fs.acquired));
        if matches!(&device.filesystem, Some(fs) if fs.acquired) {
            device.filesystem = None;
        }
    }
}

/// Clear the full storage configuration ahead of commissioning: partition
/// tables and filesystems go, the physical devices stay (commissioning
/// rediscovers them).
pub fn clear_full_configuration(node: &mut NodeRecord) {
    for device in &mut node.block_devices {
        device.partitions.clear();
        device.filesystem = None;
    }
    node.block_devices.retain(|d| !d.on_bcache);
}

/// True when any filesystem, acquired or not, is mounted at `mount_point`.
pub fn has_mount(node: &NodeRecord, mount_point: &str) -> bool {
    node.block_devices.iter().any(|device| {
        device
            .filesystems()
            .any(|fs| fs.mount_point.as_deref() == Some(mount_point))
    })
}

/// Unmount everything in the acquired layer (used by tests and erase).
pub fn unmount_acquired(node: &mut NodeRecord) {
    for device in &mut node.block_devices {
        for fs in device.filesystems_mut() {
            if fs.acquired {
                fs.mount_point = None;
            }
        }
    }
}
