// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The node provisioning state machine: the status enum, the static table
//! of allowed transitions, and the status bands the workflows consult.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every state a node can occupy over its provisioning lifetime. A node
/// starts out `New` and cycles through these until it is deleted; there is
/// no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeStatus {
    New,
    Commissioning,
    FailedCommissioning,
    Ready,
    Reserved,
    Allocated,
    Deploying,
    Deployed,
    FailedDeployment,
    Releasing,
    FailedReleasing,
    DiskErasing,
    FailedDiskErasing,
    Broken,
    EnteringRescueMode,
    RescueMode,
    ExitingRescueMode,
    FailedEnteringRescueMode,
    FailedExitingRescueMode,
}

use NodeStatus::*;

impl NodeStatus {
    /// The statically-allowed successor set for this status.
    pub fn successors(self) -> &'static [NodeStatus] {
        match self {
            New => &[Commissioning, Ready, Broken],
            Commissioning => &[New, Ready, FailedCommissioning, Broken],
            FailedCommissioning => &[Commissioning, Broken],
            Ready => &[Allocated, Reserved, Broken],
            Reserved => &[Ready, Allocated, Releasing, Broken],
            Allocated => &[Ready, Deploying, Releasing, DiskErasing, Broken],
            Deploying => &[
                Allocated,
                Ready,
                Deployed,
                FailedDeployment,
                Releasing,
                Broken,
            ],
            Deployed => &[Allocated, Releasing, DiskErasing, Broken, EnteringRescueMode],
            FailedDeployment => &[
                Allocated,
                Ready,
                Commissioning,
                Deploying,
                Releasing,
                Broken,
            ],
            Releasing => &[Ready, FailedReleasing, Broken],
            FailedReleasing => &[Releasing, Broken],
            DiskErasing => &[FailedDiskErasing, Releasing],
            FailedDiskErasing => &[DiskErasing, Releasing, Broken],
            Broken => &[Commissioning, Ready, Releasing, EnteringRescueMode],
            EnteringRescueMode => &[
                RescueMode,
                FailedEnteringRescueMode,
                Broken,
                Deployed,
            ],
            FailedEnteringRescueMode => &[EnteringRescueMode, Broken, Deployed],
            RescueMode => &[ExitingRescueMode, Broken, Deployed],
            ExitingRescueMode => &[
                RescueMode,
                FailedExitingRescueMode,
                Broken,
                Deployed,
            ],
            FailedExitingRescueMode => &[ExitingRescueMode, Broken, Deployed],
        }
    }

    /// Whether a monitoring deadline applies while a node sits in this
    /// status. Saving a node in any other status always clears the
    /// deadline, even if a caller set one, so that a stale deadline cannot
    /// fail a node that has since moved on.
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            Commissioning | Deploying | Releasing | EnteringRescueMode
        )
    }

    /// The statuses from which a node can be released.
    pub fn is_releasable(self) -> bool {
        matches!(
            self,
            Allocated
                | Reserved
                | Broken
                | Deploying
                | Deployed
                | FailedDeployment
                | Releasing
                | FailedDiskErasing
                | FailedReleasing
        )
    }

    /// The "owned" band: statuses during which the node belongs to a user.
    pub fn is_owned(self) -> bool {
        matches!(
            self,
            Allocated
                | Deploying
                | Deployed
                | FailedDeployment
                | Releasing
                | FailedReleasing
                | DiskErasing
                | FailedDiskErasing
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            FailedCommissioning
                | FailedDeployment
                | FailedReleasing
                | FailedDiskErasing
                | FailedEnteringRescueMode
                | FailedExitingRescueMode
        )
    }

    /// The failed counterpart of an in-progress status, if one exists.
    pub fn failed_counterpart(self) -> Option<NodeStatus> {
        match self {
            Commissioning => Some(FailedCommissioning),
            Deploying => Some(FailedDeployment),
            Releasing => Some(FailedReleasing),
            DiskErasing => Some(FailedDiskErasing),
            EnteringRescueMode => Some(FailedEnteringRescueMode),
            ExitingRescueMode => Some(FailedExitingRescueMode),
            _ => None,
        }
    }
}

/// Check a proposed status change against the transition table. A
/// self-transition is always a safe transition.
pub fn is_transition_allowed(from: NodeStatus, to: NodeStatus) -> bool {
    from == to || from.successors().contains(&to)
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "{}",
            match self {
                New => "New",
                Commissioning => "Commissioning",
                FailedCommissioning => "Failed commissioning",
                Ready => "Ready",
                Reserved => "Reserved",
                Allocated => "Allocated",
                Deploying => "Deploying",
                Deployed => "Deployed",
                FailedDeployment => "Failed deployment",
                Releasing => "Releasing",
                FailedReleasing => "Releasing failed",
                DiskErasing => "Disk erasing",
                FailedDiskErasing => "Failed disk erasing",
                Broken => "Broken",
                EnteringRescueMode => "Entering rescue mode",
                RescueMode => "Rescue mode",
                ExitingRescueMode => "Exiting rescue mode",
                FailedEnteringRescueMode => "Failed to enter rescue mode",
                FailedExitingRescueMode => "Failed to exit rescue mode",
            }
        )
    }
}

pub const ALL_STATUSES: [NodeStatus; 19] = [
    New,
    Commissioning,
    FailedCommissioning,
    Ready,
    Reserved,
    Allocated,
    Deploying,
    Deployed,
    FailedDeployment,
    Releasing,
    FailedReleasing,
    DiskErasing,
    FailedDiskErasing,
    Broken,
    EnteringRescueMode,
    RescueMode,
    ExitingRescueMode,
    FailedEnteringRescueMode,
    FailedExitingRescueMode,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_transition_always_allowed() {
        for status in ALL_STATUSES {
            assert!(is_transition_allowed(status, status));
        }
    }

    #[test]
    fn every_failed_counterpart_is_a_valid_edge() {
        for status in ALL_STATUSES {
            if let Some(failed) = status.failed_counterpart() {
                assert!(
                    is_transition_allowed(status, failed),
                    "{status} -> {failed} should be allowed"
                );
            }
        }
    }

    #[test]
    fn ready_cannot_jump_to_deployed() {
        assert!(!is_transition_allowed(Ready, Deployed));
        assert!(!is_transition_allowed(New, Deploying));
    }
}
