// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Errors surfaced by the lifecycle and power-control core.
//!
//! The taxonomy matters to callers: validation and state-violation errors
//! are synchronous and final (never retried), permission errors are an
//! access problem rather than a validation problem, and connectivity
//! errors are asynchronous failures that the issuing workflow has already
//! compensated for before re-raising.

use thiserror::Error;

use crate::agent::AgentError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested status change is not an edge in the transition table.
    #[error("{0}")]
    StateViolation(String),

    /// The requester does not hold edit capability on the node.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The node's power type is unconfigured where a configured type is
    /// required (commissioning, rescue-mode entry).
    #[error("{0}")]
    UnknownPowerType(String),

    /// Power control is impossible: no BMC, or no rack controller can
    /// reach the BMC's management address.
    #[error("{0}")]
    PowerProblem(String),

    /// The chosen rack agent is missing the driver software for the
    /// node's power type.
    #[error(
        "Power control software is missing from the rack controller {rack}. \
         To proceed, install the {package_list} package{plural}."
    )]
    MissingPackages {
        rack: String,
        package_list: String,
        plural: &'static str,
    },

    /// One or more preconditions for the requested operation are unmet.
    /// Each entry is a (category, message) pair, e.g. ("storage", ...).
    #[error("validation failed: {}", format_violations(.0))]
    Validation(Vec<(String, String)>),

    /// A row violates a unique constraint in the persistence collaborator.
    #[error("duplicate {entity}: {value}")]
    Duplicate { entity: &'static str, value: String },

    /// A referenced row does not exist.
    #[error("no such {entity}: {value}")]
    NotFound { entity: &'static str, value: String },

    /// A topology report contained something unintelligible; the whole
    /// batch is aborted.
    #[error("{0}")]
    BadReport(String),

    /// Communication with a rack agent failed.
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl Error {
    /// Build the missing-driver-packages error, joining the sorted package
    /// names with commas and a final "and", the way an admin would write
    /// the sentence.
    pub fn missing_packages(rack: &str, mut packages: Vec<String>) -> Self {
        packages.sort();
        let plural = if packages.len() > 1 { "s" } else { "" };
        let package_list = match packages.len() {
            0 | 1 => packages.join(""),
            2 => packages.join(" and "),
            n => format!("{} and {}", packages[..n - 1].join(", "), packages[n - 1]),
        };
        Error::MissingPackages {
            rack: rack.to_string(),
            package_list,
            plural,
        }
    }
}

fn format_violations(violations: &[(String, String)]) -> String {
    violations
        .iter()
        .map(|(category, message)| format!("{category}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_packages_joins_names() {
        let err = Error::missing_packages(
            "rack01",
            vec!["freeipmi".to_string(), "ipmitool".to_string(), "wsmancli".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "Power control software is missing from the rack controller rack01. \
             To proceed, install the freeipmi, ipmitool and wsmancli packages."
        );
    }

    #[test]
    fn missing_packages_single() {
        let err = Error::missing_packages("rack01", vec!["ipmitool".to_string()]);
        assert_eq!(
            err.to_string(),
            "Power control software is missing from the rack controller rack01. \
             To proceed, install the ipmitool package."
        );
    }
}
