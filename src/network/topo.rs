// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Dependency ordering for topology reports. Parents must be processed
//! before the bonds, bridges, and vlan sub-interfaces stacked on them,
//! and deleted after them.

use std::collections::{BTreeMap, BTreeSet};

use log::warn;

use super::TopologyReport;

/// Order the report's interface names so every parent precedes its
/// children. Ties are broken by name, so the same report always yields
/// the same order.
///
/// A report naming a parent that does not exist, or containing a parent
/// cycle, is the agent's bug, not a reason to drop the whole report: the
/// offending edges are discarded with a warning and ordering proceeds
/// without them.
pub fn dependency_order(report: &TopologyReport) -> Vec<String> {
    // parents[c] = set of names c waits on; children[p] = who waits on p.
    let mut parents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut children: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (name, iface) in &report.interfaces {
        let entry = parents.entry(name.as_str()).or_default();
        for parent in &iface.parents {
            if !report.interfaces.contains_key(parent) {
                warn!("interface {name} names unknown parent {parent}; ignoring the edge");
                continue;
            }
            entry.insert(parent.as_str());
            children.entry(parent.as_str()).or_default().insert(name);
        }
    }

    let mut order = Vec::with_capacity(report.interfaces.len());
    while !parents.is_empty() {
        let ready: Vec<&str> = parents
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(&name, _)| name)
            .collect();
        if ready.is_empty() {
            // Parent cycle. Cut the remaining edges of the first stuck
            // interface and resume.
            let (&stuck, deps) = parents
                .iter_mut()
                .next()
                .unwrap_or_else(|| unreachable!("non-empty map"));
            warn!(
                "parent cycle involving {stuck} (waiting on {:?}); dropping its edges",
                deps
            );
            deps.clear();
            continue;
        }
        for name in ready {
            order.push(name.to_string());
            parents.remove(name);
            if let Some(kids) = children.remove(name) {
                for kid in kids {
                    if let Some(deps) = parents.get_mut(kid) {
                        deps.remove(name);
                    }
                }
            }
        }
    }
    order
}
