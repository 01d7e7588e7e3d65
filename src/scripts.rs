// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Script sets are opaque handles to batches of commissioning or
//! installation scripts run against a node. Their content and execution
//! are another subsystem's concern; the lifecycle core only creates,
//! attaches, and deletes them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::node::ScriptSetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptSetKind {
    Commissioning,
    Installation,
}

pub trait ScriptSetFactory: Send + Sync {
    fn create(&self, system_id: &str, kind: ScriptSetKind) -> ScriptSetId;
    fn delete(&self, id: ScriptSetId);
    fn exists(&self, id: ScriptSetId) -> bool;
}

/// In-memory factory, sufficient for the core and its tests.
#[derive(Default)]
pub struct SimpleScriptSets {
    next_id: AtomicU64,
    live: Mutex<Vec<ScriptSetId>>,
}

impl ScriptSetFactory for SimpleScriptSets {
    fn create(&self, _system_id: &str, _kind: ScriptSetKind) -> ScriptSetId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().unwrap().push(id);
        id
    }

    fn delete(&self, id: ScriptSetId) {
        self.live.lock().unwrap().retain(|&live| live != id);
    }

    fn exists(&self, id: ScriptSetId) -> bool {
        self.live.lock().unwrap().contains(&id)
    }
}
