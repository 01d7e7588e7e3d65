// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Audit event recording. Fire-and-forget: a failing sink must never fail
//! the workflow that emitted the event.

use std::fmt;
use std::sync::Mutex;

use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RequestStartCommissioning,
    RequestAbortCommissioning,
    RequestAbortDeployment,
    RequestAbortEraseDisk,
    RequestAcquire,
    RequestStart,
    RequestStartDeployment,
    RequestStop,
    RequestRelease,
    RequestEraseDisk,
    RequestMarkFailed,
    RequestMarkFailedSystem,
    RequestMarkBroken,
    RequestMarkFixed,
    RequestStartRescueMode,
    RequestStopRescueMode,
    PowerQueried,
    PowerQueryFailed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub system_id: String,
    pub kind: EventKind,
    pub action: String,
    pub description: String,
}

pub trait EventLog: Send + Sync {
    fn record(&self, event: Event);
}

/// The default sink: events go to the service log.
pub struct LogEventSink;

impl EventLog for LogEventSink {
    fn record(&self, event: Event) {
        info!(
            "{}: {} ({}) {}",
            event.system_id, event.kind, event.action, event.description
        );
    }
}

/// A sink that remembers everything, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl EventLog for RecordingEventSink {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}
