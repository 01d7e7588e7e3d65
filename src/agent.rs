// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! The seam to the rack-controller agents. The region only ever sees a
//! connector that yields clients by identifier, and clients that answer a
//! handful of typed calls. The transport behind the seam (connection
//! pooling, retries at the wire level, authentication) is someone else's
//! problem.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Duration;

use async_trait::async_trait;

use crate::node::PowerState;

/// A reply from a remote agent, indicating that the operation was
/// attempted. Note that receiving a reply does *not* mean the operation
/// succeeded: an error that occurred on the remote side while attempting
/// it is carried in the `Failed` variant. A transport-level failure, where
/// it is unknown whether the operation was even attempted, surfaces as an
/// `AgentError` instead.
#[derive(Debug)]
pub enum AgentReply {
    Success(PowerState),
    Failed(String),
}

#[derive(Debug)]
pub enum AgentError {
    /// No live connection could be obtained for any of the identifiers.
    ConnectionUnavailable,

    /// An IO error occurred while trying to send/receive.
    Io(io::Error),

    /// The agent did not answer within the bounded wait.
    Timeout { ident: String, after: Duration },
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        match self {
            AgentError::ConnectionUnavailable => {
                write!(f, "no connection available to any rack controller")
            }
            AgentError::Io(e) => write!(f, "agent communication failed: {e}"),
            AgentError::Timeout { ident, after } => write!(
                f,
                "rack controller {ident} did not answer within {}s",
                after.as_secs()
            ),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<io::Error> for AgentError {
    fn from(e: io::Error) -> Self {
        AgentError::Io(e)
    }
}

/// Power parameters sent along with a power command, already merged and
/// defaulted by the orchestrator.
pub type PowerParams = BTreeMap<String, String>;

/// A live request/response channel to one rack agent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// The identifier this client is connected to (a rack system id).
    fn ident(&self) -> &str;

    async fn power_on(
        &self,
        system_id: &str,
        hostname: &str,
        power_type: &str,
        params: &PowerParams,
    ) -> Result<AgentReply, AgentError>;

    async fn power_off(
        &self,
        system_id: &str,
        hostname: &str,
        power_type: &str,
        params: &PowerParams,
    ) -> Result<AgentReply, AgentError>;

    async fn power_cycle(
        &self,
        system_id: &str,
        hostname: &str,
        power_type: &str,
        params: &PowerParams,
    ) -> Result<AgentReply, AgentError>;

    async fn power_query(
        &self,
        system_id: &str,
        hostname: &str,
        power_type: &str,
        params: &PowerParams,
    ) -> Result<AgentReply, AgentError>;

    /// Report which driver packages for `power_type` are absent from this
    /// agent's host. Empty means the driver is fully operable there.
    async fn missing_power_packages(
        &self,
        power_type: &str,
    ) -> Result<Vec<String>, AgentError>;
}

/// Hands out clients for rack agents by identifier. Implementations wrap
/// whatever connection pool the transport maintains.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    /// Obtain a live client for any one of `idents`, trying them in
    /// order. `ConnectionUnavailable` when none can be reached.
    async fn connect(
        &self,
        idents: &[String],
    ) -> Result<Box<dyn AgentClient>, AgentError>;

    /// All rack identifiers currently known to the connector, used for
    /// broadcast routability rediscovery.
    async fn all_rack_idents(&self) -> Vec<String>;
}

/// Await an agent call with the standard bounded wait; exceeding it is a
/// connectivity error, never treated as success.
pub async fn bounded<T>(
    ident: &str,
    secs: u64,
    fut: impl std::future::Future<Output = Result<T, AgentError>> + Send,
) -> Result<T, AgentError> {
    let wait = Duration::from_secs(secs);
    match tokio::time::timeout(wait, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::Timeout {
            ident: ident.to_string(),
            after: wait,
        }),
    }
}
