// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod network;
pub mod node;
pub mod power;
pub mod scripts;
pub mod status;
pub mod storage;
pub mod store;
pub mod test_env;
pub mod workflows;

/// Gets the path of the global configuration file.
pub fn default_config_path() -> String {
    match std::env::var("ANVIL_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/anvil/anvil.conf".to_string(),
    }
}

/// Gets the RPC timeout, in seconds, for a single call to a rack agent.
pub fn agent_call_timeout() -> u64 {
    match std::env::var("ANVIL_AGENT_TIMEOUT") {
        Ok(secs) => secs
            .parse::<u64>()
            .expect("ANVIL_AGENT_TIMEOUT must be a number of seconds"),
        Err(_) => 15,
    }
}

/// Gets the timeout, in seconds, for the broadcast power query that
/// rediscovers which rack agents can route to a BMC.
pub fn agent_broadcast_timeout() -> u64 {
    match std::env::var("ANVIL_BROADCAST_TIMEOUT") {
        Ok(secs) => secs
            .parse::<u64>()
            .expect("ANVIL_BROADCAST_TIMEOUT must be a number of seconds"),
        Err(_) => 30,
    }
}
