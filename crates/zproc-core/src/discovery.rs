//! Endpoint discovery.
//!
//! A server binds two loopback TCP listeners and advertises their addresses
//! through a pair of environment variables inherited by spawned workers. The
//! variables are written once, at server start; a proxy constructed in any
//! child process discovers the server with [`Endpoints::from_env`].

use crate::config::ProtocolConfig;
use crate::error::{Result, ZprocError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// The pair of addresses a running server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    /// Request/reply channel.
    pub server_addr: SocketAddr,
    /// Change-event publish channel.
    pub events_addr: SocketAddr,
}

impl Endpoints {
    /// Read endpoints from the inherited environment.
    ///
    /// Fails with [`ZprocError::NotConfigured`] when either variable is
    /// missing or unparsable, naming the offending variable.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            server_addr: addr_from_env(ProtocolConfig::SERVER_ADDR_ENV)?,
            events_addr: addr_from_env(ProtocolConfig::EVENTS_ADDR_ENV)?,
        })
    }

    /// Export this pair into the current process environment, to be
    /// inherited by spawned workers. Call once, at server start.
    pub fn export_env(&self) {
        std::env::set_var(ProtocolConfig::SERVER_ADDR_ENV, self.server_addr.to_string());
        std::env::set_var(ProtocolConfig::EVENTS_ADDR_ENV, self.events_addr.to_string());
    }
}

fn addr_from_env(variable: &str) -> Result<SocketAddr> {
    let raw = std::env::var(variable).map_err(|_| ZprocError::NotConfigured {
        variable: variable.to_string(),
    })?;
    raw.parse().map_err(|_| ZprocError::NotConfigured {
        variable: variable.to_string(),
    })
}
