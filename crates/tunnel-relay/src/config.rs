use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::flow_table::DEFAULT_CAPACITY;
use crate::protect::{NoopProtector, SocketProtector};

pub const ENV_MAX_TCP_FLOWS: &str = "TUNNEL_RELAY_MAX_TCP_FLOWS";
pub const ENV_MAX_UDP_FLOWS: &str = "TUNNEL_RELAY_MAX_UDP_FLOWS";

#[derive(Clone)]
pub struct RelayConfig {
    pub max_tcp_flows: NonZeroUsize,
    pub max_udp_flows: NonZeroUsize,
    /// Applied to every outbound socket before it connects.
    pub protector: Arc<dyn SocketProtector>,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            max_tcp_flows: read_capacity(&lookup, ENV_MAX_TCP_FLOWS)?,
            max_udp_flows: read_capacity(&lookup, ENV_MAX_UDP_FLOWS)?,
            ..Self::default()
        })
    }

    pub fn with_protector(mut self, protector: Arc<dyn SocketProtector>) -> Self {
        self.protector = protector;
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        let capacity = NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_tcp_flows: capacity,
            max_udp_flows: capacity,
            protector: Arc::new(NoopProtector),
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("max_tcp_flows", &self.max_tcp_flows)
            .field("max_udp_flows", &self.max_udp_flows)
            .finish_non_exhaustive()
    }
}

fn read_capacity(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<NonZeroUsize, ConfigError> {
    match lookup(name) {
        None => Ok(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
        Some(raw) => raw
            .trim()
            .parse::<NonZeroUsize>()
            .map_err(|_| ConfigError::InvalidEnv(name)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}
