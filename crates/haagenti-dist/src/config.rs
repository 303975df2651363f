//! Launch configuration

use crate::{DistError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Global rank, read when the config leaves `rank` unset
pub const RANK_ENV: &str = "RANK";
/// World size, read when the config leaves `world_size` unset
pub const WORLD_SIZE_ENV: &str = "WORLD_SIZE";
/// Local rank, read when neither the config nor a hint provides one
pub const LOCAL_RANK_ENV: &str = "LOCAL_RANK";
/// Rendezvous host override
pub const MASTER_ADDR_ENV: &str = "MASTER_ADDR";
/// Rendezvous port override
pub const MASTER_PORT_ENV: &str = "MASTER_PORT";

/// Default rendezvous host
pub const DEFAULT_MASTER_ADDR: &str = "0.0.0.0";
/// Default rendezvous port
pub const DEFAULT_MASTER_PORT: u16 = 2222;
/// Default rendezvous timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Launch configuration for `initialize` and `spawn`.
///
/// Native backends read every field. Pod backends only accept the
/// single-node defaults for `num_nodes` / `node_rank` and ignore the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Number of nodes taking part
    pub num_nodes: usize,
    /// Index of this node
    pub node_rank: usize,
    /// Rendezvous host (rank 0 binds it, others connect)
    pub master_addr: String,
    /// Rendezvous port
    pub master_port: u16,
    /// Rendezvous timeout
    pub timeout: Duration,
    /// Explicit global rank
    pub rank: Option<usize>,
    /// Explicit world size
    pub world_size: Option<usize>,
    /// Explicit local rank
    pub local_rank: Option<usize>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            num_nodes: 1,
            node_rank: 0,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
            timeout: DEFAULT_TIMEOUT,
            rank: None,
            world_size: None,
            local_rank: None,
        }
    }
}

impl LaunchConfig {
    /// Build from torchrun-style environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(MASTER_ADDR_ENV) {
            config.master_addr = addr;
        }
        if let Some(port) = env_parse(MASTER_PORT_ENV)? {
            config.master_port = port;
        }
        config.rank = env_parse(RANK_ENV)?;
        config.world_size = env_parse(WORLD_SIZE_ENV)?;
        config.local_rank = env_parse(LOCAL_RANK_ENV)?;
        Ok(config)
    }

    /// Set number of nodes
    pub fn with_num_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    /// Set node rank
    pub fn with_node_rank(mut self, node_rank: usize) -> Self {
        self.node_rank = node_rank;
        self
    }

    /// Set rendezvous host
    pub fn with_master_addr(mut self, addr: impl Into<String>) -> Self {
        self.master_addr = addr.into();
        self
    }

    /// Set rendezvous port
    pub fn with_master_port(mut self, port: u16) -> Self {
        self.master_port = port;
        self
    }

    /// Set rendezvous timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set global rank
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = Some(rank);
        self
    }

    /// Set world size
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.world_size = Some(world_size);
        self
    }

    /// Set local rank
    pub fn with_local_rank(mut self, local_rank: usize) -> Self {
        self.local_rank = Some(local_rank);
        self
    }

    /// Check node layout and timeout
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(DistError::InvalidConfig("num_nodes must be >= 1".into()));
        }
        if self.node_rank >= self.num_nodes {
            return Err(DistError::InvalidConfig(format!(
                "node_rank {} must be < num_nodes {}",
                self.node_rank, self.num_nodes
            )));
        }
        if self.timeout.is_zero() {
            return Err(DistError::InvalidConfig("timeout must be positive".into()));
        }
        Ok(())
    }

    /// Config seen by worker `local_rank` of a `spawn` on this node
    pub fn for_worker(&self, local_rank: usize, num_procs_per_node: usize) -> Self {
        Self {
            rank: Some(self.node_rank * num_procs_per_node + local_rank),
            world_size: Some(self.num_nodes * num_procs_per_node),
            local_rank: Some(local_rank),
            ..self.clone()
        }
    }

    /// Rank, world size and local rank: config first, then environment, then `0 / 1 / 0`
    pub(crate) fn resolve_ranks(&self) -> Result<(usize, usize, usize)> {
        let rank = match self.rank {
            Some(rank) => rank,
            None => env_parse(RANK_ENV)?.unwrap_or(0),
        };
        let world_size = match self.world_size {
            Some(ws) => ws,
            None => env_parse(WORLD_SIZE_ENV)?.unwrap_or(1),
        };
        let local_rank = match self.local_rank {
            Some(lr) => lr,
            None => env_parse(LOCAL_RANK_ENV)?.unwrap_or(0),
        };

        if world_size == 0 {
            return Err(DistError::InvalidConfig("world_size must be >= 1".into()));
        }
        if rank >= world_size {
            return Err(DistError::InvalidConfig(format!(
                "rank {} must be < world_size {}",
                rank, world_size
            )));
        }
        Ok((rank, world_size, local_rank))
    }

    /// Rendezvous endpoint; environment overrides fields left at their defaults
    pub(crate) fn resolve_endpoint(&self) -> Result<(String, u16)> {
        let addr = match std::env::var(MASTER_ADDR_ENV) {
            Ok(env_addr) if self.master_addr == DEFAULT_MASTER_ADDR => env_addr,
            _ => self.master_addr.clone(),
        };
        let port = match env_parse(MASTER_PORT_ENV)? {
            Some(env_port) if self.master_port == DEFAULT_MASTER_PORT => env_port,
            _ => self.master_port,
        };
        Ok((addr, port))
    }
}

/// Parse an optional environment variable
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            DistError::InvalidConfig(format!("{} has an invalid value '{}'", name, raw))
        }),
        Err(_) => Ok(None),
    }
}
