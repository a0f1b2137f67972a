// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration consumed by the scheduler and the listener.

use std::fmt::Display;
use std::net::SocketAddr;

/// How new connections are distributed across workers.
///
/// The mode is a static property of a running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerMode {
    /// A singular accept socket; the balancer picks the worker with the
    /// fewest live connections for each accepted fd.
    FairBalancing,
    /// One listening socket per worker bound to the same address with
    /// SO_REUSEPORT; the kernel distributes accepts and no balancer code
    /// runs per connection.
    ReusePort,
}

/// Configuration surface of the server core.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listening socket(s) bind to.
    pub listen: SocketAddr,
    /// Listen backlog handed to the kernel.
    pub backlog: i32,
    /// Number of worker threads.
    pub workers: usize,
    /// Maximum live connections across the whole server.
    pub server_capacity: usize,
    /// Seconds a connection may sit on an incomplete request.
    pub timeout: u64,
    /// Seconds an idle keep-alive connection is retained.
    pub keep_alive_timeout: u64,
    /// Balancing mode.
    pub scheduler_mode: SchedulerMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 2001)),
            backlog: 1024,
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            server_capacity: 1024,
            timeout: 15,
            keep_alive_timeout: 15,
            scheduler_mode: SchedulerMode::FairBalancing,
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The worker count is zero.
    NoWorkers,
    /// The server capacity is below the worker count, leaving at least one
    /// worker with a zero-connection share.
    CapacityBelowWorkers,
    /// A timeout of zero would reap connections on the first sweep.
    ZeroTimeout,
}

impl ConfigError {
    fn description_str(&self) -> &'static str {
        match *self {
            ConfigError::NoWorkers => "worker count must be at least 1",
            ConfigError::CapacityBelowWorkers => "server capacity below worker count",
            ConfigError::ZeroTimeout => "timeouts must be at least 1 second",
        }
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Checks the configuration before any socket or thread is created.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.server_capacity < self.workers {
            return Err(ConfigError::CapacityBelowWorkers);
        }
        if self.timeout == 0 || self.keep_alive_timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Live-connection ceiling a single worker enforces.
    ///
    /// In fair mode each worker gets an equal share of the server capacity.
    /// In kernel-balanced mode every worker runs against the full figure and
    /// the collective ceiling is approximate.
    pub fn worker_capacity(&self) -> u64 {
        match self.scheduler_mode {
            SchedulerMode::FairBalancing => (self.server_capacity / self.workers) as u64,
            SchedulerMode::ReusePort => self.server_capacity as u64,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{ConfigError, SchedulerMode, ServerConfig};

    #[test]
    fn default_config_validates() {
        assert_eq!(Ok(()), ServerConfig::default().validate());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert_eq!(Err(ConfigError::NoWorkers), config.validate());
    }

    #[test]
    fn capacity_below_workers_rejected() {
        let config = ServerConfig {
            workers: 8,
            server_capacity: 4,
            ..ServerConfig::default()
        };
        assert_eq!(Err(ConfigError::CapacityBelowWorkers), config.validate());
    }

    #[test]
    fn zero_timeout_rejected() {
        let config = ServerConfig {
            keep_alive_timeout: 0,
            ..ServerConfig::default()
        };
        assert_eq!(Err(ConfigError::ZeroTimeout), config.validate());
    }

    #[test]
    fn fair_mode_splits_capacity_across_workers() {
        let config = ServerConfig {
            workers: 2,
            server_capacity: 4,
            scheduler_mode: SchedulerMode::FairBalancing,
            ..ServerConfig::default()
        };
        assert_eq!(2, config.worker_capacity());
    }

    #[test]
    fn reuseport_mode_keeps_full_capacity_per_worker() {
        let config = ServerConfig {
            workers: 2,
            server_capacity: 4,
            scheduler_mode: SchedulerMode::ReusePort,
            ..ServerConfig::default()
        };
        assert_eq!(4, config.worker_capacity());
    }
}
