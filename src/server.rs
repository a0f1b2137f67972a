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

//! Process-edge facade: bind, start the scheduler, run the accept path.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;
use mio::Waker;

use crate::clock::Clock;
use crate::config::{SchedulerMode, ServerConfig};
use crate::listener::{self, Acceptor};
use crate::plugin::PluginRegistry;
use crate::scheduler::Scheduler;

/// A running server: the scheduler plus, in fair mode, the acceptor thread.
#[derive(Debug)]
pub struct Server {
    scheduler: Arc<Scheduler>,
    clock: Arc<Clock>,
    local_addr: SocketAddr,
    accepting: Arc<AtomicBool>,
    acceptor_waker: Option<Arc<Waker>>,
    acceptor: Option<JoinHandle<()>>,
}

impl Server {
    /// Validates the configuration, starts the workers, and begins
    /// accepting connections.
    pub fn start(config: ServerConfig, plugins: PluginRegistry) -> io::Result<Server> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut config = config;
        let clock = Arc::new(Clock::new());
        clock.refresh();

        match config.scheduler_mode {
            SchedulerMode::FairBalancing => {
                let listener = listener::bind_listener(config.listen, config.backlog, false)?;
                let local_addr = listener.local_addr()?;
                config.listen = local_addr;
                let config = Arc::new(config);

                let scheduler = Arc::new(Scheduler::start(config, &plugins, clock.clone())?);
                let accepting = Arc::new(AtomicBool::new(true));
                let mut acceptor = Acceptor::new(listener, scheduler.clone(), accepting.clone())?;
                let waker = acceptor.waker();
                let handle = thread::Builder::new()
                    .name("acceptor".into())
                    .spawn(move || acceptor.run())?;

                debug!("server: listening on {} (fair balancing)", local_addr);
                Ok(Server {
                    scheduler,
                    clock,
                    local_addr,
                    accepting,
                    acceptor_waker: Some(waker),
                    acceptor: Some(handle),
                })
            }
            SchedulerMode::ReusePort => {
                // resolve an ephemeral port once so every worker binds the
                // same address; the probe stays open until the workers have
                // bound their own sockets
                let probe = listener::bind_listener(config.listen, config.backlog, true)?;
                let local_addr = probe.local_addr()?;
                config.listen = local_addr;
                let config = Arc::new(config);

                let scheduler = Arc::new(Scheduler::start(config, &plugins, clock.clone())?);
                drop(probe);

                debug!("server: listening on {} (kernel balanced)", local_addr);
                Ok(Server {
                    scheduler,
                    clock,
                    local_addr,
                    accepting: Arc::new(AtomicBool::new(false)),
                    acceptor_waker: None,
                    acceptor: None,
                })
            }
        }
    }

    /// Address the server is reachable at.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Scheduler handle: worker table, counters, signal broadcast.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Coarse clock shared with the workers.
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    /// Stops accepting, tears every worker down, and joins all threads.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.accepting.store(false, Ordering::Relaxed);
        if let Some(waker) = self.acceptor_waker.take() {
            let _ = waker.wake();
        }
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        self.scheduler.shutdown()
    }
}
