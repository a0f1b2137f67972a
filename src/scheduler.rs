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

//! Supervisor: worker table, bootstrap, fair balancer, lifecycle broadcast.
//!
//! The supervisor allocates one table entry per worker, spawns the threads,
//! and blocks until every worker has published its initialized flag. After
//! bootstrap its only jobs are routing accepted sockets (fair mode) and
//! broadcasting lifecycle signals over the notification pipes.

use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};
use mio::net::TcpStream;
use std::os::unix::io::AsRawFd;

use crate::clock::Clock;
use crate::config::{SchedulerMode, ServerConfig};
use crate::listener;
use crate::plugin::{HookAction, Hooks, PluginRegistry};
use crate::signal::{self, Signal};
use crate::worker::{Worker, WorkerShared};

/// Snapshot of one worker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker-table slot.
    pub idx: usize,
    /// Connections handed to the worker.
    pub accepted: u64,
    /// Connections the worker terminated.
    pub closed: u64,
    /// Accepts refused at capacity.
    pub over_capacity: u64,
    /// accepted − closed.
    pub live: u64,
}

/// Startup handshake: workers publish success or their bootstrap error, the
/// supervisor joins against the count.
#[derive(Debug, Default)]
struct InitBarrier {
    state: Mutex<InitState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct InitState {
    ready: usize,
    failed: Option<io::Error>,
}

/// Tears down a partially-started pool: workers that reached their loop get
/// FREE_ALL, everything spawned so far is joined.
fn abort_bootstrap(workers: &[Arc<WorkerShared>], handles: Vec<JoinHandle<()>>) {
    for worker in workers {
        let _ = worker.signal(Signal::FreeAll);
    }
    for handle in handles {
        let _ = handle.join();
    }
}

impl InitBarrier {
    fn publish(&self, result: io::Result<()>) {
        let mut state = self.state.lock().unwrap();
        if let Err(e) = result {
            if state.failed.is_none() {
                state.failed = Some(e);
            }
        }
        state.ready += 1;
        self.cond.notify_all();
    }

    fn wait(&self, count: usize) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.ready < count {
            state = self.cond.wait(state).unwrap();
        }
        match state.failed.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// The scheduler supervisor and its fixed worker table.
#[derive(Debug)]
pub struct Scheduler {
    workers: Vec<Arc<WorkerShared>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    capacity_per_worker: u64,
    hooks: Hooks,
}

impl Scheduler {
    /// Allocates the worker table, spawns the worker threads, and waits for
    /// each to publish its initialized flag.
    ///
    /// Bootstrap failures are fatal: every worker that did start is torn
    /// down again and the error is returned.
    pub fn start(
        config: Arc<ServerConfig>,
        plugins: &PluginRegistry,
        clock: Arc<Clock>,
    ) -> io::Result<Scheduler> {
        let hooks = plugins.hooks();
        let barrier = Arc::new(InitBarrier::default());
        let mut workers = Vec::with_capacity(config.workers);
        let mut handles = Vec::with_capacity(config.workers);

        for idx in 0..config.workers {
            let (shared, notify_rx, dispatch_rx) = match WorkerShared::new(idx) {
                Ok(parts) => parts,
                Err(e) => {
                    abort_bootstrap(&workers, handles);
                    return Err(e);
                }
            };
            workers.push(shared.clone());

            let config = config.clone();
            let clock = clock.clone();
            let hooks = hooks.clone();
            let barrier = barrier.clone();
            let spawned = thread::Builder::new()
                .name(format!("worker/{}", idx))
                .spawn(move || {
                    signal::mask_sigpipe();
                    shared.record_thread_id();
                    hooks.worker_init(idx);

                    let entry = shared.clone();
                    let mut worker = match Worker::new(
                        shared, config.clone(), clock, hooks, notify_rx, dispatch_rx,
                    ) {
                        Ok(worker) => worker,
                        Err(e) => {
                            error!("worker/{}: bootstrap failed: {}", idx, e);
                            barrier.publish(Err(e));
                            return;
                        }
                    };

                    // kernel-balanced mode: every worker binds its own
                    // listening socket to the shared address
                    if config.scheduler_mode == SchedulerMode::ReusePort {
                        let bound = listener::bind_listener(config.listen, config.backlog, true)
                            .and_then(|l| worker.set_listener(l));
                        if let Err(e) = bound {
                            error!("worker/{}: failed to initialize listen socket: {}", idx, e);
                            barrier.publish(Err(e));
                            return;
                        }
                    }

                    entry.set_initialized();
                    barrier.publish(Ok(()));
                    worker.run();
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    abort_bootstrap(&workers, handles);
                    return Err(e);
                }
            }
        }

        if let Err(e) = barrier.wait(config.workers) {
            abort_bootstrap(&workers, handles);
            return Err(e);
        }

        debug!("scheduler: {} workers initialized", config.workers);
        Ok(Scheduler {
            workers,
            handles: Mutex::new(handles),
            capacity_per_worker: config.worker_capacity(),
            hooks,
        })
    }

    /// Fair-balance scan: the worker with the fewest live connections, ties
    /// broken by the lowest index, with an early exit on a zero-load worker.
    /// `full` reports that even the lightest worker is at its capacity
    /// share — the whole server is full.
    fn select(&self) -> (usize, bool) {
        let mut target = 0;
        let mut cur = self.workers[0].live();
        if cur != 0 {
            for (i, worker) in self.workers.iter().enumerate().skip(1) {
                let tmp = worker.live();
                if tmp < cur {
                    target = i;
                    cur = tmp;
                    if cur == 0 {
                        break;
                    }
                }
            }
        }
        (target, cur >= self.capacity_per_worker)
    }

    /// Worker that should take the next connection, or `None` when the
    /// server is full. Deterministic for a fixed counter snapshot.
    pub fn next_target(&self) -> Option<&Arc<WorkerShared>> {
        let (target, full) = self.select();
        if full {
            None
        } else {
            Some(&self.workers[target])
        }
    }

    /// Fair-mode entry point: route one accepted socket to a worker, or
    /// refuse it. Refusals close the fd right here, before any record
    /// exists, and tally on the worker that would have received it.
    pub fn dispatch(&self, stream: TcpStream) {
        let fd = stream.as_raw_fd();
        let (target, full) = self.select();
        let worker = &self.workers[target];
        if full {
            trace!("too many clients, refusing fd {}", fd);
            worker.count_refusal();
            return;
        }
        if self.hooks.stage10(fd) == HookAction::CloseConx {
            trace!("[fd {}] refused at stage 10", fd);
            worker.count_refusal();
            return;
        }
        worker.hand_off(stream);
    }

    /// The worker table.
    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    /// Counter snapshot for every worker.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers
            .iter()
            .map(|w| WorkerStats {
                idx: w.idx(),
                accepted: w.accepted(),
                closed: w.closed(),
                over_capacity: w.over_capacity(),
                live: w.live(),
            })
            .collect()
    }

    /// Writes one lifecycle signal to every worker.
    pub fn broadcast(&self, signal: Signal) -> io::Result<()> {
        for worker in &self.workers {
            worker.signal(signal)?;
        }
        Ok(())
    }

    /// Orderly teardown: FREE_ALL to every worker, then join them all.
    /// After this returns, closed equals accepted on every worker.
    pub fn shutdown(&self) -> io::Result<()> {
        self.broadcast(Signal::FreeAll)?;
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::Scheduler;
    use crate::clock::Clock;
    use crate::config::{SchedulerMode, ServerConfig};
    use crate::plugin::PluginRegistry;
    use crate::signal::Signal;
    use crate::worker::WorkerShared;

    fn table(n: usize) -> Vec<Arc<WorkerShared>> {
        (0..n).map(|i| WorkerShared::new(i).unwrap().0).collect()
    }

    fn balancer(workers: Vec<Arc<WorkerShared>>, capacity_per_worker: u64) -> Scheduler {
        Scheduler {
            workers,
            handles: Mutex::new(Vec::new()),
            capacity_per_worker,
            hooks: PluginRegistry::new().hooks(),
        }
    }

    fn load(worker: &WorkerShared, live: u64) {
        for _ in 0..live {
            worker.count_accept();
        }
    }

    #[test]
    fn balancer_prefers_least_loaded_worker() {
        let workers = table(2);
        load(&workers[0], 2);
        let scheduler = balancer(workers, 2);

        let target = scheduler.next_target().unwrap();
        assert_eq!(1, target.idx());
    }

    #[test]
    fn balancer_breaks_ties_towards_lowest_index() {
        let workers = table(3);
        load(&workers[0], 1);
        load(&workers[1], 1);
        load(&workers[2], 1);
        let scheduler = balancer(workers, 4);

        assert_eq!(0, scheduler.next_target().unwrap().idx());
    }

    #[test]
    fn balancer_is_deterministic_for_a_counter_snapshot() {
        let workers = table(4);
        load(&workers[0], 3);
        load(&workers[1], 1);
        load(&workers[2], 1);
        load(&workers[3], 2);
        let scheduler = balancer(workers, 4);

        let first = scheduler.next_target().unwrap().idx();
        for _ in 0..10 {
            assert_eq!(first, scheduler.next_target().unwrap().idx());
        }
        assert_eq!(1, first);
    }

    #[test]
    fn balancer_reports_full_when_lightest_worker_is_at_share() {
        let workers = table(2);
        load(&workers[0], 2);
        load(&workers[1], 2);
        let scheduler = balancer(workers, 2);

        assert!(scheduler.next_target().is_none());
    }

    #[test]
    fn balancer_zero_load_worker_wins_immediately() {
        let workers = table(3);
        load(&workers[1], 5);
        load(&workers[2], 5);
        let scheduler = balancer(workers, 8);

        assert_eq!(0, scheduler.next_target().unwrap().idx());
    }

    #[test]
    fn start_initializes_every_worker_and_shuts_down() {
        let config = Arc::new(ServerConfig {
            workers: 2,
            server_capacity: 8,
            scheduler_mode: SchedulerMode::FairBalancing,
            ..ServerConfig::default()
        });
        let scheduler =
            Scheduler::start(config, &PluginRegistry::new(), Arc::new(Clock::new())).unwrap();

        assert!(scheduler.workers().iter().all(|w| w.initialized()));
        assert_eq!(2, scheduler.stats().len());

        // ping is acknowledged by doing nothing
        scheduler.broadcast(Signal::Ping).unwrap();
        scheduler.shutdown().unwrap();
    }
}
