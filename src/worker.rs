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

//! Worker threads: per-connection event dispatch, timeouts, and teardown.
//!
//! Each worker runs a single-threaded event loop over its own disjoint set
//! of connections. Readiness events drive the read/parse/write state
//! machine, a coarse one-second tick drives the timeout sweep, and the
//! notification pipe delivers supervisor signals and (fair mode) hand-off
//! wake-ups. No connection is ever touched by more than one thread.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::{debug, error, trace};
use mio::net::{TcpListener, TcpStream};
use mio::unix::pipe;
use mio::{Events, Interest, Poll, Token};

use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::connection::{ConnIndex, ConnStatus, SchedConn};
use crate::plugin::{CloseReason, HookAction, Hooks};
use crate::sessions::{ParseStatus, ReadStatus, SessionTable, WriteStatus};
use crate::signal::{self, Signal};

/// Token carried by the notification-pipe registration.
const NOTIFY_TOKEN: Token = Token(usize::MAX);
/// Token carried by a worker-owned listener (kernel-balanced mode).
const LISTEN_TOKEN: Token = Token(usize::MAX - 1);
/// Event capacity per poll call.
const EVENT_QUEUE_SIZE: usize = 1024;
/// Coarse tick driving the clock refresh and the timeout sweep.
const TICK: Duration = Duration::from_secs(1);

/// Worker-table entry: the half of a worker the supervisor and the balancer
/// see.
///
/// Counters are monotonic relaxed atomics. They are written by the owning
/// worker — except `accepted`, which the fair balancer bumps at dispatch so
/// back-to-back selections observe their own effect — and read by anyone; a
/// stale read costs at most one sub-optimal balancing choice.
#[derive(Debug)]
pub struct WorkerShared {
    idx: usize,
    pid: AtomicI64,
    accepted: AtomicU64,
    closed: AtomicU64,
    over_capacity: AtomicU64,
    initialized: AtomicBool,
    notify_tx: pipe::Sender,
    dispatch_tx: Sender<TcpStream>,
}

impl WorkerShared {
    /// Builds the table entry plus the worker-side ends of its channels.
    pub(crate) fn new(
        idx: usize,
    ) -> io::Result<(Arc<Self>, pipe::Receiver, Receiver<TcpStream>)> {
        let (notify_tx, notify_rx) = signal::channel()?;
        let (dispatch_tx, dispatch_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Self {
            idx,
            pid: AtomicI64::new(0),
            accepted: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            over_capacity: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            notify_tx,
            dispatch_tx,
        });
        Ok((shared, notify_rx, dispatch_rx))
    }

    /// Stable worker index; equals the worker-table slot.
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// OS thread id of the worker, zero until bootstrap completes.
    pub fn pid(&self) -> i64 {
        self.pid.load(Ordering::Relaxed)
    }

    /// Connections handed to this worker since start.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections this worker has terminated since start.
    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Accepts refused because the worker was at capacity.
    pub fn over_capacity(&self) -> u64 {
        self.over_capacity.load(Ordering::Relaxed)
    }

    /// Current live connections: accepted − closed.
    pub fn live(&self) -> u64 {
        self.accepted().saturating_sub(self.closed())
    }

    /// True once the worker has published its initialized flag.
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Writes one lifecycle signal to this worker's notification pipe.
    pub fn signal(&self, signal: Signal) -> io::Result<()> {
        signal::send(&self.notify_tx, signal)
    }

    /// Fair-mode hand-off: count the accept, queue the socket, wake the
    /// worker.
    pub(crate) fn hand_off(&self, stream: TcpStream) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        if self.dispatch_tx.send(stream).is_err() {
            // worker already exited; the socket closes on drop
            self.closed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if let Err(e) = self.signal(Signal::Dispatch) {
            debug!("worker/{}: dispatch signal failed: {}", self.idx, e);
        }
    }

    pub(crate) fn count_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_close(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_refusal(&self) {
        self.over_capacity.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_thread_id(&self) {
        #[cfg(target_os = "linux")]
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as i64 };
        #[cfg(not(target_os = "linux"))]
        let tid = 0i64;
        self.pid.store(tid, Ordering::Relaxed);
    }

    pub(crate) fn set_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

/// One scheduler worker: event loop, connection index, incomplete-request
/// list, session table, and the notification endpoints.
#[derive(Debug)]
pub struct Worker {
    shared: Arc<WorkerShared>,
    config: Arc<ServerConfig>,
    clock: Arc<Clock>,
    hooks: Hooks,
    poll: Poll,
    conns: ConnIndex,
    // records accepted but not yet owning a session; the sweep's first pass
    incoming: Vec<RawFd>,
    sessions: SessionTable,
    notify_rx: pipe::Receiver,
    dispatch_rx: Receiver<TcpStream>,
    listener: Option<TcpListener>,
    capacity: u64,
    last_sweep: u64,
    exiting: bool,
}

impl Worker {
    /// Builds the worker-local state and registers the notification pipe.
    pub(crate) fn new(
        shared: Arc<WorkerShared>,
        config: Arc<ServerConfig>,
        clock: Arc<Clock>,
        hooks: Hooks,
        mut notify_rx: pipe::Receiver,
        dispatch_rx: Receiver<TcpStream>,
    ) -> io::Result<Worker> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut notify_rx, NOTIFY_TOKEN, Interest::READABLE)?;
        let capacity = config.worker_capacity();
        Ok(Self {
            shared,
            config,
            clock,
            hooks,
            poll,
            conns: ConnIndex::new(),
            incoming: Vec::new(),
            sessions: SessionTable::new(),
            notify_rx,
            dispatch_rx,
            listener: None,
            capacity,
            last_sweep: 0,
            exiting: false,
        })
    }

    /// Registers this worker's own listening socket (kernel-balanced mode).
    pub(crate) fn set_listener(&mut self, mut listener: TcpListener) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        self.listener = Some(listener);
        Ok(())
    }

    /// Runs the event loop until FREE_ALL arrives or polling fails.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_QUEUE_SIZE);
        while !self.exiting {
            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("worker/{}: poll failed: {}", self.shared.idx(), e);
                    break;
                }
            }
            for event in events.iter() {
                match event.token() {
                    NOTIFY_TOKEN => self.notified(),
                    LISTEN_TOKEN => self.accept_ready(),
                    _ => self.connection_event(event),
                }
                if self.exiting {
                    break;
                }
            }
            self.clock.refresh();
            let now = self.clock.now_utime();
            if now != self.last_sweep {
                self.last_sweep = now;
                self.check_timeouts();
            }
        }
        debug!("worker/{}: exit", self.shared.idx());
    }

    /// Drains the notification pipe and acts on each signal in order.
    fn notified(&mut self) {
        for signal in signal::drain(&mut self.notify_rx) {
            match signal {
                Signal::Dispatch => self.take_dispatched(),
                Signal::FreeAll => {
                    self.free_all();
                    return;
                }
                Signal::Ping => trace!("worker/{}: ping", self.shared.idx()),
            }
        }
    }

    /// Pulls every queued socket off the fair-mode hand-off channel.
    fn take_dispatched(&mut self) {
        loop {
            match self.dispatch_rx.try_recv() {
                Ok(stream) => self.add_connection(stream),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    /// Kernel-balanced accept path: capacity check and stage-10 run here,
    /// right at the accepting edge.
    fn accept_ready(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, _)) => {
                    if self.shared.live() >= self.capacity {
                        trace!(
                            "worker/{}: too many clients, refusing fd {}",
                            self.shared.idx(),
                            stream.as_raw_fd()
                        );
                        self.shared.count_refusal();
                        continue;
                    }
                    if self.hooks.stage10(stream.as_raw_fd()) == HookAction::CloseConx {
                        trace!("[fd {}] refused at stage 10", stream.as_raw_fd());
                        self.shared.count_refusal();
                        continue;
                    }
                    self.shared.count_accept();
                    self.add_connection(stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("worker/{}: accept failed: {}", self.shared.idx(), e);
                    return;
                }
            }
        }
    }

    /// Registers an accepted socket with this worker: record into the index,
    /// fd onto the incomplete-request list, READ interest on the loop.
    fn add_connection(&mut self, stream: TcpStream) {
        let mut conn = SchedConn::new(stream, self.clock.now_utime());
        let fd = conn.fd();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut conn.stream, Token(fd as usize), Interest::READABLE)
        {
            // transient: drop this fd, keep serving; balance the accept count
            error!(
                "worker/{}: register fd {} failed: {}",
                self.shared.idx(),
                fd,
                e
            );
            self.shared.count_close();
            return;
        }
        self.conns.insert(conn);
        self.incoming.push(fd);
        trace!("[fd {}] registered on worker/{}", fd, self.shared.idx());
    }

    /// Routes one readiness event for a connection token.
    fn connection_event(&mut self, event: &mio::event::Event) {
        let fd = event.token().0 as RawFd;
        if event.is_error() {
            self.event_close(fd, CloseReason::Error);
            return;
        }
        if event.is_readable() {
            self.event_read(fd);
        }
        if event.is_writable() {
            self.event_write(fd);
        }
    }

    /// Connection read handler: create the session on first bytes, feed the
    /// parser, and arm the write side once a request is complete.
    fn event_read(&mut self, fd: RawFd) {
        trace!("[fd {}] connection handler / read", fd);
        if !self.conns.contains(fd) {
            // stale readiness for a record dropped earlier in this batch
            return;
        }
        let now = self.clock.now_utime();
        if !self.sessions.contains(fd) {
            self.sessions.create(fd, now);
            // incomplete tracking moves from the scheduler's list to the
            // session-incomplete list
            self.incoming.retain(|&f| f != fd);
        }
        let Some(conn) = self.conns.get_mut(fd) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(fd) else {
            return;
        };

        match session.fill(&mut conn.stream) {
            ReadStatus::Again => return,
            ReadStatus::Closed => {
                self.event_close(fd, CloseReason::Closed);
                return;
            }
            ReadStatus::Error => {
                self.event_close(fd, CloseReason::Error);
                return;
            }
            ReadStatus::Progress => conn.status = ConnStatus::Processing,
        }

        match session.parse() {
            ParseStatus::Partial => {
                trace!("[fd {}] parser pending", fd);
            }
            ParseStatus::Complete => {
                trace!("[fd {}] parser ok", fd);
                session.prepare_response();
                self.sessions.mark_complete(fd);
                self.rearm(fd, Interest::WRITABLE);
            }
            ParseStatus::Error => {
                trace!("[fd {}] parser error", fd);
                session.prepare_error_response();
                // flush whatever the error path queued before tearing down
                if !session.channel_is_empty() {
                    let _ = session.write_channel(&mut conn.stream);
                }
                self.sessions.remove(fd);
                self.event_close(fd, CloseReason::Error);
            }
        }
    }

    /// Connection write handler: drive the response channel.
    fn event_write(&mut self, fd: RawFd) {
        trace!("[fd {}] connection handler / write", fd);
        if !self.conns.contains(fd) {
            return;
        }
        if !self.sessions.contains(fd) {
            // ghost: the session is gone but the record survived. Route it
            // through the owner-checked primitive; no close-reason hook.
            self.drop_connection(fd);
            return;
        }
        let Some(conn) = self.conns.get_mut(fd) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(fd) else {
            return;
        };
        match session.write_channel(&mut conn.stream) {
            WriteStatus::Flush => {}
            WriteStatus::Error => self.event_close(fd, CloseReason::Error),
            WriteStatus::Done => self.request_end(fd),
        }
    }

    /// Request end: recycle a keep-alive connection or close it.
    fn request_end(&mut self, fd: RawFd) {
        trace!("[fd {}] request end", fd);
        let keep = self.sessions.get(fd).map(|s| s.keep_alive()).unwrap_or(false);
        if !keep {
            self.event_close(fd, CloseReason::Closed);
            return;
        }
        let now = self.clock.now_utime();
        self.sessions.request_end(fd, now);
        if let Some(conn) = self.conns.get_mut(fd) {
            conn.status = ConnStatus::Available;
        }
        self.rearm(fd, Interest::READABLE);
    }

    /// Replaces the readiness mask for a live connection.
    fn rearm(&mut self, fd: RawFd, interest: Interest) {
        let Some(conn) = self.conns.get_mut(fd) else {
            return;
        };
        conn.interest = interest;
        if let Err(e) =
            self.poll
                .registry()
                .reregister(&mut conn.stream, Token(fd as usize), interest)
        {
            error!("[fd {}] reregister failed: {}", fd, e);
            self.event_close(fd, CloseReason::Error);
        }
    }

    /// Timeout sweep, two passes: records still waiting for their session,
    /// then sessions whose request is incomplete. Expired descriptors are
    /// collected first so the lists are never mutated mid-walk.
    fn check_timeouts(&mut self) {
        let now = self.clock.now_utime();
        let mut expired: Vec<RawFd> = Vec::new();

        for &fd in &self.incoming {
            if let Some(conn) = self.conns.get(fd) {
                if conn.arrive_time + self.config.timeout <= now {
                    trace!("[fd {}] closing due to timeout (incoming)", fd);
                    expired.push(fd);
                }
            }
        }

        for &fd in self.sessions.incomplete() {
            if let Some(session) = self.sessions.get(fd) {
                let allowed = if session.counter_connections() == 0 {
                    self.config.timeout
                } else {
                    self.config.keep_alive_timeout
                };
                if session.init_time() + allowed <= now {
                    trace!("[fd {}] closing due to timeout (incomplete)", fd);
                    expired.push(fd);
                }
            }
        }

        for fd in expired {
            self.event_close(fd, CloseReason::Timeout);
        }
    }

    /// Close dispatcher: drop the connection and fire exactly one
    /// close/error/timeout hook when a live record was torn down.
    fn event_close(&mut self, fd: RawFd, reason: CloseReason) {
        trace!("[fd {}] connection handler, closed ({:?})", fd, reason);
        if self.drop_connection(fd) {
            self.hooks.close_event(fd, reason);
        }
    }

    /// The canonical termination primitive: removes every resource bound to
    /// the socket. Idempotent; returns whether a live record was dropped.
    ///
    /// The record leaves both the event loop and the index before its socket
    /// closes. Deregistering first keeps stale readiness from firing;
    /// erasing before close keeps a kernel-reused descriptor from colliding
    /// with the still-indexed record (ghost fd).
    pub(crate) fn drop_connection(&mut self, fd: RawFd) -> bool {
        self.sessions.remove(fd);
        if !self.conns.contains(fd) {
            trace!("[fd {}] not found in scheduler list", fd);
            return false;
        }
        if let Some(conn) = self.conns.get_mut(fd) {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!("[fd {}] deregister failed: {}", fd, e);
            }
        }
        self.hooks.stage50(fd);
        self.shared.count_close();
        self.incoming.retain(|&f| f != fd);
        let conn = self.conns.erase(fd);
        // the socket closes here, strictly after the index erase
        drop(conn);
        trace!("[fd {}] scheduler remove", fd);
        true
    }

    /// FREE_ALL: drop every live connection and leave the loop. Worker-scoped
    /// allocations die with the worker.
    fn free_all(&mut self) {
        debug!("worker/{}: free all", self.shared.idx());
        for fd in self.conns.fds() {
            self.event_close(fd, CloseReason::Closed);
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.exiting = true;
    }
}
