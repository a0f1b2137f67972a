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

//! Listening-socket construction and the fair-mode accept loop.
//!
//! The accept loop is deliberately thin: accept until would-block and hand
//! every socket to the balancer. Everything that matters — worker selection,
//! capacity, stage-10 — happens behind [`Scheduler::dispatch`].

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::scheduler::Scheduler;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);
const EVENT_QUEUE_SIZE: usize = 1024;

/// Builds a non-blocking listening socket with the configured backlog.
///
/// `reuse_port` lets every worker bind the same address in kernel-balanced
/// mode; the kernel then spreads accepts across the sockets.
pub fn bind_listener(addr: SocketAddr, backlog: i32, reuse_port: bool) -> io::Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Fair-mode acceptor: owns the singular accept socket and routes every
/// accepted connection through the balancer.
#[derive(Debug)]
pub struct Acceptor {
    inner: TcpListener,
    poll: Poll,
    waker: Arc<Waker>,
    accepting: Arc<AtomicBool>,
    scheduler: Arc<Scheduler>,
}

impl Acceptor {
    /// Registers the listener and builds the shutdown waker.
    pub fn new(
        mut listener: TcpListener,
        scheduler: Arc<Scheduler>,
        accepting: Arc<AtomicBool>,
    ) -> io::Result<Acceptor> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            inner: listener,
            poll,
            waker,
            accepting,
            scheduler,
        })
    }

    /// Waker that interrupts the accept loop. Clear the accepting flag, then
    /// wake, to stop the loop.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    fn accept(&mut self) {
        loop {
            match self.inner.accept() {
                Ok((stream, _)) => self.scheduler.dispatch(stream),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("acceptor: accept failed: {}", err);
                    return;
                }
            }
        }
    }

    /// Runs the accept loop until the accepting flag is cleared and the
    /// waker fires.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_QUEUE_SIZE);
        while self.accepting.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("acceptor: poll failed: {}", e);
                    return;
                }
            }
            for event in events.iter() {
                if event.token() == LISTEN_TOKEN {
                    self.accept();
                }
            }
        }
        debug!("acceptor: exit");
    }
}
