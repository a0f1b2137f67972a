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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! tamarin is the scheduling core of a multi-threaded HTTP server.
//!
//! A fixed pool of worker threads each runs a single-threaded event loop over
//! its own disjoint set of connections. New connections are routed to a
//! worker either by a fair balancer owning a singular accept socket, or by
//! the kernel via per-worker SO_REUSEPORT sockets. Workers index live
//! connections by descriptor, drive each one through read, parse, write and
//! close, and periodically reap peers that stall mid-request or idle past the
//! keep-alive window.

pub mod clock;
pub mod config;
pub mod connection;
pub mod listener;
pub mod plugin;
pub mod scheduler;
pub mod server;
pub mod sessions;
pub mod signal;
pub mod worker;

pub use config::{SchedulerMode, ServerConfig};
pub use server::Server;
