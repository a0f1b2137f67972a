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

//! Plugin stage hooks.
//!
//! The scheduler invokes a fixed set of hook points at well-defined
//! transitions: stage-10 when a connection is accepted, stage-50 when it is
//! dropped, one of close/error/timeout from the close dispatcher, and a
//! worker-init hook on each worker thread. Implementations override the
//! subset they need; refusals are honored only at stage-10.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Verdict returned by refusal-capable hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookAction {
    /// Proceed.
    Continue,
    /// Refuse the connection; the fd is closed and no record is created.
    CloseConx,
}

/// Why a connection left through the close dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed, the request finished without keep-alive, or the worker
    /// is tearing down.
    Closed,
    /// I/O or parse failure.
    Error,
    /// Reaped by the timeout sweep.
    Timeout,
}

/// Scheduler hook points.
pub trait Plugin: Send + Sync {
    /// Accept-time gate, the only hook whose refusal is honored.
    fn stage10(&self, _fd: RawFd) -> HookAction {
        HookAction::Continue
    }

    /// Drop-time notification, once per terminated connection.
    fn stage50(&self, _fd: RawFd) {}

    /// A connection closed normally.
    fn on_close(&self, _fd: RawFd) {}

    /// A connection closed after an I/O or parse failure.
    fn on_error(&self, _fd: RawFd) {}

    /// A connection was reaped by the timeout sweep.
    fn on_timeout(&self, _fd: RawFd) {}

    /// Runs once on each worker thread before its event loop starts.
    fn worker_init(&self, _worker: usize) {}
}

/// Registered plugin set. Populated before the scheduler starts, read-only
/// afterwards.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Adds a plugin.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Resolves the hook set once. Workers clone the result at init and
    /// never consult the registry on the hot path.
    pub fn hooks(&self) -> Hooks {
        Hooks {
            plugins: self.plugins.clone().into(),
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// Hook set resolved at worker init.
#[derive(Clone)]
pub struct Hooks {
    plugins: Arc<[Arc<dyn Plugin>]>,
}

impl Hooks {
    /// Runs the accept-time gate; the first refusal wins.
    pub fn stage10(&self, fd: RawFd) -> HookAction {
        for plugin in self.plugins.iter() {
            if plugin.stage10(fd) == HookAction::CloseConx {
                return HookAction::CloseConx;
            }
        }
        HookAction::Continue
    }

    /// Runs the drop-time hook.
    pub fn stage50(&self, fd: RawFd) {
        for plugin in self.plugins.iter() {
            plugin.stage50(fd);
        }
    }

    /// Runs the close-dispatcher hook matching `reason`.
    pub fn close_event(&self, fd: RawFd, reason: CloseReason) {
        for plugin in self.plugins.iter() {
            match reason {
                CloseReason::Closed => plugin.on_close(fd),
                CloseReason::Error => plugin.on_error(fd),
                CloseReason::Timeout => plugin.on_timeout(fd),
            }
        }
    }

    /// Runs the worker-init hook.
    pub fn worker_init(&self, worker: usize) {
        for plugin in self.plugins.iter() {
            plugin.worker_init(worker);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::os::unix::io::RawFd;
    use std::sync::{Arc, Mutex};

    use super::{CloseReason, HookAction, Plugin, PluginRegistry};

    #[derive(Default)]
    struct Recorder {
        refuse: bool,
        calls: Mutex<Vec<(&'static str, RawFd)>>,
    }

    impl Recorder {
        fn record(&self, hook: &'static str, fd: RawFd) {
            self.calls.lock().unwrap().push((hook, fd));
        }

        fn calls(&self) -> Vec<(&'static str, RawFd)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Plugin for Recorder {
        fn stage10(&self, fd: RawFd) -> HookAction {
            self.record("stage10", fd);
            if self.refuse {
                HookAction::CloseConx
            } else {
                HookAction::Continue
            }
        }

        fn stage50(&self, fd: RawFd) {
            self.record("stage50", fd);
        }

        fn on_close(&self, fd: RawFd) {
            self.record("close", fd);
        }

        fn on_error(&self, fd: RawFd) {
            self.record("error", fd);
        }

        fn on_timeout(&self, fd: RawFd) {
            self.record("timeout", fd);
        }
    }

    #[test]
    fn empty_hooks_continue() {
        let hooks = PluginRegistry::new().hooks();
        assert_eq!(HookAction::Continue, hooks.stage10(3));
        hooks.stage50(3);
        hooks.close_event(3, CloseReason::Closed);
    }

    #[test]
    fn stage10_refusal_wins() {
        let refuser = Arc::new(Recorder {
            refuse: true,
            ..Recorder::default()
        });
        let bystander = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(refuser.clone());
        registry.register(bystander.clone());

        assert_eq!(HookAction::CloseConx, registry.hooks().stage10(7));
        // the refusal short-circuits the rest of the set
        assert!(bystander.calls().is_empty());
    }

    #[test]
    fn close_event_dispatches_on_reason() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = PluginRegistry::new();
        registry.register(recorder.clone());
        let hooks = registry.hooks();

        hooks.close_event(4, CloseReason::Closed);
        hooks.close_event(5, CloseReason::Error);
        hooks.close_event(6, CloseReason::Timeout);
        assert_eq!(
            vec![("close", 4), ("error", 5), ("timeout", 6)],
            recorder.calls()
        );
    }
}
