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

//! Supervisor→worker notification channel.
//!
//! Lifecycle signals travel as fixed sentinel words over a pipe whose read
//! end is registered with the worker's event loop, so a signal wakes a
//! sleeping worker through the same multiplexer that delivers socket
//! readiness. The word encoding exists only at the pipe boundary; everything
//! else handles the typed [`Signal`].

use std::io::{self, ErrorKind, Read, Write};

use log::{debug, trace};
use mio::unix::pipe::{self, Receiver, Sender};

/// Reserved ping word.
const WORD_PING: u32 = 0xDEAD_BEEF;
/// Orderly worker teardown.
const WORD_FREE_ALL: u32 = 0xFFEE_0000;
/// An accepted socket is waiting on the worker's hand-off channel.
const WORD_DISPATCH: u32 = 0xACCE_57ED;

/// Lifecycle signals a worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Reserved; workers acknowledge by doing nothing.
    Ping,
    /// Drop every live connection, free worker-scoped state, exit the loop.
    FreeAll,
    /// Pull accepted sockets off the hand-off channel (fair mode only).
    Dispatch,
}

impl Signal {
    /// Sentinel word written on the pipe.
    pub fn word(self) -> u32 {
        match self {
            Signal::Ping => WORD_PING,
            Signal::FreeAll => WORD_FREE_ALL,
            Signal::Dispatch => WORD_DISPATCH,
        }
    }

    /// Decodes a wire word. Unknown words decode to `None` and are treated
    /// as no-ops by workers.
    pub fn from_word(word: u32) -> Option<Signal> {
        match word {
            WORD_PING => Some(Signal::Ping),
            WORD_FREE_ALL => Some(Signal::FreeAll),
            WORD_DISPATCH => Some(Signal::Dispatch),
            _ => None,
        }
    }
}

/// Creates the notification pipe: write end for the supervisor, read end for
/// the worker loop.
pub fn channel() -> io::Result<(Sender, Receiver)> {
    pipe::new()
}

/// Writes one signal word to a worker's notification pipe.
///
/// A full pipe means the worker already has kilobytes of unread wake-ups
/// queued; the word is dropped as redundant.
pub fn send(tx: &Sender, signal: Signal) -> io::Result<()> {
    let mut writer = tx;
    match writer.write_all(&signal.word().to_le_bytes()) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
        Err(e) => Err(e),
    }
}

/// Drains every pending word from the pipe's read end and decodes them in
/// arrival order.
pub fn drain(rx: &mut Receiver) -> Vec<Signal> {
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match rx.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!("notification pipe read failed: {}", e);
                break;
            }
        }
    }

    let mut signals = Vec::new();
    for word in pending.chunks_exact(4) {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        match Signal::from_word(word) {
            Some(signal) => signals.push(signal),
            None => trace!("ignoring unknown signal word {:#010x}", word),
        }
    }
    signals
}

/// Blocks SIGPIPE delivery on the calling thread, so a peer reset surfaces
/// as EPIPE from write instead of killing the process. Installed once per
/// worker at bootstrap.
pub fn mask_sigpipe() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGPIPE);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::{channel, drain, send, Signal};

    #[test]
    fn words_round_trip() {
        for signal in [Signal::Ping, Signal::FreeAll, Signal::Dispatch] {
            assert_eq!(Some(signal), Signal::from_word(signal.word()));
        }
    }

    #[test]
    fn unknown_word_decodes_to_none() {
        assert_eq!(None, Signal::from_word(0x0BAD_F00D));
    }

    #[test]
    fn signals_arrive_in_order() {
        let (tx, mut rx) = channel().unwrap();
        send(&tx, Signal::Dispatch).unwrap();
        send(&tx, Signal::Ping).unwrap();
        send(&tx, Signal::FreeAll).unwrap();
        assert_eq!(
            vec![Signal::Dispatch, Signal::Ping, Signal::FreeAll],
            drain(&mut rx)
        );
    }

    #[test]
    fn drain_on_empty_pipe_returns_nothing() {
        let (_tx, mut rx) = channel().unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn unknown_words_are_skipped() {
        let (tx, mut rx) = channel().unwrap();
        let mut writer = &tx;
        writer.write_all(&0xAAAA_AAAAu32.to_le_bytes()).unwrap();
        send(&tx, Signal::FreeAll).unwrap();
        assert_eq!(vec![Signal::FreeAll], drain(&mut rx));
    }
}
