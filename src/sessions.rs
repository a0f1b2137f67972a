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

//! HTTP session layer.
//!
//! The scheduler treats sessions as opaque: it looks them up by socket,
//! removes them by socket, and inspects `init_time` and
//! `counter_connections` during the timeout sweep. This module supplies the
//! minimal collaborator behind that contract — per-connection buffering, a
//! request framer that stops at end-of-headers, keep-alive negotiation, and
//! a response channel. Routing, handlers and the full HTTP grammar live
//! elsewhere; the canned response here is 204 No Content.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::RawFd;

use log::trace;
use mio::net::TcpStream;

const KB: usize = 1024;
/// Cap on buffered request bytes before the parser rejects the request.
const MAX_REQUEST: usize = 16 * KB;

/// Outcome of the read handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Bytes were consumed into the session buffer.
    Progress,
    /// The peer closed the connection before sending anything new.
    Closed,
    /// Nothing available; wait for the next readable event.
    Again,
    /// Hard I/O failure.
    Error,
}

/// Outcome of framing the buffered request bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request head is buffered.
    Complete,
    /// More bytes are needed.
    Partial,
    /// The bytes cannot be a request.
    Error,
}

/// Outcome of the write handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The channel drained completely.
    Done,
    /// Partial write; wait for the next writable event.
    Flush,
    /// Hard I/O failure.
    Error,
}

/// Per-connection HTTP state: parser buffer, response channel, and the
/// timing fields the timeout sweep reads.
#[derive(Debug)]
pub struct Session {
    socket: RawFd,
    buf: Vec<u8>,
    channel: Vec<u8>,
    sent: usize,
    init_time: u64,
    counter_connections: u64,
    keep_alive: bool,
}

impl Session {
    fn new(socket: RawFd, init_time: u64) -> Self {
        Self {
            socket,
            buf: Vec::with_capacity(4 * KB),
            channel: Vec::new(),
            sent: 0,
            init_time,
            counter_connections: 0,
            keep_alive: false,
        }
    }

    /// Seconds timestamp of session creation, or of the last request end on
    /// a keep-alive connection.
    pub fn init_time(&self) -> u64 {
        self.init_time
    }

    /// Requests completed on this connection so far.
    pub fn counter_connections(&self) -> u64 {
        self.counter_connections
    }

    /// Whether the parsed request asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// True when the response channel has nothing left to send.
    pub fn channel_is_empty(&self) -> bool {
        self.sent >= self.channel.len()
    }

    /// Read handler: consume available bytes into the session buffer.
    ///
    /// Reads until would-block. A close observed after new bytes still
    /// reports progress; the EOF resurfaces on the next readable event once
    /// the buffered request has been handled.
    pub fn fill(&mut self, stream: &mut TcpStream) -> ReadStatus {
        let mut read = 0;
        let mut chunk = [0u8; 4 * KB];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if read == 0 {
                        return ReadStatus::Closed;
                    }
                    break;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    read += n;
                    if self.buf.len() > MAX_REQUEST {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if read == 0 {
                        return ReadStatus::Again;
                    }
                    break;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    trace!("[fd {}] read failed: {}", self.socket, e);
                    return ReadStatus::Error;
                }
            }
        }
        ReadStatus::Progress
    }

    /// Frames the buffered bytes: complete once the head ends, error when
    /// the request line is malformed or the buffer outgrows the cap.
    pub fn parse(&mut self) -> ParseStatus {
        let Some(end) = find_head_end(&self.buf) else {
            if self.buf.len() > MAX_REQUEST {
                return ParseStatus::Error;
            }
            return ParseStatus::Partial;
        };
        let head = &self.buf[..end];
        if !request_line_valid(head) {
            return ParseStatus::Error;
        }
        self.keep_alive = wants_keep_alive(head);
        ParseStatus::Complete
    }

    /// Queues the canned response for the parsed request.
    pub fn prepare_response(&mut self) {
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        self.channel = format!(
            "HTTP/1.1 204 No Content\r\nServer: tamarin\r\nConnection: {}\r\n\r\n",
            connection
        )
        .into_bytes();
        self.sent = 0;
    }

    /// Queues an error response for a request that failed to parse. The
    /// connection never survives a parse failure.
    pub fn prepare_error_response(&mut self) {
        self.channel =
            b"HTTP/1.1 400 Bad Request\r\nServer: tamarin\r\nConnection: close\r\n\r\n".to_vec();
        self.sent = 0;
        self.keep_alive = false;
    }

    /// Write handler: drive the response channel towards the peer.
    pub fn write_channel(&mut self, stream: &mut TcpStream) -> WriteStatus {
        while self.sent < self.channel.len() {
            match stream.write(&self.channel[self.sent..]) {
                Ok(0) => return WriteStatus::Error,
                Ok(n) => self.sent += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return WriteStatus::Flush,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    trace!("[fd {}] write failed: {}", self.socket, e);
                    return WriteStatus::Error;
                }
            }
        }
        WriteStatus::Done
    }

    /// Request end: reset parser and channel state for the next request on
    /// a persistent connection.
    pub fn reset(&mut self, now: u64) {
        self.buf.clear();
        self.channel.clear();
        self.sent = 0;
        self.counter_connections += 1;
        self.init_time = now;
        self.keep_alive = false;
    }
}

/// Offset one past the head terminator, if buffered.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Method, target and an HTTP version, separated by single spaces.
fn request_line_valid(head: &[u8]) -> bool {
    let Some(line_end) = head.windows(2).position(|w| w == b"\r\n") else {
        return false;
    };
    let line = &head[..line_end];
    if line.iter().any(|&b| !(0x20..0x7f).contains(&b)) {
        return false;
    }
    let mut parts = line.split(|&b| b == b' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if parts.next().is_some() {
        return false;
    }
    !method.is_empty()
        && method.iter().all(u8::is_ascii_uppercase)
        && !target.is_empty()
        && version.starts_with(b"HTTP/")
}

/// Keep-alive negotiation: HTTP/1.1 defaults to persistent unless the peer
/// says close; HTTP/1.0 must ask.
fn wants_keep_alive(head: &[u8]) -> bool {
    let mut lines = head.split(|&b| b == b'\n').map(|l| {
        if l.ends_with(b"\r") {
            &l[..l.len() - 1]
        } else {
            l
        }
    });
    let request_line = lines.next().unwrap_or(b"");
    let mut keep = request_line.ends_with(b"HTTP/1.1");

    for line in lines {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        if !name.eq_ignore_ascii_case(b"connection") {
            continue;
        }
        let value = line[colon + 1..].trim_ascii();
        if value.eq_ignore_ascii_case(b"close") {
            keep = false;
        } else if value.eq_ignore_ascii_case(b"keep-alive") {
            keep = true;
        }
    }
    keep
}

/// Per-worker session store plus the session-incomplete list the timeout
/// sweep walks.
///
/// A socket joins the incomplete list when its session is created and leaves
/// it when a request completes; request end on a keep-alive connection
/// re-joins it, so idle peers stay visible to the sweep.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: BTreeMap<RawFd, Session>,
    incomplete: Vec<RawFd>,
}

impl SessionTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            incomplete: Vec::new(),
        }
    }

    /// Looks up the session for a socket.
    pub fn get(&self, fd: RawFd) -> Option<&Session> {
        self.sessions.get(&fd)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Session> {
        self.sessions.get_mut(&fd)
    }

    /// True when a session exists for `fd`.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.sessions.contains_key(&fd)
    }

    /// Creates the session for a socket and queues it on the incomplete
    /// list. The caller guarantees no session exists for `fd`.
    pub fn create(&mut self, fd: RawFd, now: u64) -> &mut Session {
        trace!("[fd {}] create HTTP session", fd);
        debug_assert!(!self.sessions.contains_key(&fd));
        self.incomplete.push(fd);
        self.sessions.entry(fd).or_insert_with(|| Session::new(fd, now))
    }

    /// Removes the session for a socket. Idempotent; returns whether a
    /// session existed.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        self.incomplete.retain(|&f| f != fd);
        self.sessions.remove(&fd).is_some()
    }

    /// Marks the in-flight request complete: the sweep stops tracking the
    /// session until the next request starts.
    pub fn mark_complete(&mut self, fd: RawFd) {
        self.incomplete.retain(|&f| f != fd);
    }

    /// Request end: reset the session and resume incomplete tracking so the
    /// keep-alive idle window is enforced.
    pub fn request_end(&mut self, fd: RawFd, now: u64) {
        if let Some(session) = self.sessions.get_mut(&fd) {
            session.reset(now);
            if !self.incomplete.contains(&fd) {
                self.incomplete.push(fd);
            }
        }
    }

    /// Sockets whose request is not yet complete, oldest first.
    pub fn incomplete(&self) -> &[RawFd] {
        &self.incomplete
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::time::Duration;

    use mio::net::TcpStream;

    use super::{ParseStatus, ReadStatus, Session, SessionTable, WriteStatus};

    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    fn filled_session(payload: &[u8]) -> Session {
        let mut session = Session::new(0, 0);
        session.buf.extend_from_slice(payload);
        session
    }

    #[test]
    fn parse_reports_partial_until_head_ends() {
        let mut session = filled_session(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert_eq!(ParseStatus::Partial, session.parse());
        session.buf.extend_from_slice(b"\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let mut session = filled_session(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        assert!(session.keep_alive());
    }

    #[test]
    fn http11_honors_connection_close() {
        let mut session = filled_session(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        assert!(!session.keep_alive());
    }

    #[test]
    fn http10_must_ask_for_keep_alive() {
        let mut session = filled_session(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        assert!(!session.keep_alive());

        let mut session = filled_session(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        assert!(session.keep_alive());
    }

    #[test]
    fn malformed_request_line_is_an_error() {
        for bad in [
            &b"garbage\r\n\r\n"[..],
            &b"GET /\r\n\r\n"[..],
            &b"get / HTTP/1.1\r\n\r\n"[..],
            &b"GET  / HTTP/1.1\r\n\r\n"[..],
            &b"GET / HTTP/1.1 extra\r\n\r\n"[..],
        ] {
            let mut session = filled_session(bad);
            assert_eq!(ParseStatus::Error, session.parse(), "input: {:?}", bad);
        }
    }

    #[test]
    fn oversized_head_without_terminator_is_an_error() {
        let mut session = filled_session(&vec![b'a'; super::MAX_REQUEST + 1]);
        assert_eq!(ParseStatus::Error, session.parse());
    }

    #[test]
    fn fill_reads_request_bytes() {
        let (mut server, mut client) = stream_pair();
        let mut session = Session::new(0, 0);

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap();
        let status = loop {
            match session.fill(&mut server) {
                ReadStatus::Again => std::thread::sleep(Duration::from_millis(5)),
                other => break other,
            }
        };
        assert_eq!(ReadStatus::Progress, status);
        assert_eq!(ParseStatus::Complete, session.parse());
    }

    #[test]
    fn fill_reports_peer_close() {
        let (mut server, client) = stream_pair();
        drop(client);
        let mut session = Session::new(0, 0);
        let status = loop {
            match session.fill(&mut server) {
                ReadStatus::Again => std::thread::sleep(Duration::from_millis(5)),
                other => break other,
            }
        };
        assert_eq!(ReadStatus::Closed, status);
    }

    #[test]
    fn write_channel_drains_response_to_peer() {
        let (mut server, mut client) = stream_pair();
        let mut session = filled_session(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        session.prepare_response();
        assert!(!session.channel_is_empty());

        assert_eq!(WriteStatus::Done, session.write_channel(&mut server));
        assert!(session.channel_is_empty());

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut received = [0u8; 256];
        let n = client.read(&mut received).unwrap();
        let text = std::str::from_utf8(&received[..n]).unwrap();
        assert!(text.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(text.contains("Connection: keep-alive"));
    }

    #[test]
    fn reset_advances_counters_and_clears_state() {
        let mut session = filled_session(b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(ParseStatus::Complete, session.parse());
        session.prepare_response();
        session.reset(9);

        assert_eq!(1, session.counter_connections());
        assert_eq!(9, session.init_time());
        assert!(session.channel_is_empty());
        assert!(!session.keep_alive());
        assert_eq!(ParseStatus::Partial, session.parse());
    }

    #[test]
    fn table_tracks_incomplete_sessions() {
        let mut table = SessionTable::new();
        table.create(3, 0);
        table.create(5, 1);
        assert_eq!(&[3, 5][..], table.incomplete());

        table.mark_complete(3);
        assert_eq!(&[5][..], table.incomplete());

        // request end puts the socket back under sweep surveillance
        table.request_end(3, 2);
        assert_eq!(&[5, 3][..], table.incomplete());
        assert_eq!(1, table.get(3).unwrap().counter_connections());

        assert!(table.remove(5));
        assert!(!table.remove(5));
        assert_eq!(&[3][..], table.incomplete());
        assert_eq!(1, table.len());
    }
}
