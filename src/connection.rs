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

//! Per-connection record and the worker's ordered connection index.

use std::collections::BTreeMap;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::net::TcpStream;
use mio::Interest;

/// Scheduler-visible status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Idle between keep-alive requests.
    Available,
    /// Accepted, awaiting the first request bytes.
    Pending,
    /// Request in flight.
    Processing,
}

/// One accepted TCP socket and its scheduler bookkeeping.
///
/// The record owns the stream; destruction flows from the index, and the
/// socket closes when the record drops. The registered event fd equals the
/// record's descriptor for the record's whole lifetime.
#[derive(Debug)]
pub struct SchedConn {
    pub(crate) stream: TcpStream,
    pub(crate) fd: RawFd,
    pub(crate) status: ConnStatus,
    pub(crate) arrive_time: u64,
    pub(crate) interest: Interest,
}

impl SchedConn {
    /// Wraps a freshly accepted stream.
    pub fn new(stream: TcpStream, arrive_time: u64) -> Self {
        let fd = stream.as_raw_fd();
        Self {
            stream,
            fd,
            status: ConnStatus::Pending,
            arrive_time,
            interest: Interest::READABLE,
        }
    }

    /// Socket descriptor, unique within the owning worker while live.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current status.
    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// Seconds timestamp recorded at accept.
    pub fn arrive_time(&self) -> u64 {
        self.arrive_time
    }

    /// Readiness mask the record is currently registered with.
    pub fn interest(&self) -> Interest {
        self.interest
    }
}

/// Per-worker ordered map from socket descriptor to connection record.
///
/// Insert, point-lookup and erase are O(log n); ordering is by descriptor
/// value. No in-order traversal is needed beyond teardown.
#[derive(Debug, Default)]
pub struct ConnIndex {
    conns: BTreeMap<RawFd, SchedConn>,
}

impl ConnIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            conns: BTreeMap::new(),
        }
    }

    /// Attaches a record under its descriptor.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate descriptor: a second record for a live fd means
    /// an earlier record leaked past its close, and the worker must not keep
    /// running on a corrupted index.
    pub fn insert(&mut self, conn: SchedConn) {
        let fd = conn.fd;
        if self.conns.insert(fd, conn).is_some() {
            panic!("connection index: duplicate fd {}", fd);
        }
    }

    /// Looks up the record for a descriptor.
    pub fn get(&self, fd: RawFd) -> Option<&SchedConn> {
        self.conns.get(&fd)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut SchedConn> {
        self.conns.get_mut(&fd)
    }

    /// True when a record for `fd` is live.
    pub fn contains(&self, fd: RawFd) -> bool {
        self.conns.contains_key(&fd)
    }

    /// Detaches and returns the record. Does not close the socket; the
    /// caller decides when the returned record (and with it the fd) dies.
    pub fn erase(&mut self, fd: RawFd) -> Option<SchedConn> {
        self.conns.remove(&fd)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// True when no records are live.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Descriptors of every live record, in ascending order.
    pub fn fds(&self) -> Vec<RawFd> {
        self.conns.keys().copied().collect()
    }
}

#[cfg(test)]
mod test {
    use mio::net::TcpStream;

    use super::{ConnIndex, ConnStatus, SchedConn};

    fn stream_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn new_record_starts_pending() {
        let (stream, _client) = stream_pair();
        let conn = SchedConn::new(stream, 42);
        assert_eq!(ConnStatus::Pending, conn.status());
        assert_eq!(42, conn.arrive_time());
    }

    #[test]
    fn insert_then_lookup_then_erase() {
        let (stream, _client) = stream_pair();
        let conn = SchedConn::new(stream, 0);
        let fd = conn.fd();

        let mut index = ConnIndex::new();
        index.insert(conn);
        assert_eq!(1, index.len());
        assert!(index.contains(fd));
        assert_eq!(fd, index.get(fd).unwrap().fd());

        let erased = index.erase(fd).unwrap();
        assert_eq!(fd, erased.fd());
        assert!(index.is_empty());
        assert!(index.get(fd).is_none());
    }

    #[test]
    fn erase_absent_returns_none() {
        let mut index = ConnIndex::new();
        assert!(index.erase(99).is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate fd")]
    fn duplicate_fd_panics() {
        let (stream, _client) = stream_pair();
        let (other, _other_client) = stream_pair();
        let conn = SchedConn::new(stream, 0);
        let fd = conn.fd();
        let mut index = ConnIndex::new();
        index.insert(conn);

        // fabricate a second record carrying the same descriptor
        let mut dup = SchedConn::new(other, 0);
        dup.fd = fd;
        index.insert(dup);
    }

    #[test]
    fn fds_are_sorted() {
        let (a, _ca) = stream_pair();
        let (b, _cb) = stream_pair();
        let mut index = ConnIndex::new();
        index.insert(SchedConn::new(b, 0));
        index.insert(SchedConn::new(a, 0));
        let fds = index.fds();
        assert_eq!(2, fds.len());
        assert!(fds[0] < fds[1]);
    }
}
