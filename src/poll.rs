//! Readiness multiplexing over `poll(2)`.
//!
//! Every component in the runtime is single-threaded and owns one
//! [`PollSet`]: the daemon and server poll their listener plus arbiter
//! connections, the arbiter polls its listener, its server socket, and one
//! socket per local participant. Sockets stay in blocking mode; the set is
//! only consulted for read readiness, and the protocol guarantees that a
//! readable peer delivers a whole frame in bounded time.

use std::io;
use std::os::unix::io::RawFd;

/// Transparent wrapper around `libc::pollfd` so the set can derive `Debug`
/// without libc's `extra_traits` feature.
#[repr(transparent)]
#[derive(Clone)]
struct PollFd(libc::pollfd);

impl std::fmt::Debug for PollFd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("pollfd")
            .field("fd", &self.0.fd)
            .field("events", &self.0.events)
            .field("revents", &self.0.revents)
            .finish()
    }
}

/// An ordered set of file descriptors watched for input.
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<PollFd>,
}

impl PollSet {
    pub fn new() -> PollSet {
        PollSet { fds: Vec::new() }
    }

    /// Number of watched descriptors.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Starts watching `fd` for input. Watching a descriptor twice is a
    /// caller bug.
    pub fn insert(&mut self, fd: RawFd) {
        debug_assert!(!self.contains(fd), "fd {} already watched", fd);
        self.fds.push(PollFd(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }));
    }

    /// Stops watching `fd`. Unknown descriptors are ignored; removal during
    /// a readiness sweep only affects the next sweep.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(at) = self.fds.iter().position(|p| p.0.fd == fd) {
            self.fds.swap_remove(at);
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.fds.iter().any(|p| p.0.fd == fd)
    }

    /// Blocks until at least one descriptor is readable or has hung up, and
    /// returns those descriptors in set order.
    pub fn wait(&mut self) -> io::Result<Vec<RawFd>> {
        loop {
            let res = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr() as *mut libc::pollfd,
                    self.fds.len() as libc::nfds_t,
                    -1,
                )
            };
            if res == -1 {
                let err = io::Error::last_os_error();
                // poll is restarted after signal delivery; the arbiter's own
                // SIGCHLDs from exiting participants land here.
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }

            let ready: Vec<RawFd> = self
                .fds
                .iter()
                .filter(|p| p.0.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
                .map(|p| p.0.fd)
                .collect();
            if !ready.is_empty() {
                return Ok(ready);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_readable_end_only() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let (_c, d) = UnixStream::pair().unwrap();

        let mut set = PollSet::new();
        set.insert(b.as_raw_fd());
        set.insert(d.as_raw_fd());

        a.write_all(b"x").unwrap();
        let ready = set.wait().unwrap();
        assert_eq!(ready, vec![b.as_raw_fd()]);
    }

    #[test]
    fn hangup_counts_as_ready() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.insert(b.as_raw_fd());
        drop(a);
        assert_eq!(set.wait().unwrap(), vec![b.as_raw_fd()]);
    }

    #[test]
    fn removal_is_idempotent() {
        let (_a, b) = UnixStream::pair().unwrap();
        let mut set = PollSet::new();
        set.insert(b.as_raw_fd());
        set.remove(b.as_raw_fd());
        set.remove(b.as_raw_fd());
        assert!(set.is_empty());
    }
}
