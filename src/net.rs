//! Socket plumbing shared by all components.
//!
//! Everything here is blocking: the protocol's frames are fixed-size and a
//! correct peer always completes a frame it has started, so the usual
//! partial-I/O machinery is unnecessary. The raw-descriptor variants exist
//! for the participant's fault handlers, which must perform frame I/O from
//! signal context without touching the `TcpStream` wrapper.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::RawFd;

use crate::msg::{Msg, FRAME_LEN};

/// Well-known TCP port of the session daemon.
pub const DAEMON_PORT: u16 = 4200;

/// Fixed per-host TCP port of the arbiter's participant listener.
pub const ARBITER_PORT: u16 = 4800;

/// Loopback address participants use to reach their arbiter.
pub const LOOPBACK: &str = "127.0.0.1";

/// Binds a listener on every interface at `port` (0 for ephemeral).
pub fn listen_on(port: u16) -> io::Result<TcpListener> {
    TcpListener::bind(("0.0.0.0", port))
}

/// Connects to `host:port`.
pub fn connect(host: &str, port: u16) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = err,
        }
    }
    Err(last)
}

/// Writes one whole frame to a raw descriptor, retrying on EINTR.
///
/// Async-signal-safe apart from the terminal error path.
pub fn send_frame_raw(fd: RawFd, frame: &[u8; FRAME_LEN]) -> io::Result<()> {
    let mut sent = 0;
    while sent < FRAME_LEN {
        let res = unsafe {
            libc::write(
                fd,
                frame[sent..].as_ptr() as *const libc::c_void,
                FRAME_LEN - sent,
            )
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        sent += res as usize;
    }
    Ok(())
}

/// Reads one whole frame from a raw descriptor, retrying on EINTR.
pub fn recv_frame_raw(fd: RawFd) -> io::Result<[u8; FRAME_LEN]> {
    let mut frame = [0u8; FRAME_LEN];
    let mut got = 0;
    while got < FRAME_LEN {
        let res = unsafe {
            libc::read(
                fd,
                frame[got..].as_mut_ptr() as *mut libc::c_void,
                FRAME_LEN - got,
            )
        };
        match res {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ))
            }
            r if r < 0 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            r => got += r as usize,
        }
    }
    Ok(frame)
}

/// Sends a message over a raw descriptor.
pub fn send_msg_raw(fd: RawFd, msg: &Msg) -> io::Result<()> {
    send_frame_raw(fd, &msg.encode())
}

/// Receives a message over a raw descriptor.
pub fn recv_msg_raw(fd: RawFd) -> io::Result<Msg> {
    let frame = recv_frame_raw(fd)?;
    Msg::decode(&frame).map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn raw_frame_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        send_msg_raw(a.as_raw_fd(), &Msg::SyncReq).unwrap();
        let msg = recv_msg_raw(b.as_raw_fd()).unwrap();
        assert_eq!(msg.name(), "SYNC_REQ");
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(a);
        let err = recv_msg_raw(b.as_raw_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
