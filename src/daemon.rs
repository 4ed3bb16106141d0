//! The session daemon: well-known rendezvous for session lookup.
//!
//! Maps session identifiers to the port of the per-session server. The
//! first `GET_SESSION` for an identifier spawns a session server; arbiters
//! that ask before that server has reported its port are parked and
//! released in one sweep when `SET_SESSION` arrives. One fixed-size request
//! per connection, one poll loop, no worker threads.

use std::collections::HashMap;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::process::{Child, Command};

use log::{debug, info, warn};

use crate::error::{DsmError, Result};
use crate::msg::{Msg, SessionId};
use crate::net;
use crate::poll::PollSet;

/// Opaque handle of one parked requester connection.
pub type ConnToken = u64;

/// What the directory wants done after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum DirAction {
    /// Launch a session server for a freshly created entry.
    Spawn { sid: SessionId, nproc: u32 },
    /// Send `SET_SESSION(sid, port)` to a requester and close it.
    Release {
        to: ConnToken,
        sid: SessionId,
        port: u32,
    },
    /// Close a parked requester without a reply (abnormal teardown).
    Close(ConnToken),
}

#[derive(Debug)]
struct DirEntry {
    port: Option<u32>,
    nproc: u32,
    pending: Vec<ConnToken>,
}

/// The session directory. At most one entry per identifier.
#[derive(Debug, Default)]
pub struct Directory {
    entries: HashMap<SessionId, DirEntry>,
}

impl Directory {
    pub fn new() -> Directory {
        Directory {
            entries: HashMap::new(),
        }
    }

    pub fn contains(&self, sid: &SessionId) -> bool {
        self.entries.contains_key(sid)
    }

    /// Handles one request from connection `from`.
    pub fn handle(&mut self, from: ConnToken, msg: Msg) -> Result<Vec<DirAction>> {
        match msg {
            Msg::GetSession { sid, nproc } => Ok(self.on_get(from, sid, nproc)),
            Msg::SetSession { sid, port } => self.on_set(sid, port),
            Msg::DelSession { sid } => Ok(self.on_del(sid)),
            other => Err(DsmError::protocol(format!(
                "{} is not a directory request",
                other.name()
            ))),
        }
    }

    fn on_get(&mut self, from: ConnToken, sid: SessionId, nproc: u32) -> Vec<DirAction> {
        match self.entries.get_mut(&sid) {
            None => {
                debug!("directory: creating session \"{}\" for {} procs", sid, nproc);
                self.entries.insert(
                    sid,
                    DirEntry {
                        port: None,
                        nproc,
                        pending: vec![from],
                    },
                );
                vec![DirAction::Spawn { sid, nproc }]
            }
            Some(entry) => match entry.port {
                // Server still booting: park the requester.
                None => {
                    entry.pending.push(from);
                    vec![]
                }
                Some(port) => vec![DirAction::Release { to: from, sid, port }],
            },
        }
    }

    fn on_set(&mut self, sid: SessionId, port: u32) -> Result<Vec<DirAction>> {
        let entry = self
            .entries
            .get_mut(&sid)
            .ok_or_else(|| DsmError::protocol(format!("SET_SESSION for unknown \"{}\"", sid)))?;
        if entry.port.replace(port).is_some() {
            // Duplicate registration replaces the port.
            warn!("directory: \"{}\" re-registered on port {}", sid, port);
        }
        info!("directory: session \"{}\" ready on port {}", sid, port);
        Ok(entry
            .pending
            .drain(..)
            .map(|to| DirAction::Release { to, sid, port })
            .collect())
    }

    fn on_del(&mut self, sid: SessionId) -> Vec<DirAction> {
        match self.entries.remove(&sid) {
            None => vec![],
            Some(entry) => {
                info!("directory: session \"{}\" removed", sid);
                if !entry.pending.is_empty() {
                    warn!(
                        "directory: \"{}\" deleted with {} parked requesters",
                        sid,
                        entry.pending.len()
                    );
                }
                entry.pending.into_iter().map(DirAction::Close).collect()
            }
        }
    }
}

/// Launches `dsm-server` (expected next to the current executable).
fn spawn_server(sid: &SessionId, nproc: u32, daemon_port: u16) -> io::Result<Child> {
    let server = std::env::current_exe()?.with_file_name("dsm-server");
    Command::new(server)
        .arg("--sid")
        .arg(sid.to_string())
        .arg("--nproc")
        .arg(nproc.to_string())
        .arg("--daemon-addr")
        .arg(net::LOOPBACK)
        .arg("--daemon-port")
        .arg(daemon_port.to_string())
        .spawn()
}

/// Runs the daemon forever on `port`.
pub fn run(port: u16) -> Result<()> {
    let listener: TcpListener = net::listen_on(port)?;
    info!("session daemon on port {}", port);

    let mut directory = Directory::new();
    let mut parked: HashMap<ConnToken, TcpStream> = HashMap::new();
    let mut servers: HashMap<SessionId, Child> = HashMap::new();
    let mut next_token: ConnToken = 0;

    let mut pollset = PollSet::new();
    pollset.insert(listener.as_raw_fd());

    loop {
        pollset.wait()?;
        let (mut conn, addr) = listener.accept()?;
        debug!("directory: request from {}", addr);

        // One fixed-size request per connection, so this read is bounded.
        let msg = Msg::read_from(&mut conn)?;
        let token = next_token;
        next_token += 1;

        let actions = directory.handle(token, msg)?;
        let mut still_parked = true;
        for action in actions {
            match action {
                DirAction::Spawn { sid, nproc } => {
                    let child = spawn_server(&sid, nproc, port)?;
                    servers.insert(sid, child);
                }
                DirAction::Release { to, sid, port } => {
                    let reply = Msg::SetSession { sid, port };
                    if to == token {
                        reply.write_to(&mut conn)?;
                        still_parked = false;
                    } else if let Some(mut conn) = parked.remove(&to) {
                        reply.write_to(&mut conn)?;
                    }
                }
                DirAction::Close(to) => {
                    if to == token {
                        still_parked = false;
                    } else {
                        parked.remove(&to);
                    }
                }
            }
        }

        match msg {
            // Only unanswered GET_SESSION requesters stay parked.
            Msg::GetSession { .. } if still_parked => {
                parked.insert(token, conn);
            }
            Msg::DelSession { sid } => {
                // The session server exits right after DEL_SESSION.
                if let Some(mut child) = servers.remove(&sid) {
                    let _ = child.wait();
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s).unwrap()
    }

    #[test]
    fn first_get_spawns_and_parks() {
        let mut dir = Directory::new();
        let actions = dir
            .handle(
                1,
                Msg::GetSession {
                    sid: sid("alpha"),
                    nproc: 2,
                },
            )
            .unwrap();
        assert_eq!(
            actions,
            vec![DirAction::Spawn {
                sid: sid("alpha"),
                nproc: 2
            }]
        );
        assert!(dir.contains(&sid("alpha")));
    }

    #[test]
    fn set_session_flushes_the_queue_atomically() {
        let mut dir = Directory::new();
        dir.handle(1, Msg::GetSession { sid: sid("a"), nproc: 4 })
            .unwrap();
        // Two more arbiters ask before the server is up.
        assert!(dir
            .handle(2, Msg::GetSession { sid: sid("a"), nproc: 4 })
            .unwrap()
            .is_empty());
        assert!(dir
            .handle(3, Msg::GetSession { sid: sid("a"), nproc: 4 })
            .unwrap()
            .is_empty());

        let actions = dir
            .handle(9, Msg::SetSession { sid: sid("a"), port: 5000 })
            .unwrap();
        let released: Vec<ConnToken> = actions
            .iter()
            .map(|a| match a {
                DirAction::Release { to, port: 5000, .. } => *to,
                other => panic!("unexpected action {:?}", other),
            })
            .collect();
        assert_eq!(released, vec![1, 2, 3]);
    }

    #[test]
    fn late_get_is_answered_immediately() {
        let mut dir = Directory::new();
        dir.handle(1, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        dir.handle(9, Msg::SetSession { sid: sid("a"), port: 7001 })
            .unwrap();

        let actions = dir
            .handle(5, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        assert_eq!(
            actions,
            vec![DirAction::Release {
                to: 5,
                sid: sid("a"),
                port: 7001
            }]
        );
    }

    #[test]
    fn duplicate_set_replaces_the_port() {
        let mut dir = Directory::new();
        dir.handle(1, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        dir.handle(9, Msg::SetSession { sid: sid("a"), port: 7001 })
            .unwrap();
        dir.handle(9, Msg::SetSession { sid: sid("a"), port: 7002 })
            .unwrap();
        let actions = dir
            .handle(5, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        assert!(matches!(
            actions[..],
            [DirAction::Release { port: 7002, .. }]
        ));
    }

    #[test]
    fn del_then_get_starts_fresh() {
        let mut dir = Directory::new();
        dir.handle(1, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        dir.handle(9, Msg::SetSession { sid: sid("a"), port: 7001 })
            .unwrap();
        assert!(dir.handle(9, Msg::DelSession { sid: sid("a") }).unwrap().is_empty());
        assert!(!dir.contains(&sid("a")));

        // A subsequent lookup spawns a fresh server.
        let actions = dir
            .handle(2, Msg::GetSession { sid: sid("a"), nproc: 2 })
            .unwrap();
        assert!(matches!(actions[..], [DirAction::Spawn { .. }]));
    }

    #[test]
    fn set_for_unknown_session_is_fatal() {
        let mut dir = Directory::new();
        assert!(dir
            .handle(9, Msg::SetSession { sid: sid("ghost"), port: 1 })
            .is_err());
    }

    #[test]
    fn non_directory_traffic_is_fatal() {
        let mut dir = Directory::new();
        assert!(dir.handle(1, Msg::SyncReq).is_err());
    }
}
