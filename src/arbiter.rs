//! The arbiter: per-host multiplexer between local participants and the
//! session server.
//!
//! Forked by the first participant on a host. Owns the local half of the
//! protocol: the process table, the local writer FIFO, SIGTSTP/SIGCONT
//! delivery, and application of remote writes to the local shared page.
//! One poll loop over the participant listener, the server socket, and one
//! socket per registered participant; every message is handled to
//! completion before the next is read.

use std::collections::{HashMap, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, info, trace, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::error::{DsmError, Result};
use crate::msg::{Msg, SessionId, SyncInfo};
use crate::net;
use crate::poll::PollSet;
use crate::ptab::ProcTable;
use crate::shm::{InitSem, SharedRegion, INIT_SEM_NAME, SHM_NAME};

/// Session coordinates an arbiter needs at startup.
#[derive(Debug, Clone)]
pub struct ArbiterOpts {
    pub sid: SessionId,
    pub nproc: u32,
    pub daemon_addr: String,
    pub daemon_port: u16,
}

/// Marks every live entry stopped; returns the pids to signal.
///
/// Entries already stopped keep their state; waiting entries are marked but
/// not signalled, they are already suspended at a barrier.
fn stop_all(table: &mut ProcTable) -> Vec<i32> {
    let mut pids = Vec::new();
    for proc in table.iter_mut() {
        if proc.flags.stopped {
            continue;
        }
        proc.flags.stopped = true;
        if !proc.flags.waiting {
            pids.push(proc.pid);
        }
    }
    pids
}

/// Clears the stop flag on everything except queued writers; returns the
/// pids to resume. Waiting entries stay suspended until `WAIT_DONE`.
fn cont_all(table: &mut ProcTable) -> Vec<i32> {
    let mut pids = Vec::new();
    for proc in table.iter_mut() {
        if proc.flags.queued {
            continue;
        }
        proc.flags.stopped = false;
        if !proc.flags.waiting {
            pids.push(proc.pid);
        }
    }
    pids
}

/// Clears the waiting flag everywhere; returns the pids to resume (those
/// not also stopped by a write cycle).
fn release_waiting(table: &mut ProcTable) -> Vec<i32> {
    let mut pids = Vec::new();
    for proc in table.iter_mut() {
        proc.flags.waiting = false;
        if !proc.flags.stopped {
            pids.push(proc.pid);
        }
    }
    pids
}

struct Arbiter {
    opts: ArbiterOpts,
    region: SharedRegion,
    table: ProcTable,
    writers: VecDeque<RawFd>,
    started: bool,
    server: TcpStream,
    participants: HashMap<RawFd, TcpStream>,
    pollset: PollSet,
    alive: bool,
}

impl Arbiter {
    fn signal(&self, pid: i32, sig: Signal) -> Result<()> {
        trace!("arbiter: {} -> pid {}", sig, pid);
        kill(Pid::from_raw(pid), sig)
            .map_err(|err| DsmError::protocol(format!("couldn't signal pid {}: {}", pid, err)))
    }

    fn signal_each(&self, pids: &[i32], sig: Signal) -> Result<()> {
        for &pid in pids {
            self.signal(pid, sig)?;
        }
        Ok(())
    }

    fn send_server(&mut self, msg: &Msg) -> Result<()> {
        msg.write_to(&mut self.server)?;
        Ok(())
    }

    fn send_participant(&mut self, fd: RawFd, msg: &Msg) -> Result<()> {
        let conn = self
            .participants
            .get_mut(&fd)
            .ok_or_else(|| DsmError::protocol(format!("no participant on fd {}", fd)))?;
        msg.write_to(conn)?;
        Ok(())
    }

    /// Messages from the session server.
    fn on_server_msg(&mut self, msg: Msg) -> Result<()> {
        trace!("arbiter: {} from server", msg.name());
        match msg {
            Msg::StopAll => {
                let pids = stop_all(&mut self.table);
                self.signal_each(&pids, Signal::SIGTSTP)?;
                debug!("arbiter: stopped {} processes", pids.len());
                let count = self.table.len() as u32;
                self.send_server(&Msg::StopDone { count })
            }
            Msg::ContAll => {
                let pids = cont_all(&mut self.table);
                self.signal_each(&pids, Signal::SIGCONT)?;
                debug!("arbiter: resumed {} processes", pids.len());
                Ok(())
            }
            Msg::WaitDone => self.on_wait_done(),
            Msg::WriteOkay => {
                let head = *self
                    .writers
                    .front()
                    .ok_or_else(|| DsmError::protocol("WRITE_OKAY without a queued writer"))?;
                self.send_participant(head, &Msg::WriteOkay)
            }
            Msg::SyncInfo(info) => {
                // A remote writer's bytes: land them, then ack our cohort.
                self.region.apply(info.offset, info.bytes())?;
                let count = self.table.len() as u32;
                self.send_server(&Msg::SyncDone { count })
            }
            Msg::SetGid { pid, gid } => {
                let fd = {
                    let proc = self.table.find_pid_mut(pid).ok_or_else(|| {
                        DsmError::protocol(format!("SET_GID for unknown pid {}", pid))
                    })?;
                    proc.gid = gid;
                    proc.fd
                };
                self.send_participant(fd, &Msg::SetGid { pid, gid })
            }
            other => Err(DsmError::protocol(format!(
                "{} is not a server-to-arbiter message",
                other.name()
            ))),
        }
    }

    fn on_wait_done(&mut self) -> Result<()> {
        if !self.started {
            // The startup gate: everyone has registered. The names are no
            // longer needed, new mappings are refused from here on.
            info!("arbiter: session started, releasing {} processes", self.table.len());
            self.started = true;
            SharedRegion::unlink(SHM_NAME)?;
            InitSem::unlink(INIT_SEM_NAME)?;
            let fds: Vec<RawFd> = self.participants.keys().copied().collect();
            for fd in fds {
                self.send_participant(fd, &Msg::WaitDone)?;
            }
        }
        let pids = release_waiting(&mut self.table);
        self.signal_each(&pids, Signal::SIGCONT)?;
        Ok(())
    }

    /// Messages from a local participant.
    fn on_participant_msg(&mut self, fd: RawFd, msg: Msg) -> Result<()> {
        trace!("arbiter: {} from participant fd {}", msg.name(), fd);
        match msg {
            Msg::AddProc { pid } => {
                if self.started {
                    return Err(DsmError::protocol("registration after session start"));
                }
                if !self.table.register(fd, pid) {
                    return Err(DsmError::protocol("duplicate registration"));
                }
                // Everyone waits at the startup gate first.
                self.table.get_mut(fd).unwrap().flags.waiting = true;
                debug!("arbiter: registered pid {} on fd {}", pid, fd);
                self.send_server(&Msg::AddProc { pid })
            }
            Msg::SyncReq => {
                let proc = self
                    .table
                    .get_mut(fd)
                    .ok_or_else(|| DsmError::protocol("SYNC_REQ from unregistered process"))?;
                // The writer blocks in its fault handler; mark it stopped
                // so STOP_ALL doesn't signal it, and queue it locally.
                proc.flags.stopped = true;
                proc.flags.queued = true;
                self.writers.push_back(fd);
                self.send_server(&Msg::SyncReq)
            }
            Msg::SyncInfo(info) => self.on_writer_sync_info(fd, info),
            Msg::WaitBarr { .. } => {
                let proc = self
                    .table
                    .get_mut(fd)
                    .ok_or_else(|| DsmError::protocol("WAIT_BARR from unregistered process"))?;
                proc.flags.waiting = true;
                self.send_server(&Msg::WaitBarr { count: 1 })
            }
            Msg::PrgmDone => self.on_prgm_done(fd),
            other => Err(DsmError::protocol(format!(
                "{} is not a participant-to-arbiter message",
                other.name()
            ))),
        }
    }

    fn on_writer_sync_info(&mut self, fd: RawFd, info: SyncInfo) -> Result<()> {
        if self.writers.front() != Some(&fd) {
            return Err(DsmError::protocol("SYNC_INFO from a non-head writer"));
        }
        self.writers.pop_front();
        self.table
            .get_mut(fd)
            .ok_or_else(|| DsmError::protocol("writer missing from table"))?
            .flags
            .queued = false;

        self.send_server(&Msg::SyncInfo(info))?;
        // Our page already holds the writer's bytes; ack the local cohort
        // so the server's sync tally can close over every arbiter.
        let count = self.table.len() as u32;
        self.send_server(&Msg::SyncDone { count })
    }

    fn on_prgm_done(&mut self, fd: RawFd) -> Result<()> {
        self.pollset.remove(fd);
        self.participants.remove(&fd);
        let gone = self
            .table
            .unregister(fd)
            .ok_or_else(|| DsmError::protocol("PRGM_DONE from unregistered process"))?;
        info!(
            "arbiter: pid {} (gid {}) left, {} remain",
            gone.pid,
            gone.gid,
            self.table.len()
        );
        if self.table.is_empty() {
            // Say goodbye for the whole host and wind down.
            self.send_server(&Msg::PrgmDone)?;
            self.alive = false;
        }
        Ok(())
    }
}

/// Queries the daemon for the session server's address and connects to it.
fn connect_server(opts: &ArbiterOpts) -> Result<TcpStream> {
    let mut daemon = net::connect(&opts.daemon_addr, opts.daemon_port)?;
    Msg::GetSession {
        sid: opts.sid,
        nproc: opts.nproc,
    }
    .write_to(&mut daemon)?;

    // The daemon parks us until the session server has reported in.
    let reply = Msg::read_from(&mut daemon)?;
    let port = match reply {
        Msg::SetSession { sid, port } if sid == opts.sid => port,
        other => {
            return Err(DsmError::protocol(format!(
                "expected SET_SESSION from daemon, got {}",
                other.name()
            )))
        }
    };
    drop(daemon);

    info!("arbiter: session \"{}\" is on port {}", opts.sid, port);
    Ok(net::connect(&opts.daemon_addr, port as u16)?)
}

/// Runs the arbiter until its last participant has exited.
///
/// `region` and `init_sem` are inherited from the forking participant:
/// the mapping is shared, and the semaphore is posted once per expected
/// participant as soon as the listener is ready.
pub fn run(opts: &ArbiterOpts, region: SharedRegion, init_sem: InitSem) -> Result<()> {
    let server = connect_server(opts)?;
    let listener: TcpListener = net::listen_on(net::ARBITER_PORT)?;
    info!(
        "arbiter: listening on port {} for {} processes",
        net::ARBITER_PORT,
        opts.nproc
    );

    for _ in 0..opts.nproc {
        init_sem.post()?;
    }

    let mut pollset = PollSet::new();
    pollset.insert(listener.as_raw_fd());
    pollset.insert(server.as_raw_fd());

    let mut arbiter = Arbiter {
        opts: opts.clone(),
        region,
        table: ProcTable::new(),
        writers: VecDeque::new(),
        started: false,
        server,
        participants: HashMap::new(),
        pollset,
        alive: true,
    };

    while arbiter.alive {
        for fd in arbiter.pollset.wait()? {
            if fd == listener.as_raw_fd() {
                let (conn, addr) = listener.accept()?;
                if arbiter.started {
                    // Late joiner: the membership is fixed at startup.
                    warn!("arbiter: refusing connection from {} after start", addr);
                    continue;
                }
                debug!("arbiter: new participant connection from {}", addr);
                arbiter.pollset.insert(conn.as_raw_fd());
                arbiter.participants.insert(conn.as_raw_fd(), conn);
                continue;
            }

            if fd == arbiter.server.as_raw_fd() {
                let msg = Msg::read_from(&mut arbiter.server).map_err(|err| {
                    DsmError::protocol(format!("lost the session server: {}", err))
                })?;
                arbiter.on_server_msg(msg)?;
                continue;
            }

            let Some(conn) = arbiter.participants.get_mut(&fd) else {
                continue; // unregistered in this sweep
            };
            let msg = Msg::read_from(conn).map_err(|err| {
                DsmError::protocol(format!("lost participant fd {}: {}", fd, err))
            })?;
            arbiter.on_participant_msg(fd, msg)?;

            if !arbiter.alive {
                break;
            }
        }
    }

    info!("arbiter: session \"{}\" done on this host", arbiter.opts.sid);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(entries: &[(RawFd, i32)]) -> ProcTable {
        let mut table = ProcTable::new();
        for &(fd, pid) in entries {
            table.register(fd, pid);
        }
        table
    }

    #[test]
    fn stop_all_skips_waiting_and_stopped() {
        let mut table = table_of(&[(3, 30), (4, 40), (5, 50)]);
        table.get_mut(4).unwrap().flags.waiting = true;
        table.get_mut(5).unwrap().flags.stopped = true;

        let pids = stop_all(&mut table);
        assert_eq!(pids, vec![30]);
        // All live entries end up marked stopped regardless.
        assert!(table.iter().all(|p| p.flags.stopped));
    }

    #[test]
    fn cont_all_keeps_writers_suspended() {
        let mut table = table_of(&[(3, 30), (4, 40)]);
        for proc in table.iter_mut() {
            proc.flags.stopped = true;
        }
        table.get_mut(4).unwrap().flags.queued = true;

        let pids = cont_all(&mut table);
        assert_eq!(pids, vec![30]);
        assert!(!table.get(3).unwrap().flags.stopped);
        assert!(table.get(4).unwrap().flags.stopped);
    }

    #[test]
    fn wait_done_releases_only_unstopped() {
        let mut table = table_of(&[(3, 30), (4, 40)]);
        for proc in table.iter_mut() {
            proc.flags.waiting = true;
        }
        table.get_mut(4).unwrap().flags.stopped = true;

        let pids = release_waiting(&mut table);
        assert_eq!(pids, vec![30]);
        assert!(table.iter().all(|p| !p.flags.waiting));
    }
}
