//! The session server: global coordinator for one session.
//!
//! Owns the FIFO writer queue, the four-step write serialization state
//! machine, the barrier tally, and the startup gate. The state machine is
//! kept free of I/O: [`Session::handle`] consumes one inbound message and
//! appends the outbound traffic it implies, so the protocol can be driven
//! end-to-end by tests; [`run`] is the thin poll loop around it.

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, info, trace};

use crate::error::{DsmError, Result};
use crate::msg::{Msg, SessionId, SyncInfo};
use crate::net;
use crate::poll::PollSet;

/// Identifier of one arbiter connection.
pub type ConnId = RawFd;

/// Current step of the write serialization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ready,
    WaitStopAck,
    WaitSyncInfo,
    WaitSyncAck,
}

/// Traffic a handled message produces.
#[derive(Debug)]
pub enum Outbound {
    /// Send to one arbiter.
    To(ConnId, Msg),
    /// Broadcast to every arbiter except one.
    AllExcept(ConnId, Msg),
    /// Broadcast to every arbiter.
    All(Msg),
    /// The arbiter has left the session; close its connection.
    Drop(ConnId),
}

/// Coordinator state for one session.
///
/// Acknowledgement phases complete when every connected arbiter has acked
/// once *and* the summed participant counts cover everyone but the writer.
/// One arbiter's cohort ack can satisfy the count threshold while another
/// ack is still in flight, so the per-arbiter record is what makes the
/// step transition deterministic; a second ack from the same arbiter within
/// one phase is a protocol violation.
#[derive(Debug)]
pub struct Session {
    nproc: u32,
    step: Step,
    arbiters: Vec<ConnId>,
    writers: VecDeque<ConnId>,
    stopped: u32,
    synced: u32,
    stop_acked: Vec<ConnId>,
    sync_acked: Vec<ConnId>,
    waiting: u32,
    registered: u32,
    started: bool,
    next_gid: i32,
}

impl Session {
    pub fn new(nproc: u32) -> Session {
        assert!(nproc >= 2, "a session needs at least two participants");
        Session {
            nproc,
            step: Step::Ready,
            arbiters: Vec::new(),
            writers: VecDeque::new(),
            stopped: 0,
            synced: 0,
            stop_acked: Vec::new(),
            sync_acked: Vec::new(),
            waiting: 0,
            registered: 0,
            started: false,
            next_gid: 0,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Records a newly connected arbiter.
    pub fn connect(&mut self, id: ConnId) {
        self.arbiters.push(id);
    }

    /// Handles one message from arbiter `from`.
    ///
    /// A message that does not fit the current step, or arrives from a peer
    /// that may not send it, is a protocol violation: coordinator state is
    /// non-recoverable by design and the caller exits.
    pub fn handle(&mut self, from: ConnId, msg: Msg, out: &mut Vec<Outbound>) -> Result<()> {
        trace!("session: {} from arbiter {}", msg.name(), from);
        match msg {
            Msg::AddProc { pid } => self.on_add_proc(from, pid, out),
            Msg::SyncReq => self.on_sync_req(from, out),
            Msg::StopDone { count } => self.on_stop_done(from, count, out),
            Msg::SyncInfo(info) => self.on_sync_info(from, info, out),
            Msg::SyncDone { count } => self.on_sync_done(from, count, out),
            Msg::WaitBarr { count } => self.on_wait_barr(count, out),
            Msg::PrgmDone => {
                self.arbiters.retain(|&id| id != from);
                out.push(Outbound::Drop(from));
                Ok(())
            }
            other => Err(DsmError::protocol(format!(
                "{} is not an arbiter-to-server message",
                other.name()
            ))),
        }
    }

    fn on_add_proc(&mut self, from: ConnId, pid: i32, out: &mut Vec<Outbound>) -> Result<()> {
        if self.started {
            return Err(DsmError::protocol("registration after session start"));
        }
        let gid = self.next_gid;
        self.next_gid += 1;
        self.registered += 1;
        out.push(Outbound::To(from, Msg::SetGid { pid, gid }));
        debug!(
            "session: registered pid {} as gid {} ({}/{})",
            pid, gid, self.registered, self.nproc
        );

        // Startup gate: the initial check-ins form a one-shot barrier.
        if self.registered == self.nproc {
            info!(
                "session: all {} participants registered, releasing",
                self.nproc
            );
            self.started = true;
            out.push(Outbound::All(Msg::WaitDone));
        }
        Ok(())
    }

    fn on_sync_req(&mut self, from: ConnId, out: &mut Vec<Outbound>) -> Result<()> {
        self.writers.push_back(from);
        if self.writers.len() == 1 {
            if self.step != Step::Ready {
                return Err(DsmError::protocol("writer queue empty mid-cycle"));
            }
            out.push(Outbound::All(Msg::StopAll));
            self.step = Step::WaitStopAck;
        }
        Ok(())
    }

    fn record_ack(acked: &mut Vec<ConnId>, from: ConnId, what: &str) -> Result<()> {
        if acked.contains(&from) {
            return Err(DsmError::protocol(format!(
                "duplicate {} from arbiter {}",
                what, from
            )));
        }
        acked.push(from);
        Ok(())
    }

    fn on_stop_done(&mut self, from: ConnId, count: u32, out: &mut Vec<Outbound>) -> Result<()> {
        if self.step != Step::WaitStopAck {
            return Err(DsmError::protocol("STOP_DONE outside WAIT_STOP_ACK"));
        }
        Self::record_ack(&mut self.stop_acked, from, "STOP_DONE")?;
        self.stopped += count;
        debug!(
            "session: stop acks from {}/{} arbiters covering {} participants",
            self.stop_acked.len(),
            self.arbiters.len(),
            self.stopped
        );
        if self.stop_acked.len() == self.arbiters.len() && self.stopped >= self.nproc - 1 {
            let head = *self
                .writers
                .front()
                .ok_or_else(|| DsmError::protocol("stop acks without a queued writer"))?;
            out.push(Outbound::To(head, Msg::WriteOkay));
            self.stopped = 0;
            self.stop_acked.clear();
            self.step = Step::WaitSyncInfo;
        }
        Ok(())
    }

    fn on_sync_info(&mut self, from: ConnId, info: SyncInfo, out: &mut Vec<Outbound>) -> Result<()> {
        if self.step != Step::WaitSyncInfo {
            return Err(DsmError::protocol("SYNC_INFO outside WAIT_SYNC_INFO"));
        }
        if self.writers.front() != Some(&from) {
            return Err(DsmError::protocol("SYNC_INFO from a non-writer"));
        }
        out.push(Outbound::AllExcept(from, Msg::SyncInfo(info)));
        self.step = Step::WaitSyncAck;
        Ok(())
    }

    fn on_sync_done(&mut self, from: ConnId, count: u32, out: &mut Vec<Outbound>) -> Result<()> {
        if self.step != Step::WaitSyncAck {
            return Err(DsmError::protocol("SYNC_DONE outside WAIT_SYNC_ACK"));
        }
        Self::record_ack(&mut self.sync_acked, from, "SYNC_DONE")?;
        self.synced += count;
        if self.sync_acked.len() == self.arbiters.len() && self.synced >= self.nproc - 1 {
            self.writers.pop_front();
            self.synced = 0;
            self.sync_acked.clear();
            if let Some(&next) = self.writers.front() {
                // Chain straight into the next queued write.
                out.push(Outbound::To(next, Msg::WriteOkay));
                self.step = Step::WaitSyncInfo;
            } else {
                out.push(Outbound::All(Msg::ContAll));
                self.step = Step::Ready;
            }
        }
        Ok(())
    }

    fn on_wait_barr(&mut self, count: u32, out: &mut Vec<Outbound>) -> Result<()> {
        // The barrier tally is independent of the write cycle.
        self.waiting += count;
        debug!("session: {}/{} at barrier", self.waiting, self.nproc);
        if self.waiting >= self.nproc {
            out.push(Outbound::All(Msg::WaitDone));
            self.waiting = 0;
        }
        Ok(())
    }
}

/// Runtime options of a session server process.
#[derive(Debug, Clone)]
pub struct ServerOpts {
    pub sid: SessionId,
    pub nproc: u32,
    pub daemon_addr: String,
    pub daemon_port: u16,
}

/// Runs a session server until its last arbiter disconnects.
pub fn run(opts: &ServerOpts) -> Result<()> {
    let listener = net::listen_on(0)?;
    let port = listener.local_addr()?.port();
    info!("session server for \"{}\" on port {}", opts.sid, port);

    // Register the ephemeral port so the daemon can release parked arbiters.
    let mut daemon = net::connect(&opts.daemon_addr, opts.daemon_port)?;
    Msg::SetSession {
        sid: opts.sid,
        port: port as u32,
    }
    .write_to(&mut daemon)?;
    drop(daemon);

    let mut session = Session::new(opts.nproc);
    let mut conns: HashMap<ConnId, TcpStream> = HashMap::new();
    let mut pollset = PollSet::new();
    pollset.insert(listener.as_raw_fd());
    let mut seen_arbiter = false;
    let mut out = Vec::new();

    'outer: loop {
        for fd in pollset.wait()? {
            if fd == listener.as_raw_fd() {
                let (conn, addr) = listener.accept()?;
                debug!("session: arbiter connected from {}", addr);
                pollset.insert(conn.as_raw_fd());
                session.connect(conn.as_raw_fd());
                conns.insert(conn.as_raw_fd(), conn);
                seen_arbiter = true;
                continue;
            }
            let Some(conn) = conns.get_mut(&fd) else {
                continue; // dropped earlier in this sweep
            };
            let msg = Msg::read_from(conn).map_err(|err| {
                DsmError::protocol(format!("arbiter {} vanished mid-session: {}", fd, err))
            })?;

            out.clear();
            session.handle(fd, msg, &mut out)?;
            for action in out.drain(..) {
                match action {
                    Outbound::To(id, msg) => {
                        let conn = conns
                            .get_mut(&id)
                            .ok_or_else(|| DsmError::protocol("send to a gone arbiter"))?;
                        msg.write_to(conn)?;
                    }
                    Outbound::AllExcept(skip, msg) => {
                        for (&id, conn) in conns.iter_mut() {
                            if id != skip {
                                msg.write_to(conn)?;
                            }
                        }
                    }
                    Outbound::All(msg) => {
                        for conn in conns.values_mut() {
                            msg.write_to(conn)?;
                        }
                    }
                    Outbound::Drop(id) => {
                        pollset.remove(id);
                        conns.remove(&id);
                        info!("session: arbiter {} left ({} remain)", id, conns.len());
                        if seen_arbiter && conns.is_empty() {
                            break 'outer;
                        }
                    }
                }
            }
        }
    }

    // Tear the directory entry down so the sid can be reused.
    let mut daemon = net::connect(&opts.daemon_addr, opts.daemon_port)?;
    Msg::DelSession { sid: opts.sid }.write_to(&mut daemon)?;
    info!("session \"{}\" complete", opts.sid);
    Ok(())
}
