//! Drives a real session server over sockets: a scripted "daemon" accepts
//! its registration and scripted "arbiters" walk it through registration,
//! write cycles, a barrier, and shutdown.

use std::net::{TcpListener, TcpStream};
use std::thread;

use dsm::msg::{Msg, SessionId, SyncInfo};
use dsm::server::{run, ServerOpts};

mod util;
use util::{expect, init};

struct Harness {
    daemon: TcpListener,
    server: thread::JoinHandle<dsm::Result<()>>,
    port: u16,
}

/// Starts a server thread for `nproc` and waits for its port report.
fn start_server(sid: &str, nproc: u32) -> Harness {
    let daemon = TcpListener::bind("127.0.0.1:0").unwrap();
    let daemon_port = daemon.local_addr().unwrap().port();
    let opts = ServerOpts {
        sid: SessionId::new(sid).unwrap(),
        nproc,
        daemon_addr: "127.0.0.1".to_string(),
        daemon_port,
    };
    let server = thread::spawn(move || run(&opts));

    let (mut conn, _) = daemon.accept().unwrap();
    let port = match Msg::read_from(&mut conn).unwrap() {
        Msg::SetSession { port, .. } => port as u16,
        other => panic!("expected SET_SESSION, got {}", other.name()),
    };
    Harness {
        daemon,
        server,
        port,
    }
}

impl Harness {
    fn connect_arbiter(&self) -> TcpStream {
        TcpStream::connect(("127.0.0.1", self.port)).unwrap()
    }

    /// Waits for DEL_SESSION and the server thread.
    fn finish(self) {
        let (mut conn, _) = self.daemon.accept().unwrap();
        expect(&mut conn, "DEL_SESSION");
        self.server.join().unwrap().unwrap();
    }
}

#[test]
fn single_arbiter_session() {
    init();
    let harness = start_server("flow-one", 2);
    let mut arb = harness.connect_arbiter();

    // Registration: dense gids, then the startup gate releases.
    Msg::AddProc { pid: 501 }.write_to(&mut arb).unwrap();
    match expect(&mut arb, "SET_GID") {
        Msg::SetGid { pid, gid } => assert_eq!((pid, gid), (501, 0)),
        _ => unreachable!(),
    }
    Msg::AddProc { pid: 502 }.write_to(&mut arb).unwrap();
    match expect(&mut arb, "SET_GID") {
        Msg::SetGid { pid, gid } => assert_eq!((pid, gid), (502, 1)),
        _ => unreachable!(),
    }
    expect(&mut arb, "WAIT_DONE");

    // One write: exactly one four-step cycle.
    Msg::SyncReq.write_to(&mut arb).unwrap();
    expect(&mut arb, "STOP_ALL");
    Msg::StopDone { count: 2 }.write_to(&mut arb).unwrap();
    expect(&mut arb, "WRITE_OKAY");
    Msg::SyncInfo(SyncInfo::new(16, &[7, 7, 7, 7]))
        .write_to(&mut arb)
        .unwrap();
    Msg::SyncDone { count: 2 }.write_to(&mut arb).unwrap();
    expect(&mut arb, "CONT_ALL");

    // Barrier releases at the second arrival and resets.
    Msg::WaitBarr { count: 1 }.write_to(&mut arb).unwrap();
    Msg::WaitBarr { count: 1 }.write_to(&mut arb).unwrap();
    expect(&mut arb, "WAIT_DONE");

    // Goodbye: the server should deregister at the daemon.
    Msg::PrgmDone.write_to(&mut arb).unwrap();
    drop(arb);
    harness.finish();
}

#[test]
fn remote_arbiters_see_the_writers_bytes() {
    init();
    let harness = start_server("flow-two", 3);
    let mut arb1 = harness.connect_arbiter();
    let mut arb2 = harness.connect_arbiter();

    // Cohorts: two participants behind arb1, one behind arb2.
    Msg::AddProc { pid: 601 }.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "SET_GID");
    Msg::AddProc { pid: 602 }.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "SET_GID");
    Msg::AddProc { pid: 603 }.write_to(&mut arb2).unwrap();
    expect(&mut arb2, "SET_GID");
    expect(&mut arb1, "WAIT_DONE");
    expect(&mut arb2, "WAIT_DONE");

    // arb1 hosts the writer.
    Msg::SyncReq.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "STOP_ALL");
    expect(&mut arb2, "STOP_ALL");
    Msg::StopDone { count: 2 }.write_to(&mut arb1).unwrap();
    Msg::StopDone { count: 1 }.write_to(&mut arb2).unwrap();
    expect(&mut arb1, "WRITE_OKAY");

    // The writer's window goes to arb2 only; its own arbiter acks for it.
    Msg::SyncInfo(SyncInfo::new(0, &[1, 2, 3, 4]))
        .write_to(&mut arb1)
        .unwrap();
    Msg::SyncDone { count: 2 }.write_to(&mut arb1).unwrap();
    match expect(&mut arb2, "SYNC_INFO") {
        Msg::SyncInfo(info) => {
            assert_eq!(info.offset, 0);
            assert_eq!(info.bytes(), &[1, 2, 3, 4]);
        }
        _ => unreachable!(),
    }
    Msg::SyncDone { count: 1 }.write_to(&mut arb2).unwrap();
    expect(&mut arb1, "CONT_ALL");
    expect(&mut arb2, "CONT_ALL");

    Msg::PrgmDone.write_to(&mut arb1).unwrap();
    drop(arb1);
    Msg::PrgmDone.write_to(&mut arb2).unwrap();
    drop(arb2);
    harness.finish();
}

#[test]
fn writer_queue_is_served_in_arrival_order() {
    init();
    let harness = start_server("flow-fair", 2);
    let mut arb1 = harness.connect_arbiter();
    let mut arb2 = harness.connect_arbiter();

    Msg::AddProc { pid: 701 }.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "SET_GID");
    Msg::AddProc { pid: 702 }.write_to(&mut arb2).unwrap();
    expect(&mut arb2, "SET_GID");
    expect(&mut arb1, "WAIT_DONE");
    expect(&mut arb2, "WAIT_DONE");

    // Both want to write; arb1's request lands first.
    Msg::SyncReq.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "STOP_ALL");
    expect(&mut arb2, "STOP_ALL");
    Msg::SyncReq.write_to(&mut arb2).unwrap();
    Msg::StopDone { count: 1 }.write_to(&mut arb1).unwrap();
    Msg::StopDone { count: 1 }.write_to(&mut arb2).unwrap();
    expect(&mut arb1, "WRITE_OKAY");

    Msg::SyncInfo(SyncInfo::new(0, &[0xaa]))
        .write_to(&mut arb1)
        .unwrap();
    Msg::SyncDone { count: 1 }.write_to(&mut arb1).unwrap();
    expect(&mut arb2, "SYNC_INFO");
    Msg::SyncDone { count: 1 }.write_to(&mut arb2).unwrap();

    // The second writer chains straight in, before any CONT_ALL.
    expect(&mut arb2, "WRITE_OKAY");
    Msg::SyncInfo(SyncInfo::new(1, &[0xbb]))
        .write_to(&mut arb2)
        .unwrap();
    Msg::SyncDone { count: 1 }.write_to(&mut arb2).unwrap();
    expect(&mut arb1, "SYNC_INFO");
    Msg::SyncDone { count: 1 }.write_to(&mut arb1).unwrap();
    expect(&mut arb1, "CONT_ALL");
    expect(&mut arb2, "CONT_ALL");

    Msg::PrgmDone.write_to(&mut arb1).unwrap();
    drop(arb1);
    Msg::PrgmDone.write_to(&mut arb2).unwrap();
    drop(arb2);
    harness.finish();
}
