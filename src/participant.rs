//! The participant runtime: the library an application links against.
//!
//! [`Participant::init`] performs the six-step startup dance (init
//! semaphore, shared object plus arbiter fork, registration, page
//! protection, fault handlers, startup gate) and the returned handle
//! exposes the shared page, the barrier, and teardown.
//!
//! A participant is single-threaded with respect to the runtime; stores
//! into the shared page synchronously run the whole write serialization
//! cycle inside the fault handlers before control returns.

use std::mem;
use std::net::TcpStream;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};
use nix::sys::mman::ProtFlags;
use nix::sys::signal::{raise, Signal};
use nix::unistd::{fork, ForkResult};

use crate::arbiter::{self, ArbiterOpts};
use crate::error::{DsmError, Result};
use crate::msg::{Msg, SessionId};
use crate::net;
use crate::shm::{InitSem, SharedRegion, INIT_SEM_NAME, SHM_NAME};
use crate::sync;

/// Coordinates of the session a participant joins.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub sid: SessionId,
    pub nproc: u32,
    pub daemon_addr: String,
    pub daemon_port: u16,
}

impl SessionConfig {
    pub fn new(sid: &str, nproc: u32) -> SessionConfig {
        SessionConfig {
            sid: SessionId::new(sid).expect("invalid session id"),
            nproc,
            daemon_addr: net::LOOPBACK.to_string(),
            daemon_port: net::DAEMON_PORT,
        }
    }
}

// The trap state is per-process; two handles cannot coexist.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A live membership in a DSM session.
#[derive(Debug)]
pub struct Participant {
    control: TcpStream,
    region: SharedRegion,
    gid: i32,
}

impl Participant {
    /// Joins (and on the first call per host, creates) the session.
    ///
    /// Blocks until every expected participant has registered and the
    /// session server has released the startup gate.
    pub fn init(config: &SessionConfig) -> Result<Participant> {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(DsmError::protocol("participant initialized twice"));
        }

        let init_sem = InitSem::open(INIT_SEM_NAME)?;
        let (region, created) = SharedRegion::open(SHM_NAME)?;

        if created {
            // We won the creation race: set the header up and fork the
            // per-host arbiter before anyone can block on it.
            region.init_header()?;
            let opts = ArbiterOpts {
                sid: config.sid,
                nproc: config.nproc,
                daemon_addr: config.daemon_addr.clone(),
                daemon_port: config.daemon_port,
            };
            match unsafe { fork() }.map_err(|err| DsmError::Io(err.into()))? {
                ForkResult::Child => {
                    let code = match arbiter::run(&opts, region, init_sem) {
                        Ok(()) => 0,
                        Err(err) => {
                            log::error!("arbiter: {}", err);
                            1
                        }
                    };
                    std::process::exit(code);
                }
                ForkResult::Parent { child } => {
                    debug!("forked arbiter as pid {}", child);
                }
            }
        }

        // The arbiter posts once per expected participant when it listens.
        init_sem.wait()?;

        let mut control = net::connect(net::LOOPBACK, net::ARBITER_PORT)?;
        let pid = std::process::id() as i32;
        Msg::AddProc { pid }.write_to(&mut control)?;

        let gid = match Msg::read_from(&mut control)? {
            Msg::SetGid { pid: for_pid, gid } if for_pid == pid => gid,
            other => {
                return Err(DsmError::protocol(format!(
                    "expected SET_GID, got {}",
                    other.name()
                )))
            }
        };
        info!("registered with the arbiter as gid {}", gid);

        // Arm the trap before the page becomes read-only.
        sync::install(control.as_raw_fd(), &region)?;
        region.protect_data(ProtFlags::PROT_READ)?;

        // Startup gate: application code begins only once everyone is in.
        match Msg::read_from(&mut control)? {
            Msg::WaitDone => {}
            other => {
                return Err(DsmError::protocol(format!(
                    "expected WAIT_DONE, got {}",
                    other.name()
                )))
            }
        }
        info!("session started");

        Ok(Participant { control, region, gid })
    }

    /// The global identifier the session server assigned to this process.
    pub fn gid(&self) -> i32 {
        self.gid
    }

    /// Usable size of the shared page.
    pub fn page_len(&self) -> usize {
        self.region.data_len()
    }

    /// Raw pointer to the shared page, for applications that need stores
    /// the typed accessors cannot express (e.g. single-instruction
    /// read-modify-writes, which stay atomic under the write protocol).
    pub fn page_ptr(&self) -> *mut u8 {
        self.region.data_ptr()
    }

    /// Reads a value from the shared page.
    pub fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + mem::size_of::<T>() <= self.page_len());
        unsafe { ptr::read_volatile(self.region.data_ptr().add(offset) as *const T) }
    }

    /// Writes a value into the shared page.
    ///
    /// The store faults, and the fault handlers run one full write
    /// serialization cycle before this returns: permission is acquired,
    /// the bytes are published session-wide, and this process is resumed.
    pub fn write<T: Copy>(&self, offset: usize, value: T) {
        assert!(offset + mem::size_of::<T>() <= self.page_len());
        unsafe { ptr::write_volatile(self.region.data_ptr().add(offset) as *mut T, value) }
    }

    /// Suspends until every participant in the session has arrived here.
    pub fn barrier(&mut self) -> Result<()> {
        Msg::WaitBarr { count: 1 }.write_to(&mut self.control)?;
        // The arbiter's SIGCONT upon WAIT_DONE resumes us.
        raise(Signal::SIGTSTP).map_err(|err| DsmError::Io(err.into()))?;
        Ok(())
    }

    /// Leaves the session: tells the arbiter, disarms the fault handlers,
    /// and drops the mapping.
    pub fn exit(mut self) -> Result<()> {
        Msg::PrgmDone.write_to(&mut self.control)?;
        sync::uninstall()?;
        INITIALIZED.store(false, Ordering::SeqCst);
        info!("left the session");
        Ok(())
    }
}
