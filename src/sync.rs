//! The write-fault trap mechanism.
//!
//! The shared data page is mapped read-only in every participant. An
//! ordinary store into it therefore faults twice, and the runtime gets
//! control on both sides of the store:
//!
//! 1. SIGSEGV, *before* the store commits: take the local I/O semaphore,
//!    ask the arbiter for write permission and block until `WRITE_OKAY`,
//!    then decode the faulting instruction, plant a UD2 trap immediately
//!    after it, open the page for writing, and let the CPU retry the store.
//! 2. SIGILL at the trap site, *after* the store committed: restore the
//!    patched bytes, close the page again, release the semaphore, publish
//!    the written window as `SYNC_INFO`, and self-suspend until the arbiter
//!    resumes us once the cycle has completed everywhere.
//!
//! Handler state lives in statics: a participant is single-threaded with
//! respect to the runtime, and the I/O semaphore guarantees that at most
//! one fault pair is in flight locally, so the trap slot is exclusive while
//! armed. Both handlers run short straight-line state machines and treat
//! every unexpected condition as fatal to the process.

use std::cell::UnsafeCell;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::decode::{InsnDecoder, MAX_INSN_LEN};
use crate::msg::{Msg, SyncInfo};
use crate::net;
use crate::shm::{page_size, SharedRegion};

/// The x86-64 undefined instruction planted at the trap site.
pub const UD2: [u8; UD2_LEN] = [0x0f, 0x0b];

/// Length of the UD2 opcode sequence.
pub const UD2_LEN: usize = 2;

/// Cell for state only ever touched by this thread or its signal handlers.
struct HandlerCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for HandlerCell<T> {}

impl<T> HandlerCell<T> {
    const fn new(value: T) -> HandlerCell<T> {
        HandlerCell(UnsafeCell::new(value))
    }

    fn get(&self) -> *mut T {
        self.0.get()
    }
}

/// State of one armed trap, created by the first fault and consumed by the
/// second. The buffer holds original text bytes iff the trap is armed.
struct TrapState {
    site: *mut u8,
    saved: [u8; UD2_LEN],
    fault: *mut u8,
    width: usize,
}

static CONTROL_FD: AtomicI32 = AtomicI32::new(-1);
static DATA_BASE: AtomicPtr<u8> = AtomicPtr::new(ptr::null_mut());
static DATA_LEN: AtomicUsize = AtomicUsize::new(0);
static IO_SEM: AtomicPtr<libc::sem_t> = AtomicPtr::new(ptr::null_mut());
static DECODER: HandlerCell<Option<InsnDecoder>> = HandlerCell::new(None);
static TRAP: HandlerCell<Option<TrapState>> = HandlerCell::new(None);

/// Wires the fault handlers up for this process.
///
/// `control` is the participant's arbiter socket; the handlers perform
/// blocking frame I/O on it directly.
pub fn install(control: RawFd, region: &SharedRegion) -> io::Result<()> {
    CONTROL_FD.store(control, Ordering::Relaxed);
    DATA_BASE.store(region.data_ptr(), Ordering::Relaxed);
    DATA_LEN.store(region.data_len(), Ordering::Relaxed);
    IO_SEM.store(region.io_sem(), Ordering::Relaxed);
    unsafe {
        *DECODER.get() = Some(InsnDecoder::new()?);
    }

    let segv = SigAction::new(
        SigHandler::SigAction(on_write_fault),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    let ill = SigAction::new(
        SigHandler::SigAction(on_trap),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGSEGV, &segv)?;
        sigaction(Signal::SIGILL, &ill)?;
    }
    Ok(())
}

/// Restores default fault dispositions (participant teardown).
pub fn uninstall() -> io::Result<()> {
    let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGSEGV, &dfl)?;
        sigaction(Signal::SIGILL, &dfl)?;
    }
    CONTROL_FD.store(-1, Ordering::Relaxed);
    Ok(())
}

/// Page-aligned span covering the `UD2_LEN` bytes at `site`.
///
/// The trap site may straddle a page boundary, in which case both pages
/// must be writable for the patch.
fn trap_span(site: usize, page: usize) -> (usize, usize) {
    let start = site - site % page;
    let end = site + UD2_LEN;
    let span = if end > start + page { 2 * page } else { page };
    (start, span)
}

/// Last-resort exit from signal context: raw write, then `_exit`.
fn die(msg: &str) -> ! {
    let prefix = b"dsm: fatal: ";
    unsafe {
        libc::write(2, prefix.as_ptr() as *const libc::c_void, prefix.len());
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::write(2, b"\n".as_ptr() as *const libc::c_void, 1);
        libc::_exit(1);
    }
}

fn sem_wait_retry(sem: *mut libc::sem_t) {
    loop {
        if unsafe { libc::sem_wait(sem) } == 0 {
            return;
        }
        if io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            die("couldn't take the I/O semaphore");
        }
    }
}

fn mprotect_or_die(addr: *mut u8, len: usize, prot: libc::c_int, what: &str) {
    if unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot) } == -1 {
        die(what);
    }
}

/// SIGSEGV: a store hit the read-protected shared page.
extern "C" fn on_write_fault(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let fault = unsafe { (*info).si_addr() } as *mut u8;
    let base = DATA_BASE.load(Ordering::Relaxed);
    let len = DATA_LEN.load(Ordering::Relaxed);
    if base.is_null() || (fault as usize) < (base as usize) || (fault as usize) >= base as usize + len
    {
        die("segmentation fault outside the shared page");
    }

    // Serialize against other local writers, then against the session.
    sem_wait_retry(IO_SEM.load(Ordering::Relaxed));
    let control = CONTROL_FD.load(Ordering::Relaxed);
    if net::send_msg_raw(control, &Msg::SyncReq).is_err() {
        die("lost the arbiter while requesting write access");
    }
    match net::recv_msg_raw(control) {
        Ok(Msg::WriteOkay) => {}
        Ok(_) => die("unexpected reply to a write request"),
        Err(_) => die("lost the arbiter while awaiting write access"),
    }

    let uctx = unsafe { &*(ctx as *const libc::ucontext_t) };
    let pc = uctx.uc_mcontext.gregs[libc::REG_RIP as usize] as *mut u8;

    let decoder = unsafe { (*DECODER.get()).as_ref() };
    let insn = match decoder {
        Some(decoder) => {
            match decoder.store(unsafe { std::slice::from_raw_parts(pc, MAX_INSN_LEN) }) {
                Ok(insn) => insn,
                Err(_) => die("couldn't decode the faulting store"),
            }
        }
        None => die("write fault before runtime initialization"),
    };

    // Plant the trap right after the store.
    let site = unsafe { pc.add(insn.len) };
    let mut saved = [0u8; UD2_LEN];
    unsafe {
        ptr::copy_nonoverlapping(site, saved.as_mut_ptr(), UD2_LEN);
    }
    let (text_start, text_span) = trap_span(site as usize, page_size());
    mprotect_or_die(
        text_start as *mut u8,
        text_span,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        "couldn't open the text page for patching",
    );
    unsafe {
        ptr::copy_nonoverlapping(UD2.as_ptr(), site, UD2_LEN);
        *TRAP.get() = Some(TrapState {
            site,
            saved,
            fault,
            width: insn.width,
        });
    }

    // Let the retried store through.
    mprotect_or_die(base, len, libc::PROT_WRITE, "couldn't open the shared page");
}

/// SIGILL: the planted UD2 executed, so the store has committed.
extern "C" fn on_trap(_sig: libc::c_int, _info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let trap = match unsafe { (*TRAP.get()).take() } {
        Some(trap) => trap,
        None => die("illegal instruction without an armed trap"),
    };

    let uctx = unsafe { &*(ctx as *const libc::ucontext_t) };
    let pc = uctx.uc_mcontext.gregs[libc::REG_RIP as usize] as *mut u8;
    if pc != trap.site {
        die("illegal instruction away from the trap site");
    }

    // Disarm: the text page is still writable from the patch.
    unsafe {
        ptr::copy_nonoverlapping(trap.saved.as_ptr(), trap.site, UD2_LEN);
    }

    let base = DATA_BASE.load(Ordering::Relaxed);
    let len = DATA_LEN.load(Ordering::Relaxed);
    mprotect_or_die(base, len, libc::PROT_READ, "couldn't re-protect the shared page");

    if unsafe { libc::sem_post(IO_SEM.load(Ordering::Relaxed)) } == -1 {
        die("couldn't release the I/O semaphore");
    }

    // Publish the window the store produced.
    let offset = trap.fault as usize - base as usize;
    let width = trap.width.min(len - offset);
    let window = unsafe { std::slice::from_raw_parts(trap.fault, width) };
    let info = SyncInfo::new(offset as u64, window);
    if net::send_msg_raw(CONTROL_FD.load(Ordering::Relaxed), &Msg::SyncInfo(info)).is_err() {
        die("lost the arbiter while publishing a write");
    }

    // Stay suspended until the arbiter's SIGCONT ends the cycle.
    unsafe {
        libc::kill(libc::getpid(), libc::SIGTSTP);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_span_within_one_page() {
        let page = 4096;
        assert_eq!(trap_span(0x7000 + 10, page), (0x7000, page));
        assert_eq!(trap_span(0x7000 + page - 2, page), (0x7000, page));
    }

    #[test]
    fn trap_span_straddles_pages() {
        let page = 4096;
        assert_eq!(trap_span(0x7000 + page - 1, page), (0x7000, 2 * page));
    }

    #[test]
    fn ud2_is_two_bytes() {
        assert_eq!(UD2, [0x0f, 0x0b]);
    }
}
