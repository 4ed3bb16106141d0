//! Three participants each add 100 to a shared counter.
//!
//! The increment is a single `add dword ptr [mem], 1`: it faults once,
//! re-reads the page after write permission is granted, and commits while
//! every other participant is stopped, so no update is ever lost. Barriers
//! bracket the increment phase; the final value is exactly 300.

use std::arch::asm;

use dsm::participant::{Participant, SessionConfig};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};

const NPROC: u32 = 3;
const INCREMENTS: u32 = 100;

/// One-instruction increment of the u32 at `ptr`.
fn increment(ptr: *mut u8) {
    unsafe {
        asm!("add dword ptr [{0}], 1", in(reg) ptr, options(nostack));
    }
}

fn main() {
    env_logger::init();

    let mut children = Vec::new();
    for _ in 0..NPROC - 1 {
        match unsafe { fork() }.expect("couldn't fork a participant") {
            ForkResult::Parent { child } => children.push(child),
            ForkResult::Child => {
                children.clear();
                break;
            }
        }
    }

    let mut participant =
        Participant::init(&SessionConfig::new("counter", NPROC)).expect("couldn't join");
    let gid = participant.gid();

    participant.barrier().expect("start barrier failed");
    for _ in 0..INCREMENTS {
        increment(participant.page_ptr());
    }
    participant.barrier().expect("end barrier failed");

    let total = participant.read::<u32>(0);
    println!("[gid {}] counter = {}", gid, total);
    assert_eq!(total, NPROC * INCREMENTS);

    participant.exit().expect("couldn't leave the session");
    for child in children {
        waitpid(child, None).expect("couldn't reap a child");
    }
}
