//! Two participants bounce a turn flag through the shared page.
//!
//! Run `dsmd` first, then this program; it forks itself into the second
//! participant. Each side performs five writes, ten in total, and both
//! finish reading `turn == 0`.

use dsm::participant::{Participant, SessionConfig};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};

const ROUNDS: u32 = 5;

fn main() {
    env_logger::init();

    let child = match unsafe { fork() }.expect("couldn't fork the second participant") {
        ForkResult::Parent { child } => Some(child),
        ForkResult::Child => None,
    };

    let participant = Participant::init(&SessionConfig::new("pingpong", 2))
        .expect("couldn't join the session");
    let me = participant.gid() as u32;

    for _ in 0..ROUNDS {
        // Spin until it is our turn, then hand over.
        while participant.read::<u32>(0) != me {}
        if me == 0 {
            println!("ping ...");
        } else {
            println!("... pong");
        }
        participant.write::<u32>(0, 1 - me);
    }

    // Participant 1 writes 0 last; both sides settle on it.
    while participant.read::<u32>(0) != 0 {}
    println!("[gid {}] final turn = 0", me);

    participant.exit().expect("couldn't leave the session");
    if let Some(child) = child {
        waitpid(child, None).expect("couldn't reap the child");
    }
}
