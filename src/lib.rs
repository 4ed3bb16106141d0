//! Page-granular distributed shared memory for cooperating UNIX processes.
//!
//! Participants on one or more hosts share a single logical page. Stores
//! into the page are intercepted through memory protection faults,
//! serialized by a per-session coordinator, and propagated everywhere
//! before the writer continues, so all participants observe one global
//! write order. The moving parts:
//!
//! * **Session daemon** ([`daemon`]): well-known rendezvous mapping
//!   session ids to per-session servers; one per deployment (`dsmd`).
//! * **Session server** ([`server`]): per-session coordinator running the
//!   write serialization state machine and the barrier (`dsm-server`).
//! * **Arbiter** ([`arbiter`]): per-host multiplexer owning the local
//!   shared page, process table, and SIGTSTP/SIGCONT control; forked by
//!   the first local participant.
//! * **Participant runtime** ([`participant`], [`sync`]): the library an
//!   application links against, providing registration, the write-fault
//!   trap pair, and the barrier.
//!
//! # Example
//!
//! ```no_run
//! use dsm::participant::{Participant, SessionConfig};
//!
//! let p = Participant::init(&SessionConfig::new("demo", 2))?;
//! if p.gid() == 0 {
//!     p.write::<u32>(0, 42);
//! } else {
//!     while p.read::<u32>(0) != 42 {}
//! }
//! p.exit()?;
//! # Ok::<(), dsm::error::DsmError>(())
//! ```
//!
//! Only x86-64 UNIX is supported: the trap mechanism decodes the faulting
//! store and plants a UD2 after it, both ISA-specific by design.

#![cfg(all(unix, target_arch = "x86_64"))]

pub mod arbiter;
pub mod daemon;
pub mod decode;
pub mod error;
pub mod msg;
pub mod net;
pub mod participant;
pub mod poll;
pub mod ptab;
pub mod server;
pub mod shm;
pub mod sync;

pub use error::{DsmError, Result};
pub use msg::{Msg, SessionId};
pub use participant::{Participant, SessionConfig};
