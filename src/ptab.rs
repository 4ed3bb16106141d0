//! The arbiter's local process table.
//!
//! A sparse mapping from the participant's connection descriptor to its
//! entry, stored as a growable slot vector indexed by descriptor. The table
//! owns all participant state; the arbiter's writer queue holds bare
//! descriptors that are looked up here on every use, so queue and table can
//! never disagree about ownership.

use std::os::unix::io::RawFd;

/// State flags of one participant.
///
/// `queued` is set iff the descriptor sits in the arbiter's writer FIFO.
/// `stopped` means a SIGTSTP was delivered, or is withheld because the
/// participant is blocked elsewhere. `waiting` means the participant is
/// suspended at a barrier (or the startup gate) awaiting release.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFlags {
    pub stopped: bool,
    pub waiting: bool,
    pub queued: bool,
}

/// One registered participant.
#[derive(Debug, Clone)]
pub struct Proc {
    pub fd: RawFd,
    pub pid: i32,
    pub gid: i32,
    pub flags: ProcFlags,
}

/// Sparse table of local participants, indexed by connection descriptor.
#[derive(Debug, Default)]
pub struct ProcTable {
    slots: Vec<Option<Proc>>,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable { slots: Vec::new() }
    }

    /// Registers a participant. Returns `false` when the slot is occupied,
    /// which callers treat as a protocol violation.
    pub fn register(&mut self, fd: RawFd, pid: i32) -> bool {
        let at = fd as usize;
        if at >= self.slots.len() {
            self.slots.resize(at + 1, None);
        }
        if self.slots[at].is_some() {
            return false;
        }
        self.slots[at] = Some(Proc {
            fd,
            pid,
            gid: -1,
            flags: ProcFlags::default(),
        });
        true
    }

    /// Removes and returns the entry for `fd`.
    pub fn unregister(&mut self, fd: RawFd) -> Option<Proc> {
        self.slots.get_mut(fd as usize).and_then(Option::take)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Proc> {
        self.slots.get(fd as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Proc> {
        self.slots.get_mut(fd as usize).and_then(Option::as_mut)
    }

    /// Looks an entry up by process id (used for `SET_GID` relay).
    pub fn find_pid_mut(&mut self, pid: i32) -> Option<&mut Proc> {
        self.iter_mut().find(|p| p.pid == pid)
    }

    /// Number of registered participants.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Proc> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_occupied_slot_fails() {
        let mut tab = ProcTable::new();
        assert!(tab.register(5, 100));
        assert!(!tab.register(5, 101));
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn unregister_frees_the_slot() {
        let mut tab = ProcTable::new();
        tab.register(3, 42);
        let gone = tab.unregister(3).unwrap();
        assert_eq!(gone.pid, 42);
        assert!(tab.is_empty());
        assert!(tab.register(3, 43));
    }

    #[test]
    fn pid_lookup_sees_sparse_slots() {
        let mut tab = ProcTable::new();
        tab.register(9, 900);
        tab.register(2, 200);
        tab.find_pid_mut(900).unwrap().gid = 7;
        assert_eq!(tab.get(9).unwrap().gid, 7);
        assert!(tab.find_pid_mut(999).is_none());
    }
}
