//! The per-host shared memory object.
//!
//! Layout is a two-region split: a header page holding the writer-serializing
//! I/O semaphore, a reserved barrier-semaphore slot, and the data-region
//! geometry, followed by one page-aligned data page. Every local participant
//! and the arbiter map the same object; only the I/O semaphore moves after
//! initialization.
//!
//! The object and the named init semaphore use well-known names; the
//! arbiter unlinks both once the session has started, after which the
//! underlying objects persist until the last mapping is dropped.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::io::AsFd;
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mprotect, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

use crate::error::{DsmError, Result};

/// Well-known name of the shared memory object.
pub const SHM_NAME: &str = "/dsm-page";

/// Well-known name of the init semaphore the arbiter posts.
pub const INIT_SEM_NAME: &str = "/dsm-start";

/// Control header at offset zero of the shared object.
///
/// `size_of::<Header>()` must stay within one page; the data region starts
/// at `data_off`, which the creator pins to exactly one page.
#[repr(C)]
pub struct Header {
    /// Serializes local writers on this host.
    pub io_sem: libc::sem_t,
    /// Slot for a host-local barrier semaphore, part of the fixed layout.
    /// The barrier is coordinated by the session server over the control
    /// protocol, so this slot stays zeroed and no semaphore is ever
    /// initialized in it.
    pub barrier_sem: libc::sem_t,
    /// Offset of the data region from the start of the object.
    pub data_off: u64,
    /// Total size of the object, header included.
    pub size: u64,
}

/// Host page size.
pub fn page_size() -> usize {
    // Always succeeds on the platforms the trap mechanism supports.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// A mapping of the shared object into this process.
#[derive(Debug)]
pub struct SharedRegion {
    base: NonNull<libc::c_void>,
    len: usize,
    page: usize,
}

// The region is handed from the creating participant to the forked arbiter.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Opens the shared object, creating and sizing it if this process wins
    /// the `O_EXCL` race. Returns the mapping and whether we created it.
    pub fn open(name: &str) -> io::Result<(SharedRegion, bool)> {
        let page = page_size();
        let len = 2 * page;

        let create = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        let (fd, created) = match create {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(name, OFlag::O_RDWR, Mode::empty())?, false),
            Err(err) => return Err(err.into()),
        };
        let file = File::from(fd);

        if created {
            ftruncate(&file, len as libc::off_t)?;
        } else {
            // The creator may not have sized the object yet.
            while (file.metadata()?.len() as usize) < len {
                thread::sleep(Duration::from_millis(1));
            }
        }

        let base = unsafe {
            mmap(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )?
        };

        Ok((SharedRegion { base, len, page }, created))
    }

    /// Initializes the header; the creating participant calls this exactly
    /// once, before forking the arbiter.
    pub fn init_header(&self) -> io::Result<()> {
        assert!(std::mem::size_of::<Header>() <= self.page);

        let hdr = self.header();
        unsafe {
            if libc::sem_init(&mut (*hdr).io_sem, 1, 1) == -1 {
                return Err(io::Error::last_os_error());
            }
            (*hdr).data_off = self.page as u64;
            (*hdr).size = self.len as u64;
        }
        Ok(())
    }

    fn header(&self) -> *mut Header {
        self.base.as_ptr() as *mut Header
    }

    /// The I/O semaphore serializing local writers.
    pub fn io_sem(&self) -> *mut libc::sem_t {
        unsafe { &mut (*self.header()).io_sem }
    }

    pub fn data_off(&self) -> usize {
        unsafe { (*self.header()).data_off as usize }
    }

    /// Start of the data region in this mapping.
    pub fn data_ptr(&self) -> *mut u8 {
        unsafe { (self.base.as_ptr() as *mut u8).add(self.data_off()) }
    }

    pub fn data_len(&self) -> usize {
        self.len - self.data_off()
    }

    /// Changes the protection of the data region in this mapping only.
    pub fn protect_data(&self, prot: ProtFlags) -> io::Result<()> {
        unsafe {
            mprotect(
                NonNull::new_unchecked(self.data_ptr() as *mut libc::c_void),
                self.data_len(),
                prot,
            )?;
        }
        Ok(())
    }

    /// Applies a published write window to the data region.
    pub fn apply(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let end = offset as usize + bytes.len();
        if end > self.data_len() {
            return Err(DsmError::protocol(format!(
                "sync window [{}, {}) outside the data region",
                offset, end
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data_ptr().add(offset as usize),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copies a window of the data region out (tests and diagnostics).
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.data_len());
        let mut out = vec![0; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr().add(offset), out.as_mut_ptr(), len);
        }
        out
    }

    /// Removes the object's name; existing mappings stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        shm_unlink(name)?;
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let _ = unsafe { munmap(self.base, self.len) };
    }
}

/// The named init semaphore gating participant startup.
///
/// The arbiter posts it once per expected participant as soon as its
/// listener is ready; participants wait on it before connecting.
#[derive(Debug)]
pub struct InitSem {
    sem: *mut libc::sem_t,
}

unsafe impl Send for InitSem {}

impl InitSem {
    /// Opens the semaphore, creating it with value zero if absent.
    pub fn open(name: &str) -> io::Result<InitSem> {
        let cname = CString::new(name).expect("semaphore name contains NUL");
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                libc::S_IRUSR | libc::S_IWUSR,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(InitSem { sem })
    }

    pub fn post(&self) -> io::Result<()> {
        if unsafe { libc::sem_post(self.sem) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = CString::new(name).expect("semaphore name contains NUL");
        if unsafe { libc::sem_unlink(cname.as_ptr()) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for InitSem {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(prefix: &str) -> String {
        format!("/{}-{}", prefix, std::process::id())
    }

    #[test]
    fn header_fits_one_page() {
        assert!(std::mem::size_of::<Header>() <= page_size());
    }

    #[test]
    fn create_open_apply_unlink() {
        let name = unique("dsm-test-region");
        let (region, created) = SharedRegion::open(&name).unwrap();
        assert!(created);
        region.init_header().unwrap();
        assert_eq!(region.data_off(), page_size());
        assert_eq!(region.data_len(), page_size());

        let (other, created) = SharedRegion::open(&name).unwrap();
        assert!(!created);

        region.apply(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(other.snapshot(8, 4), vec![1, 2, 3, 4]);

        let err = region.apply(region.data_len() as u64 - 1, &[0, 0]);
        assert!(err.is_err());

        SharedRegion::unlink(&name).unwrap();
        assert!(SharedRegion::open(&name).map(|(_, c)| c).unwrap_or(true));
        let _ = SharedRegion::unlink(&name);
    }

    #[test]
    fn init_sem_counts() {
        let name = unique("dsm-test-sem");
        let sem = InitSem::open(&name).unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        sem.wait().unwrap();
        sem.wait().unwrap();
        InitSem::unlink(&name).unwrap();
    }
}
