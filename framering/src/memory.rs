use crate::error::RingError;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::ftruncate;
use std::num::NonZero;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

/// A named POSIX shared memory segment mapped into this process.
///
/// The creator gets a fresh, zeroed segment (any stale segment with the same
/// name from a previous run is unlinked first); openers map whatever the
/// creator published. The mapping is released on drop; the name itself
/// outlives the mapping until the next creator replaces it.
pub(crate) struct SharedMapping {
    ptr: NonNull<libc::c_void>,
    len: usize,
}

impl SharedMapping {
    pub(crate) fn create(name: &str, len: usize) -> Result<Self, RingError> {
        let _ = shm_unlink(name);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(RingError::Mmap)?;
        ftruncate(&fd, len as libc::off_t).map_err(RingError::Mmap)?;
        Self::map(fd, len)
    }

    pub(crate) fn open(name: &str) -> Result<Self, RingError> {
        let fd = match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => return Err(RingError::RegionUnavailable),
            Err(errno) => return Err(RingError::Mmap(errno)),
        };
        let stat = fstat(fd.as_raw_fd()).map_err(RingError::Mmap)?;
        let len = stat.st_size as usize;
        if len == 0 {
            // creator has the name but has not sized the segment yet
            return Err(RingError::RegionUnavailable);
        }
        Self::map(fd, len)
    }

    fn map(fd: OwnedFd, len: usize) -> Result<Self, RingError> {
        let length = NonZero::new(len)
            .ok_or(RingError::InvalidConfig("mapping length must be non-zero"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
            .map_err(RingError::Mmap)?
        };
        Ok(SharedMapping { ptr, len })
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr.as_ptr() as *mut u8
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/framering-mem-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_create_then_open_shares_bytes() {
        let name = unique_name("share");
        let created = SharedMapping::create(&name, 4096).unwrap();
        unsafe {
            created.ptr().write(0xA5);
            created.ptr().add(4095).write(0x5A);
        }

        let opened = SharedMapping::open(&name).unwrap();
        assert_eq!(opened.len(), 4096);
        unsafe {
            assert_eq!(opened.ptr().read(), 0xA5);
            assert_eq!(opened.ptr().add(4095).read(), 0x5A);
        }

        let _ = shm_unlink(name.as_str());
    }

    #[test]
    fn test_create_zeroes_the_segment() {
        let name = unique_name("zeroed");
        {
            let first = SharedMapping::create(&name, 4096).unwrap();
            unsafe { first.ptr().write_bytes(0xFF, 4096) };
        }
        let second = SharedMapping::create(&name, 4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(second.ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));

        let _ = shm_unlink(name.as_str());
    }

    #[test]
    fn test_open_missing_is_unavailable() {
        let result = SharedMapping::open("/framering-mem-never-created");
        assert!(matches!(result, Err(RingError::RegionUnavailable)));
    }
}
