//! Named cross-process synchronization primitives.
//!
//! The protocol needs exactly two: a mutual-exclusion lock guarding the
//! whole region, and a coalescing wake signal standing in for a condition
//! variable across the process boundary. Both are reached by well-known
//! names so producer and consumer rendezvous without an fd exchange.
//!
//! The protocol logic only sees the [`SessionLock`] and [`WakeSignal`]
//! traits. The POSIX implementations are [`ProcessLock`] (a robust,
//! process-shared pthread mutex living in its own small named segment, so a
//! holder dying is detected as `EOWNERDEAD` and surfaced as
//! [`SyncError::Abandoned`]) and [`WakeLatch`] (a named semaphore clamped to
//! capacity 1, so repeated notifies coalesce and waiters must loop and
//! re-check state). The [`local`] module has deterministic in-process
//! substitutes used by tests.

use crate::error::{RingError, SyncError};
use crate::memory::SharedMapping;
use nix::errno::Errno;
use std::cell::UnsafeCell;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait SessionLock {
    type Guard<'a>
    where
        Self: 'a;

    /// Bounded wait for the lock. `Abandoned` means the previous holder died
    /// while holding it; the lock itself is left usable for the next caller.
    fn acquire(&self, timeout: Duration) -> Result<Self::Guard<'_>, SyncError>;
}

pub trait WakeSignal {
    /// Non-blocking. Signalling an already-signalled wake is a no-op.
    fn notify(&self) -> Result<(), SyncError>;

    /// Bounded wait for a pending signal, consuming it.
    fn wait(&self, timeout: Duration) -> Result<(), SyncError>;
}

impl<T: SessionLock> SessionLock for Arc<T> {
    type Guard<'a>
        = T::Guard<'a>
    where
        Self: 'a;

    fn acquire(&self, timeout: Duration) -> Result<Self::Guard<'_>, SyncError> {
        (**self).acquire(timeout)
    }
}

impl<T: WakeSignal> WakeSignal for Arc<T> {
    fn notify(&self) -> Result<(), SyncError> {
        (**self).notify()
    }

    fn wait(&self, timeout: Duration) -> Result<(), SyncError> {
        (**self).wait(timeout)
    }
}

const LOCK_READY: u32 = 0x4C4F_434B; // "LOCK"

#[repr(C)]
struct LockSegment {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    ready: AtomicU32,
}

/// Robust process-shared mutex in its own named shared memory segment.
pub struct ProcessLock {
    mapping: SharedMapping,
}

unsafe impl Send for ProcessLock {}
unsafe impl Sync for ProcessLock {}

impl ProcessLock {
    pub fn create(name: &str) -> Result<Self, RingError> {
        let mapping = SharedMapping::create(name, std::mem::size_of::<LockSegment>())?;
        let segment = unsafe { &*(mapping.ptr() as *const LockSegment) };
        unsafe {
            let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
            pthread_check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            pthread_check(libc::pthread_mutexattr_setpshared(
                attr.as_mut_ptr(),
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            pthread_check(libc::pthread_mutexattr_setrobust(
                attr.as_mut_ptr(),
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            pthread_check(libc::pthread_mutex_init(segment.mutex.get(), attr.as_ptr()))?;
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        }
        segment.ready.store(LOCK_READY, Ordering::Release);
        Ok(ProcessLock { mapping })
    }

    pub fn open(name: &str) -> Result<Self, RingError> {
        let mapping = SharedMapping::open(name)?;
        if mapping.len() < std::mem::size_of::<LockSegment>() {
            return Err(RingError::RegionUnavailable);
        }
        let segment = unsafe { &*(mapping.ptr() as *const LockSegment) };
        if segment.ready.load(Ordering::Acquire) != LOCK_READY {
            return Err(RingError::RegionUnavailable);
        }
        Ok(ProcessLock { mapping })
    }

    fn segment(&self) -> &LockSegment {
        unsafe { &*(self.mapping.ptr() as *const LockSegment) }
    }
}

impl SessionLock for ProcessLock {
    type Guard<'a>
        = ProcessLockGuard<'a>
    where
        Self: 'a;

    fn acquire(&self, timeout: Duration) -> Result<ProcessLockGuard<'_>, SyncError> {
        let deadline = deadline_after(timeout);
        let mutex = self.segment().mutex.get();
        match unsafe { libc::pthread_mutex_timedlock(mutex, &deadline) } {
            0 => Ok(ProcessLockGuard { lock: self }),
            libc::ETIMEDOUT => Err(SyncError::Timeout),
            libc::EOWNERDEAD => {
                // We own the mutex now; make it usable again for whoever
                // retries after the session is reopened, then report the
                // death to the caller.
                unsafe {
                    libc::pthread_mutex_consistent(mutex);
                    libc::pthread_mutex_unlock(mutex);
                }
                Err(SyncError::Abandoned)
            }
            code => Err(SyncError::Os(Errno::from_raw(code))),
        }
    }
}

pub struct ProcessLockGuard<'a> {
    lock: &'a ProcessLock,
}

impl Drop for ProcessLockGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_unlock(self.lock.segment().mutex.get());
        }
    }
}

/// Named POSIX semaphore used as a capacity-1 wake signal.
pub struct WakeLatch {
    sem: *mut libc::sem_t,
}

unsafe impl Send for WakeLatch {}
unsafe impl Sync for WakeLatch {}

impl WakeLatch {
    pub fn create(name: &str) -> Result<Self, RingError> {
        let cname = sem_name(name)?;
        unsafe {
            libc::sem_unlink(cname.as_ptr());
        }
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(RingError::Mmap(Errno::last()));
        }
        Ok(WakeLatch { sem })
    }

    pub fn open(name: &str) -> Result<Self, RingError> {
        let cname = sem_name(name)?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return match Errno::last() {
                Errno::ENOENT => Err(RingError::RegionUnavailable),
                errno => Err(RingError::Mmap(errno)),
            };
        }
        Ok(WakeLatch { sem })
    }
}

impl WakeSignal for WakeLatch {
    fn notify(&self) -> Result<(), SyncError> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem, &mut value) } != 0 {
            return Err(SyncError::Os(Errno::last()));
        }
        // already signalled: coalesce instead of counting
        if value > 0 {
            return Ok(());
        }
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(SyncError::Os(Errno::last()));
        }
        Ok(())
    }

    fn wait(&self, timeout: Duration) -> Result<(), SyncError> {
        let deadline = deadline_after(timeout);
        loop {
            if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::ETIMEDOUT => return Err(SyncError::Timeout),
                Errno::EINTR => continue,
                errno => return Err(SyncError::Os(errno)),
            }
        }
    }
}

impl Drop for WakeLatch {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

fn sem_name(name: &str) -> Result<CString, RingError> {
    CString::new(name).map_err(|_| RingError::InvalidConfig("name contains a NUL byte"))
}

fn pthread_check(code: libc::c_int) -> Result<(), RingError> {
    if code == 0 {
        Ok(())
    } else {
        Err(RingError::Sync(SyncError::Os(Errno::from_raw(code))))
    }
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }
    let nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nsec / 1_000_000_000) as libc::time_t,
        tv_nsec: nsec % 1_000_000_000,
    }
}

/// Deterministic in-process implementations of the sync traits. They back
/// unit tests for the protocol logic; cross-process sessions use the named
/// POSIX primitives above.
pub mod local {
    use super::{SessionLock, WakeSignal};
    use crate::error::SyncError;
    use parking_lot::{Condvar, Mutex, MutexGuard};
    use std::time::Duration;

    #[derive(Default)]
    pub struct LocalLock {
        inner: Mutex<()>,
    }

    impl LocalLock {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SessionLock for LocalLock {
        type Guard<'a>
            = MutexGuard<'a, ()>
        where
            Self: 'a;

        fn acquire(&self, timeout: Duration) -> Result<Self::Guard<'_>, SyncError> {
            self.inner.try_lock_for(timeout).ok_or(SyncError::Timeout)
        }
    }

    #[derive(Default)]
    pub struct LocalWake {
        pending: Mutex<bool>,
        condvar: Condvar,
    }

    impl LocalWake {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl WakeSignal for LocalWake {
        fn notify(&self) -> Result<(), SyncError> {
            let mut pending = self.pending.lock();
            if !*pending {
                *pending = true;
                self.condvar.notify_one();
            }
            Ok(())
        }

        fn wait(&self, timeout: Duration) -> Result<(), SyncError> {
            let mut pending = self.pending.lock();
            if !*pending {
                let result = self.condvar.wait_for(&mut pending, timeout);
                if result.timed_out() && !*pending {
                    return Err(SyncError::Timeout);
                }
            }
            *pending = false;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::local::{LocalLock, LocalWake};
    use super::*;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("/framering-sync-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_lock_round_trip_across_handles() {
        let name = unique_name("basic");
        let created = ProcessLock::create(&name).unwrap();
        let opened = ProcessLock::open(&name).unwrap();

        let guard = created.acquire(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            opened.acquire(Duration::from_millis(30)),
            Err(SyncError::Timeout)
        ));
        drop(guard);
        let _ = opened.acquire(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_lock_open_before_create_is_unavailable() {
        let result = ProcessLock::open("/framering-sync-never-created");
        assert!(matches!(result, Err(RingError::RegionUnavailable)));
    }

    #[test]
    fn test_abandoned_holder_is_detected_then_recovered() {
        let name = unique_name("abandoned");
        let lock = Arc::new(ProcessLock::create(&name).unwrap());

        let holder = Arc::clone(&lock);
        thread::spawn(move || {
            let guard = holder.acquire(Duration::from_millis(100)).unwrap();
            std::mem::forget(guard);
        })
        .join()
        .unwrap();

        assert!(matches!(
            lock.acquire(Duration::from_millis(100)),
            Err(SyncError::Abandoned)
        ));
        // the detection pass made the mutex consistent again
        let _ = lock.acquire(Duration::from_millis(100)).unwrap();
    }

    #[test]
    fn test_wake_signal_coalesces() {
        let name = unique_name("wake");
        let latch = WakeLatch::create(&name).unwrap();

        latch.notify().unwrap();
        latch.notify().unwrap();
        latch.notify().unwrap();

        latch.wait(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            latch.wait(Duration::from_millis(30)),
            Err(SyncError::Timeout)
        ));
    }

    #[test]
    fn test_wake_crosses_handles() {
        let name = unique_name("wake-cross");
        let creator = WakeLatch::create(&name).unwrap();
        let opener = WakeLatch::open(&name).unwrap();

        let waiter = thread::spawn(move || opener.wait(Duration::from_millis(500)));
        thread::sleep(Duration::from_millis(20));
        creator.notify().unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_local_lock_times_out_while_held() {
        let lock = LocalLock::new();
        let guard = lock.acquire(Duration::from_millis(50)).unwrap();
        assert!(matches!(
            lock.acquire(Duration::from_millis(20)),
            Err(SyncError::Timeout)
        ));
        drop(guard);
        let _ = lock.acquire(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_local_wake_coalesces_and_times_out() {
        let wake = LocalWake::new();
        assert!(matches!(
            wake.wait(Duration::from_millis(10)),
            Err(SyncError::Timeout)
        ));
        wake.notify().unwrap();
        wake.notify().unwrap();
        wake.wait(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            wake.wait(Duration::from_millis(10)),
            Err(SyncError::Timeout)
        ));
    }
}
