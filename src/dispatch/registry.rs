//! epoll-backed readiness registry.
//!
//! Thin wrapper around the kernel event table: register/rearm/unregister a
//! descriptor's read interest and block for batches of readiness events.
//! Registration also switches the descriptor to nonblocking mode, so the
//! read path never blocks the dispatch thread.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::Duration;

/// Triggering discipline applied to a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Level-triggered: readiness re-reported while data remains unread.
    Level,
    /// Edge-triggered: reported once per readable transition.
    Edge,
    /// Edge-triggered plus oneshot: disarmed after one delivery.
    EdgeOneshot,
}

impl TriggerMode {
    fn epoll_flags(self) -> u32 {
        match self {
            TriggerMode::Level => libc::EPOLLIN as u32,
            TriggerMode::Edge => (libc::EPOLLIN | libc::EPOLLET) as u32,
            TriggerMode::EdgeOneshot => {
                (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32
            }
        }
    }

    /// Mode used for the listening descriptor. A oneshot listener would be
    /// disarmed after its first accept and never deliver again, so oneshot
    /// clamps to plain edge for listeners.
    pub fn for_listener(self) -> TriggerMode {
        match self {
            TriggerMode::EdgeOneshot => TriggerMode::Edge,
            other => other,
        }
    }

    /// Whether a readable event must be drained to would-block.
    pub fn drains_fully(self) -> bool {
        !matches!(self, TriggerMode::Level)
    }
}

/// A single delivered readiness event. Ephemeral: produced by one wait
/// call and consumed within the same dispatch iteration.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvent {
    token: usize,
    flags: u32,
}

impl ReadinessEvent {
    /// Token supplied at registration time.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Data is available to read.
    pub fn is_readable(&self) -> bool {
        self.flags & libc::EPOLLIN as u32 != 0
    }

    /// Error or hangup condition on the descriptor.
    pub fn is_error(&self) -> bool {
        self.flags & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0
    }
}

/// Owns the epoll descriptor and the descriptor interest table.
///
/// `register`/`rearm`/`unregister` take `&self` and may be called from any
/// thread; no two contexts ever operate on the same descriptor at once
/// (the oneshot disarm invariant), and epoll_ctl itself is thread-safe.
/// `wait` is only ever called by the dispatch thread.
pub struct EpollRegistry {
    epfd: RawFd,
    /// Scratch buffer for epoll_wait, sized to the configured batch.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollRegistry {
    /// Create a new registry with capacity for `max_events` per wait call.
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epfd,
            events: Mutex::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                max_events.max(1)
            ]),
        })
    }

    /// Register a descriptor's read interest under the given trigger mode.
    ///
    /// The descriptor is put into nonblocking mode as part of registration.
    /// A descriptor may be registered at most once at any time.
    pub fn register(&self, fd: RawFd, token: usize, mode: TriggerMode) -> io::Result<()> {
        set_nonblocking(fd)?;
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, mode)
    }

    /// Restore interest on a oneshot descriptor for exactly one more
    /// delivery. Called from whichever context currently owns the
    /// connection's servicing, after its drain pass has finished.
    pub fn rearm(&self, fd: RawFd, token: usize, mode: TriggerMode) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, mode)
    }

    /// Remove a descriptor from the interest table.
    pub fn unregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: usize, mode: TriggerMode) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mode.epoll_flags(),
            u64: token as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready, then fill
    /// `out` with the delivered batch. `None` blocks indefinitely.
    ///
    /// Any failure of the wait itself (including interruption) is returned
    /// to the caller, which treats it as fatal to the dispatch loop.
    pub fn wait(
        &self,
        out: &mut Vec<ReadinessEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
            .unwrap_or(-1);

        let mut buf = self.events.lock().unwrap();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                buf.as_mut_ptr(),
                buf.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        out.clear();
        for ev in buf.iter().take(n as usize) {
            out.push(ReadinessEvent {
                token: ev.u64 as usize,
                flags: ev.events,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for EpollRegistry {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

/// Put a descriptor into nonblocking mode, preserving its other flags.
fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
