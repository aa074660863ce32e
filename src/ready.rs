//! Readiness handshake between a target and its controller.
//!
//! The target holds a [`ReadySignal`] and fires it once it has reached a point where
//! attaching is safe (e.g. after its own setup, before the code under observation).
//! The controller blocks on the paired [`ReadyWait`] instead of sleeping for a guessed
//! interval. The channel is a pipe, so the signal end can be handed to a child process
//! by file descriptor.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::unistd;
use tracing::debug;

use crate::error::{Error, Result};

const READY_BYTE: u8 = b'R';

/// Create a connected signal/wait pair.
pub fn channel() -> Result<(ReadySignal, ReadyWait)> {
    let (read_fd, write_fd) = unistd::pipe()?;

    Ok((ReadySignal { fd: write_fd }, ReadyWait { fd: read_fd }))
}

/// Write end of the handshake, held by the target.
#[derive(Debug)]
pub struct ReadySignal {
    fd: RawFd,
}

impl ReadySignal {
    /// Tell the controller the target is ready.
    pub fn signal(self) -> Result<()> {
        loop {
            match unistd::write(self.fd, &[READY_BYTE]) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl AsRawFd for ReadySignal {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for ReadySignal {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl FromRawFd for ReadySignal {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Drop for ReadySignal {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Read end of the handshake, held by the controller.
#[derive(Debug)]
pub struct ReadyWait {
    fd: RawFd,
}

impl ReadyWait {
    /// Block until the target signals readiness.
    ///
    /// Fails with [`Error::NotReady`] if `timeout` elapses first, or if every signal
    /// end was closed without signaling (e.g. the target exited).
    pub fn wait(self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let remaining = match deadline {
                None => -1,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    left.as_millis().min(i32::MAX as u128) as i32
                },
            };

            let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];

            match poll(&mut fds, remaining) {
                Ok(0) => {
                    return Err(Error::NotReady(format!("no signal within {:?}", timeout.unwrap_or_default())));
                },
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let mut byte = [0u8; 1];

        loop {
            match unistd::read(self.fd, &mut byte) {
                Ok(0) => return Err(Error::NotReady("target closed the channel without signaling".into())),
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        debug!("target signaled ready");

        Ok(())
    }
}

impl AsRawFd for ReadyWait {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ReadyWait {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}
