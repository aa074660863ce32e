//! Task and thread capabilities: acquisition, suspension, enumeration, and release.

use std::fmt;
use std::mem;
use std::slice;

use tracing::{debug, info, warn};

use crate::error::{Error, Result, ResultExt};
use crate::kernel::{
    KernReturn, KernelRef, Pid, Port, ProcessInfo, ProcessProbe, ProcessStatus, VmAddress, KERN_FAILURE,
    KERN_INVALID_ARGUMENT, MACH_SEND_INVALID_DEST,
};

/// Control capability for a target process ("task").
///
/// Owns one send right to the task port, plus the suspensions made through it. Every
/// [`Task::suspend()`] must be balanced by a [`Task::resume()`]; any suspensions still
/// held when the capability is released are resumed first, so dropping a `Task` never
/// leaves the target stopped on our behalf.
pub struct Task {
    kernel: KernelRef,
    port: Port,
    pid: Pid,
    suspend_depth: u32,
    released: bool,
}

impl Task {
    /// Acquire the control capability for `pid`.
    ///
    /// This does **not** stop the target. Call [`Task::suspend()`] for that.
    pub fn attach(kernel: KernelRef, pid: Pid) -> Result<Self> {
        if pid.as_raw() <= 0 {
            return Err(Error::InvalidArgument { call: "task_for_pid", code: KERN_INVALID_ARGUMENT });
        }

        let port = match kernel.task_for_pid(pid) {
            Ok(port) => port,
            Err(code) => return Err(classify_attach_error(&kernel, pid, code)),
        };

        info!(pid = pid.as_raw(), port, "acquired task port");

        Ok(Self { kernel, port, pid, suspend_depth: 0, released: false })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raw task port name, for read-only use by other components.
    pub fn port(&self) -> Port {
        self.port
    }

    pub(crate) fn kernel(&self) -> &KernelRef {
        &self.kernel
    }

    /// Number of outstanding suspensions made through this capability.
    pub fn suspend_depth(&self) -> u32 {
        self.suspend_depth
    }

    pub fn is_suspended(&self) -> bool {
        self.suspend_depth > 0
    }

    /// Stop all threads of the task. Suspensions nest.
    pub fn suspend(&mut self) -> Result<()> {
        self.check_live()?;
        self.kernel.task_suspend(self.port).or_kernel("task_suspend")?;
        self.suspend_depth += 1;

        debug!(pid = self.pid.as_raw(), depth = self.suspend_depth, "suspended task");

        Ok(())
    }

    /// Undo one [`Task::suspend()`].
    ///
    /// Fails with [`Error::OverResume`] without calling into the kernel if this
    /// capability holds no suspensions.
    pub fn resume(&mut self) -> Result<()> {
        self.check_live()?;

        if self.suspend_depth == 0 {
            return Err(Error::OverResume { task: self.port });
        }

        self.kernel.task_resume(self.port).or_kernel("task_resume")?;
        self.suspend_depth -= 1;

        debug!(pid = self.pid.as_raw(), depth = self.suspend_depth, "resumed task");

        Ok(())
    }

    /// The kernel's suspend count, including suspensions made by other actors.
    pub fn kernel_suspend_count(&self) -> Result<u32> {
        self.check_live()?;
        self.kernel.task_suspend_count(self.port).or_kernel("task_info")
    }

    /// Identity and status of the target, from the process table.
    pub fn info(&self) -> Result<ProcessInfo> {
        self.kernel.process_info(self.pid).or_kernel("proc_pidinfo")
    }

    /// Scheduling status from the process table.
    ///
    /// This is independent of Mach suspensions: a suspended task may still report
    /// `Running` or `Sleeping`. Use [`Task::kernel_suspend_count()`] for those.
    pub fn status(&self) -> Result<ProcessStatus> {
        Ok(self.info()?.status)
    }

    /// Snapshot the task's threads.
    ///
    /// Each returned [`Thread`] owns its port right and releases it on drop.
    pub fn threads(&self) -> Result<Vec<Thread>> {
        self.check_live()?;

        let (address, count) = self.kernel.task_threads(self.port).or_kernel("task_threads")?;
        let list = ThreadList { kernel: &self.kernel, address, count };

        let threads = list
            .names()
            .iter()
            .map(|&port| Thread::new(self.kernel.clone(), port, self.port))
            .collect::<Vec<_>>();

        debug!(pid = self.pid.as_raw(), count = threads.len(), "listed threads");

        Ok(threads)
    }

    /// Release the capability, first resuming any suspensions it still holds.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased { name: self.port });
        }

        let mut first_err = None;

        while self.suspend_depth > 0 {
            if let Err(err) = self.resume() {
                if self.exited(&err) {
                    warn!(pid = self.pid.as_raw(), %err, "target exited while suspended");
                    self.forget_suspensions();
                } else {
                    warn!(pid = self.pid.as_raw(), %err, "could not resume task on release");
                    first_err.get_or_insert(err);
                }
                break;
            }
        }

        self.released = true;

        if let Err(code) = self.kernel.port_deallocate(self.port) {
            first_err.get_or_insert(Error::from_kern("mach_port_deallocate", code));
        }

        info!(pid = self.pid.as_raw(), port = self.port, "released task port");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    // A dead task's port no longer accepts calls. A zombie may still answer a probe,
    // so the call's own failure is checked first.
    pub(crate) fn exited(&self, err: &Error) -> bool {
        err.kern_return() == Some(MACH_SEND_INVALID_DEST)
            || self.kernel.probe_process(self.pid) == ProcessProbe::Missing
    }

    // Suspensions of an exited task cannot be undone, and need not be.
    pub(crate) fn forget_suspensions(&mut self) {
        self.suspend_depth = 0;
    }

    fn check_live(&self) -> Result<()> {
        if self.released {
            Err(Error::AlreadyReleased { name: self.port })
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("port", &self.port)
            .field("pid", &self.pid)
            .field("suspend_depth", &self.suspend_depth)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

// `task_for_pid()` answers `KERN_FAILURE` both when we lack privilege and when the pid
// does not exist. Probe the process table to tell them apart.
fn classify_attach_error(kernel: &KernelRef, pid: Pid, code: KernReturn) -> Error {
    match code {
        KERN_FAILURE => match kernel.probe_process(pid) {
            ProcessProbe::Missing => Error::NoSuchProcess { pid, code },
            ProcessProbe::Alive => Error::PermissionDenied { pid, code },
        },
        KERN_INVALID_ARGUMENT => Error::InvalidArgument { call: "task_for_pid", code },
        _ => Error::Kernel { call: "task_for_pid", code },
    }
}

/// Kernel-allocated array of thread port names, released on drop.
struct ThreadList<'k> {
    kernel: &'k KernelRef,
    address: VmAddress,
    count: u32,
}

impl<'k> ThreadList<'k> {
    fn names(&self) -> &[Port] {
        if self.count == 0 || self.address == 0 {
            return &[];
        }

        // SAFETY: the `Kernel` contract guarantees the array is valid and aligned for
        // `count` port names until it is deallocated in `drop()`.
        unsafe { slice::from_raw_parts(self.address as *const Port, self.count as usize) }
    }
}

impl<'k> Drop for ThreadList<'k> {
    fn drop(&mut self) {
        if self.address == 0 {
            return;
        }

        let size = u64::from(self.count) * mem::size_of::<Port>() as u64;

        if let Err(code) = self.kernel.vm_deallocate(self.address, size) {
            warn!(code, "could not deallocate thread list");
        }
    }
}

/// Capability for one thread of a task.
///
/// Obtained from [`Task::threads()`] or carried by an exception notification. The
/// owning task port is a back-reference for lookups only.
pub struct Thread {
    kernel: KernelRef,
    port: Port,
    task_port: Port,
    released: bool,
}

impl Thread {
    pub(crate) fn new(kernel: KernelRef, port: Port, task_port: Port) -> Self {
        Self { kernel, port, task_port, released: false }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// Port name of the task this thread belongs to.
    pub fn task_port(&self) -> Port {
        self.task_port
    }

    pub(crate) fn kernel(&self) -> &KernelRef {
        &self.kernel
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release the thread's port right. A second release is rejected.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased { name: self.port });
        }

        self.released = true;
        self.kernel.port_deallocate(self.port).or_kernel("mach_port_deallocate")
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.released {
            Err(Error::AlreadyReleased { name: self.port })
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("port", &self.port)
            .field("task_port", &self.task_port)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}
