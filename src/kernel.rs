//! The kernel primitives every other module is built on.
//!
//! Components never reach for an ambient "self" task port. Instead they hold an
//! `Arc<dyn Kernel>`, which captures the controlling process's own capability when it
//! is constructed. On macOS this is [`MachKernel`](crate::mach::MachKernel); on every
//! host, [`SimKernel`](crate::sim::SimKernel) provides an in-memory kernel with the
//! same contract.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use nix::unistd::{Gid, Pid, Uid};

/// Name of a port right in the controlling task's namespace.
pub type Port = u32;

/// Raw kernel return code (`kern_return_t` / `mach_msg_return_t`).
pub type KernReturn = i32;

/// Address in the controlling task's own address space.
pub type VmAddress = usize;

/// Thread state flavor, selecting a register layout.
pub type Flavor = i32;

pub type KernResult<T> = std::result::Result<T, KernReturn>;

/// Shared handle to a kernel binding.
pub type KernelRef = Arc<dyn Kernel>;

pub const PORT_NULL: Port = 0;

pub const KERN_SUCCESS: KernReturn = 0;
pub const KERN_INVALID_ADDRESS: KernReturn = 1;
pub const KERN_PROTECTION_FAILURE: KernReturn = 2;
pub const KERN_INVALID_ARGUMENT: KernReturn = 4;
pub const KERN_FAILURE: KernReturn = 5;
pub const KERN_INVALID_NAME: KernReturn = 15;
pub const KERN_INVALID_RIGHT: KernReturn = 17;

pub const MACH_SEND_INVALID_DEST: KernReturn = 0x1000_0003;
pub const MACH_SEND_TIMED_OUT: KernReturn = 0x1000_0004;
pub const MACH_SEND_MSG_TOO_SMALL: KernReturn = 0x1000_0008;
pub const MACH_RCV_INVALID_NAME: KernReturn = 0x1000_4002;
pub const MACH_RCV_TIMED_OUT: KernReturn = 0x1000_4003;
pub const MACH_RCV_TOO_LARGE: KernReturn = 0x1000_4004;

/// MIG reply code for a request the server does not understand.
pub const MIG_BAD_ID: KernReturn = -303;

/// Kind of receive-capable right to allocate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PortRight {
    Receive,
    PortSet,
}

/// Result of checking whether a process identifier names a live process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessProbe {
    Alive,
    Missing,
}

/// Scheduling status of a process, from the BSD process table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessStatus {
    Idle,
    Running,
    Sleeping,
    Stopped,
    Zombie,
    Unknown(u32),
}

impl ProcessStatus {
    /// Interpret a `p_stat` value (`SIDL` through `SZOMB`).
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ProcessStatus::Idle,
            2 => ProcessStatus::Running,
            3 => ProcessStatus::Sleeping,
            4 => ProcessStatus::Stopped,
            5 => ProcessStatus::Zombie,
            n => ProcessStatus::Unknown(n),
        }
    }
}

/// Identity and scheduling status of a process, from the BSD process table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub uid: Uid,
    pub gid: Gid,
    pub status: ProcessStatus,
}

/// Kernel primitives for controlling another task.
///
/// # Safety
///
/// [`Kernel::task_threads()`] and [`Kernel::vm_read()`] return the address of an
/// out-of-line buffer mapped into the caller's own address space. Implementors must
/// guarantee that the returned address is valid for reads of the reported element
/// count (and suitably aligned for `u32` in the thread-list case) until it is passed
/// to [`Kernel::vm_deallocate()`].
pub unsafe trait Kernel: fmt::Debug + Send + Sync {
    /// Acquire a send right to the task of `pid`.
    fn task_for_pid(&self, pid: Pid) -> KernResult<Port>;

    /// Check whether `pid` exists, independently of any capability.
    fn probe_process(&self, pid: Pid) -> ProcessProbe;

    fn process_info(&self, pid: Pid) -> KernResult<ProcessInfo>;

    fn task_suspend(&self, task: Port) -> KernResult<()>;

    fn task_resume(&self, task: Port) -> KernResult<()>;

    /// The kernel's own suspend count for `task`, across all suspenders.
    fn task_suspend_count(&self, task: Port) -> KernResult<u32>;

    fn task_terminate(&self, task: Port) -> KernResult<()>;

    /// Snapshot the threads of `task`.
    ///
    /// Returns the address and element count of a kernel-allocated array of thread
    /// port names. Both the names and the array must be released by the caller.
    fn task_threads(&self, task: Port) -> KernResult<(VmAddress, u32)>;

    /// Drop one user reference to a send (or dead-name) right.
    fn port_deallocate(&self, name: Port) -> KernResult<()>;

    /// Read `size` bytes at `address` in `task` into a kernel-allocated buffer.
    fn vm_read(&self, task: Port, address: u64, size: u64) -> KernResult<(VmAddress, u32)>;

    /// Release a buffer returned by [`Kernel::vm_read()`] or [`Kernel::task_threads()`].
    fn vm_deallocate(&self, address: VmAddress, size: u64) -> KernResult<()>;

    fn vm_write(&self, task: Port, address: u64, data: &[u8]) -> KernResult<()>;

    fn page_size(&self) -> u64;

    /// Read the thread state of `flavor` into `state`, returning the word count the
    /// kernel filled in.
    fn thread_get_state(&self, thread: Port, flavor: Flavor, state: &mut [u32]) -> KernResult<u32>;

    fn thread_set_state(&self, thread: Port, flavor: Flavor, state: &[u32]) -> KernResult<()>;

    fn port_allocate(&self, right: PortRight) -> KernResult<Port>;

    /// Make a send right for a receive right we hold.
    fn port_insert_send_right(&self, port: Port) -> KernResult<()>;

    fn port_move_member(&self, member: Port, set: Port) -> KernResult<()>;

    /// Destroy a receive right or port set.
    fn port_destroy_receive(&self, port: Port) -> KernResult<()>;

    fn set_exception_ports(
        &self,
        task: Port,
        mask: u32,
        port: Port,
        behavior: i32,
        flavor: Flavor,
    ) -> KernResult<()>;

    /// Receive one message on `port` (a receive right or port set) into `buf`.
    ///
    /// Returns `Ok(None)` if `timeout` elapsed first. `None` blocks indefinitely.
    fn msg_receive(&self, port: Port, buf: &mut [u8], timeout: Option<Duration>) -> KernResult<Option<usize>>;

    /// Send the fully-encoded message `msg`.
    fn msg_send(&self, msg: &[u8], timeout: Option<Duration>) -> KernResult<()>;
}
