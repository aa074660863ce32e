//! Control another process through its Mach task port.
//!
//! `taskport` acquires a task's control capability, suspends and resumes it, reads and
//! writes its memory, snapshots and edits per-thread registers, and receives and
//! answers its exceptions. Every kernel interaction goes through the [`Kernel`] trait:
//! [`MachKernel`] on macOS, or the in-memory [`SimKernel`] anywhere.

pub mod error;
pub mod exception;
pub mod kernel;
#[cfg(target_os = "macos")]
pub mod mach;
mod memory;
pub mod message;
pub mod ready;
pub mod regs;
pub mod session;
pub mod sim;
pub mod task;

pub use error::{Error, Result};
pub use exception::{
    Behavior, ExceptionMask, ExceptionMonitor, ExceptionNotification, ExceptionType, HandlerError, HandlerResult,
    MonitorConfig, MonitorState, MonitorStats, Resume, Stopper,
};
pub use kernel::{Gid, Kernel, KernelRef, Pid, Port, ProcessInfo, ProcessStatus, Uid};
pub use nix::sys::signal::Signal;
#[cfg(target_os = "macos")]
pub use mach::MachKernel;
pub use regs::{Arch, ArmThreadState64, RegisterSnapshot, X86ThreadState64};
pub use session::{AttachOptions, Session};
pub use sim::SimKernel;
pub use task::{Task, Thread};
