use std::io;

use crate::kernel::{
    Flavor, KernResult, KernReturn, Pid, Port, KERN_INVALID_ARGUMENT,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Permission denied acquiring task for pid = {pid} (kern_return = {code})")]
    PermissionDenied { pid: Pid, code: KernReturn },

    #[error("No such process: pid = {pid}")]
    NoSuchProcess { pid: Pid, code: KernReturn },

    #[error("Invalid argument to `{call}` (kern_return = {code})")]
    InvalidArgument { call: &'static str, code: KernReturn },

    #[error("Invalid address = {address:#x} (kern_return = {code})")]
    InvalidAddress { address: u64, code: KernReturn },

    #[error("Memory at address = {address:#x} is not writable (kern_return = {code})")]
    ReadOnlyMemory { address: u64, code: KernReturn },

    #[error("Unexpected thread state size for flavor = {flavor}: expected {expected} words, got {actual}")]
    UnexpectedStateSize { flavor: Flavor, expected: u32, actual: u32 },

    #[error("Resume of task port = {task:#x} without a matching suspend")]
    OverResume { task: Port },

    #[error("Port = {name:#x} was already released")]
    AlreadyReleased { name: Port },

    #[error("Kernel call `{call}` failed (kern_return = {code:#x})")]
    Kernel { call: &'static str, code: KernReturn },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Exception handler failed: {0}")]
    Handler(String),

    #[error("Exception monitor is {actual:?}, expected {expected:?}")]
    MonitorState {
        expected: crate::exception::MonitorState,
        actual: crate::exception::MonitorState,
    },

    #[error("Target not ready: {0}")]
    NotReady(String),

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify a kernel refusal that has no call-specific meaning.
    pub(crate) fn from_kern(call: &'static str, code: KernReturn) -> Self {
        match code {
            KERN_INVALID_ARGUMENT => Error::InvalidArgument { call, code },
            _ => Error::Kernel { call, code },
        }
    }

    /// The raw kernel return code behind this error, if any.
    pub fn kern_return(&self) -> Option<KernReturn> {
        match self {
            Error::PermissionDenied { code, .. }
            | Error::NoSuchProcess { code, .. }
            | Error::InvalidArgument { code, .. }
            | Error::InvalidAddress { code, .. }
            | Error::ReadOnlyMemory { code, .. }
            | Error::Kernel { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` if the caller should obtain more privilege and try again.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied { .. })
    }
}

pub(crate) trait ResultExt<T> {
    /// Attach the name of the failing kernel call.
    fn or_kernel(self, call: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for KernResult<T> {
    fn or_kernel(self, call: &'static str) -> Result<T> {
        self.map_err(|code| Error::from_kern(call, code))
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
pub(crate) use internal_error;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{KERN_FAILURE, KERN_INVALID_ADDRESS};

    #[test]
    fn test_from_kern_classifies_invalid_argument() {
        let err = Error::from_kern("task_suspend", KERN_INVALID_ARGUMENT);
        assert!(matches!(err, Error::InvalidArgument { call: "task_suspend", .. }));
        assert_eq!(err.kern_return(), Some(KERN_INVALID_ARGUMENT));
    }

    #[test]
    fn test_from_kern_keeps_raw_code() {
        let err = Error::from_kern("mach_vm_read", KERN_FAILURE);
        assert!(matches!(err, Error::Kernel { code: KERN_FAILURE, .. }));
        assert!(!err.is_permission_denied());
    }

    #[test]
    fn test_or_kernel() {
        let res: KernResult<()> = Err(KERN_INVALID_ADDRESS);
        let err = res.or_kernel("task_threads").unwrap_err();
        assert_eq!(err.kern_return(), Some(KERN_INVALID_ADDRESS));

        let ok: KernResult<u32> = Ok(3);
        assert_eq!(ok.or_kernel("task_threads").unwrap(), 3);
    }

    #[test]
    fn test_over_resume_has_no_kern_return() {
        let err = Error::OverResume { task: 0x103 };
        assert_eq!(err.kern_return(), None);
    }
}
