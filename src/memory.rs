//! Reading and writing a task's virtual memory.
//!
//! The caller decides whether the task should be suspended first. Neither operation
//! suspends implicitly, so live memory of a running task can be read on purpose.

use std::slice;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::kernel::{
    KernResult, KernReturn, KernelRef, Port, VmAddress, KERN_INVALID_ADDRESS,
    KERN_PROTECTION_FAILURE,
};
use crate::task::Task;

impl Task {
    /// Read up to `len` bytes at `address`.
    ///
    /// The result may be shorter than `len` when the tail of the range is unmapped.
    /// A short read is a partial success; only a range with no readable prefix fails,
    /// with [`Error::InvalidAddress`].
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        if self.is_released() {
            return Err(Error::AlreadyReleased { name: self.port() });
        }

        if len == 0 {
            return Ok(vec![]);
        }

        match vm_read(self.kernel(), self.port(), address, len as u64) {
            Ok(data) => Ok(data),
            Err(KERN_INVALID_ADDRESS) | Err(KERN_PROTECTION_FAILURE) => {
                debug!(address, len, "whole-range read failed, reading readable prefix");
                self.read_mapped_prefix(address, len)
            },
            Err(code) => Err(read_error(address, code)),
        }
    }

    // Read page by page until the first unmapped or unreadable page.
    fn read_mapped_prefix(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let page_size = self.kernel().page_size().max(1);
        let end = address.saturating_add(len as u64);

        let mut data = Vec::with_capacity(len);
        let mut cursor = address;

        while cursor < end {
            let page_end = (cursor / page_size + 1).saturating_mul(page_size);
            let chunk = page_end.min(end) - cursor;

            match vm_read(self.kernel(), self.port(), cursor, chunk) {
                Ok(bytes) => {
                    trace!(address = cursor, len = bytes.len(), "read page");
                    data.extend_from_slice(&bytes);
                    cursor += chunk;
                },
                Err(KERN_INVALID_ADDRESS) | Err(KERN_PROTECTION_FAILURE) => break,
                Err(code) => return Err(read_error(cursor, code)),
            }
        }

        if data.is_empty() {
            return Err(Error::InvalidAddress { address, code: KERN_INVALID_ADDRESS });
        }

        Ok(data)
    }

    /// Write all of `data` at `address`, or nothing.
    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        if self.is_released() {
            return Err(Error::AlreadyReleased { name: self.port() });
        }

        if data.is_empty() {
            return Ok(());
        }

        self.kernel()
            .vm_write(self.port(), address, data)
            .map_err(|code| match code {
                KERN_INVALID_ADDRESS => Error::InvalidAddress { address, code },
                KERN_PROTECTION_FAILURE => Error::ReadOnlyMemory { address, code },
                _ => Error::from_kern("mach_vm_write", code),
            })?;

        debug!(address, len = data.len(), "wrote memory");

        Ok(())
    }

    /// Read a little-endian `u64` at `address`.
    pub fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_memory(address, 8)?;

        let mut word = [0u8; 8];

        if bytes.len() != word.len() {
            return Err(Error::InvalidAddress { address: address + bytes.len() as u64, code: KERN_INVALID_ADDRESS });
        }

        word.copy_from_slice(&bytes);

        Ok(u64::from_le_bytes(word))
    }

    /// Write a little-endian `u64` at `address`.
    pub fn write_u64(&self, address: u64, value: u64) -> Result<()> {
        self.write_memory(address, &value.to_le_bytes())
    }
}

fn read_error(address: u64, code: KernReturn) -> Error {
    match code {
        KERN_INVALID_ADDRESS | KERN_PROTECTION_FAILURE => Error::InvalidAddress { address, code },
        _ => Error::from_kern("mach_vm_read", code),
    }
}

// One kernel read, copied out of the kernel's buffer before it is released.
fn vm_read(kernel: &KernelRef, task: Port, address: u64, len: u64) -> KernResult<Vec<u8>> {
    let (data, count) = kernel.vm_read(task, address, len)?;
    let buffer = VmBuffer { kernel, address: data, len: count as usize };

    Ok(buffer.as_slice().to_vec())
}

/// Out-of-line buffer the kernel mapped into our address space, released on drop.
struct VmBuffer<'k> {
    kernel: &'k KernelRef,
    address: VmAddress,
    len: usize,
}

impl<'k> VmBuffer<'k> {
    fn as_slice(&self) -> &[u8] {
        if self.len == 0 || self.address == 0 {
            return &[];
        }

        // SAFETY: the `Kernel` contract guarantees `len` readable bytes at `address`
        // until the buffer is deallocated in `drop()`.
        unsafe { slice::from_raw_parts(self.address as *const u8, self.len) }
    }
}

impl<'k> Drop for VmBuffer<'k> {
    fn drop(&mut self) {
        if self.address == 0 {
            return;
        }

        if let Err(code) = self.kernel.vm_deallocate(self.address, self.len as u64) {
            warn!(code, "could not deallocate read buffer");
        }
    }
}
