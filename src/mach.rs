//! [`Kernel`] binding for the host's Mach kernel.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::time::Duration;

use mach2::kern_return::{kern_return_t, KERN_SUCCESS as MACH_KERN_SUCCESS};
use mach2::message::{
    mach_msg, mach_msg_header_t, mach_msg_type_number_t, MACH_MSG_SUCCESS, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_RCV_TIMEOUT, MACH_SEND_MSG, MACH_SEND_TIMEOUT,
};
use mach2::port::{mach_port_name_t, mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_PORT_SET, MACH_PORT_RIGHT_RECEIVE};
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, natural_t, vm_offset_t};
use nix::errno::Errno;
use nix::sys::signal;
use nix::unistd::{sysconf, SysconfVar};

use crate::kernel::{
    Flavor, Gid, KernResult, KernReturn, Kernel, Pid, Port, PortRight, ProcessInfo, ProcessProbe, ProcessStatus,
    Uid, VmAddress, KERN_FAILURE, MACH_RCV_TIMED_OUT,
};

const MACH_PORT_TYPE_PORT_SET: u32 = 1 << (16 + MACH_PORT_RIGHT_PORT_SET);
const MACH_TASK_BASIC_INFO: u32 = 20;
const FALLBACK_PAGE_SIZE: u64 = 0x4000;

#[repr(C, packed(4))]
#[derive(Default)]
struct MachTaskBasicInfo {
    virtual_size: u64,
    resident_size: u64,
    resident_size_max: u64,
    user_time: [i32; 2],
    system_time: [i32; 2],
    policy: i32,
    suspend_count: i32,
}

const MACH_TASK_BASIC_INFO_COUNT: mach_msg_type_number_t =
    (mem::size_of::<MachTaskBasicInfo>() / mem::size_of::<natural_t>()) as mach_msg_type_number_t;

extern "C" {
    fn task_terminate(target_task: mach_port_t) -> kern_return_t;

    fn task_info(
        target_task: mach_port_t,
        flavor: u32,
        task_info_out: *mut c_int,
        task_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: c_int,
        new_flavor: c_int,
    ) -> kern_return_t;

    fn mach_port_mod_refs(task: mach_port_t, name: mach_port_name_t, right: u32, delta: c_int) -> kern_return_t;

    fn mach_port_move_member(task: mach_port_t, member: mach_port_name_t, after: mach_port_name_t) -> kern_return_t;

    fn mach_port_type(task: mach_port_t, name: mach_port_name_t, ptype: *mut u32) -> kern_return_t;
}

fn check(code: kern_return_t) -> KernResult<()> {
    if code == MACH_KERN_SUCCESS {
        Ok(())
    } else {
        Err(code)
    }
}

fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().min(u128::from(u32::MAX)) as u32
}

// Messages are exchanged through a `u64` buffer so the header is suitably aligned.
fn aligned(len: usize) -> Vec<u64> {
    vec![0u64; (len + 7) / 8]
}

/// The running kernel, acting with the controlling process's own task port.
#[derive(Debug)]
pub struct MachKernel {
    self_task: Port,
}

impl MachKernel {
    pub fn new() -> Self {
        // SAFETY: `mach_task_self()` only reads the cached self port.
        let self_task = unsafe { mach2::traps::mach_task_self() };

        Self { self_task }
    }

    /// Act on behalf of `self_task` instead of the calling process.
    pub fn with_self_task(self_task: Port) -> Self {
        Self { self_task }
    }
}

impl Default for MachKernel {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Kernel for MachKernel {
    fn task_for_pid(&self, pid: Pid) -> KernResult<Port> {
        let mut task: mach_port_name_t = MACH_PORT_NULL;

        // SAFETY: `task` is a valid out-pointer.
        check(unsafe { mach2::traps::task_for_pid(self.self_task, pid.as_raw(), &mut task) })?;

        Ok(task)
    }

    fn probe_process(&self, pid: Pid) -> ProcessProbe {
        match signal::kill(pid, None) {
            Err(Errno::ESRCH) => ProcessProbe::Missing,
            _ => ProcessProbe::Alive,
        }
    }

    fn process_info(&self, pid: Pid) -> KernResult<ProcessInfo> {
        // SAFETY: all-zero is a valid `proc_bsdinfo`.
        let mut info: libc::proc_bsdinfo = unsafe { mem::zeroed() };
        let size = mem::size_of::<libc::proc_bsdinfo>() as c_int;

        // SAFETY: `info` is valid for writes of `size` bytes.
        let written = unsafe {
            libc::proc_pidinfo(pid.as_raw(), libc::PROC_PIDTBSDINFO, 0, &mut info as *mut _ as *mut c_void, size)
        };

        if written != size {
            return Err(KERN_FAILURE);
        }

        Ok(ProcessInfo {
            pid: Pid::from_raw(info.pbi_pid as i32),
            ppid: Pid::from_raw(info.pbi_ppid as i32),
            uid: Uid::from_raw(info.pbi_uid),
            gid: Gid::from_raw(info.pbi_gid),
            status: ProcessStatus::from_raw(info.pbi_status),
        })
    }

    fn task_suspend(&self, task: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on a port name.
        check(unsafe { mach2::task::task_suspend(task) })
    }

    fn task_resume(&self, task: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on a port name.
        check(unsafe { mach2::task::task_resume(task) })
    }

    fn task_suspend_count(&self, task: Port) -> KernResult<u32> {
        let mut info = MachTaskBasicInfo::default();
        let mut count = MACH_TASK_BASIC_INFO_COUNT;

        // SAFETY: `info` holds `count` naturals.
        check(unsafe {
            task_info(task, MACH_TASK_BASIC_INFO, &mut info as *mut _ as *mut c_int, &mut count)
        })?;

        let suspend_count = info.suspend_count;

        Ok(suspend_count.max(0) as u32)
    }

    fn task_terminate(&self, task: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on a port name.
        check(unsafe { task_terminate(task) })
    }

    fn task_threads(&self, task: Port) -> KernResult<(VmAddress, u32)> {
        let mut list: mach2::mach_types::thread_act_array_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;

        // SAFETY: both are valid out-pointers. The kernel maps the array into our space.
        check(unsafe { mach2::task::task_threads(task, &mut list, &mut count) })?;

        Ok((list as VmAddress, count))
    }

    fn port_deallocate(&self, name: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on a port name.
        check(unsafe { mach2::mach_port::mach_port_deallocate(self.self_task, name) })
    }

    fn vm_read(&self, task: Port, address: u64, size: u64) -> KernResult<(VmAddress, u32)> {
        let mut data: vm_offset_t = 0;
        let mut count: mach_msg_type_number_t = 0;

        // SAFETY: both are valid out-pointers. The kernel maps the copy into our space.
        check(unsafe {
            mach2::vm::mach_vm_read(task, address as mach_vm_address_t, size as mach_vm_size_t, &mut data, &mut count)
        })?;

        Ok((data as VmAddress, count))
    }

    fn vm_deallocate(&self, address: VmAddress, size: u64) -> KernResult<()> {
        // SAFETY: `address` was mapped by the kernel on our behalf.
        check(unsafe {
            mach2::vm::mach_vm_deallocate(self.self_task, address as mach_vm_address_t, size as mach_vm_size_t)
        })
    }

    fn vm_write(&self, task: Port, address: u64, data: &[u8]) -> KernResult<()> {
        // SAFETY: `data` is valid for reads of its length for the duration of the call.
        check(unsafe {
            mach2::vm::mach_vm_write(
                task,
                address as mach_vm_address_t,
                data.as_ptr() as vm_offset_t,
                data.len() as mach_msg_type_number_t,
            )
        })
    }

    fn page_size(&self) -> u64 {
        match sysconf(SysconfVar::PAGE_SIZE) {
            Ok(Some(size)) if size > 0 => size as u64,
            _ => FALLBACK_PAGE_SIZE,
        }
    }

    fn thread_get_state(&self, thread: Port, flavor: Flavor, state: &mut [u32]) -> KernResult<u32> {
        let mut count = state.len() as mach_msg_type_number_t;

        // SAFETY: `state` holds `count` naturals.
        check(unsafe { mach2::thread_act::thread_get_state(thread, flavor, state.as_mut_ptr(), &mut count) })?;

        Ok(count)
    }

    fn thread_set_state(&self, thread: Port, flavor: Flavor, state: &[u32]) -> KernResult<()> {
        let mut words = state.to_vec();

        // SAFETY: `words` holds `len` naturals; the kernel only reads them.
        check(unsafe {
            mach2::thread_act::thread_set_state(
                thread,
                flavor,
                words.as_mut_ptr(),
                words.len() as mach_msg_type_number_t,
            )
        })
    }

    fn port_allocate(&self, right: PortRight) -> KernResult<Port> {
        let right = match right {
            PortRight::Receive => MACH_PORT_RIGHT_RECEIVE,
            PortRight::PortSet => MACH_PORT_RIGHT_PORT_SET,
        };

        let mut name: mach_port_name_t = MACH_PORT_NULL;

        // SAFETY: `name` is a valid out-pointer.
        check(unsafe { mach2::mach_port::mach_port_allocate(self.self_task, right, &mut name) })?;

        Ok(name)
    }

    fn port_insert_send_right(&self, port: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on port names.
        check(unsafe {
            mach2::mach_port::mach_port_insert_right(self.self_task, port, port, MACH_MSG_TYPE_MAKE_SEND)
        })
    }

    fn port_move_member(&self, member: Port, set: Port) -> KernResult<()> {
        // SAFETY: plain kernel call on port names.
        check(unsafe { mach_port_move_member(self.self_task, member, set) })
    }

    fn port_destroy_receive(&self, port: Port) -> KernResult<()> {
        let right = if self.port_is_set(port) { MACH_PORT_RIGHT_PORT_SET } else { MACH_PORT_RIGHT_RECEIVE };

        // SAFETY: plain kernel call on a port name.
        check(unsafe { mach_port_mod_refs(self.self_task, port, right, -1) })
    }

    fn set_exception_ports(&self, task: Port, mask: u32, port: Port, behavior: i32, flavor: Flavor) -> KernResult<()> {
        // SAFETY: plain kernel call on port names.
        check(unsafe { task_set_exception_ports(task, mask, port, behavior, flavor) })
    }

    fn msg_receive(&self, port: Port, buf: &mut [u8], timeout: Option<Duration>) -> KernResult<Option<usize>> {
        let mut storage = aligned(buf.len());
        let capacity = (storage.len() * 8) as mach_msg_type_number_t;

        let (options, ms) = match timeout {
            Some(timeout) => (MACH_RCV_MSG | MACH_RCV_TIMEOUT, timeout_ms(timeout)),
            None => (MACH_RCV_MSG, MACH_MSG_TIMEOUT_NONE),
        };

        let header = storage.as_mut_ptr() as *mut mach_msg_header_t;

        // SAFETY: `header` points at `capacity` writable, aligned bytes.
        let code = unsafe { mach_msg(header, options, 0, capacity, port, ms, MACH_PORT_NULL) };

        match code {
            MACH_MSG_SUCCESS => {},
            MACH_RCV_TIMED_OUT => return Ok(None),
            code => return Err(code),
        }

        // SAFETY: a successful receive wrote a header.
        let len = (unsafe { (*header).msgh_size } as usize).min(buf.len());

        // SAFETY: `storage` holds at least `len` initialized bytes.
        let bytes = unsafe { std::slice::from_raw_parts(storage.as_ptr() as *const u8, len) };
        buf[..len].copy_from_slice(bytes);

        Ok(Some(len))
    }

    fn msg_send(&self, msg: &[u8], timeout: Option<Duration>) -> KernResult<()> {
        let mut storage = aligned(msg.len());

        // SAFETY: `storage` holds at least `msg.len()` bytes.
        unsafe { std::ptr::copy_nonoverlapping(msg.as_ptr(), storage.as_mut_ptr() as *mut u8, msg.len()) };

        let (options, ms) = match timeout {
            Some(timeout) => (MACH_SEND_MSG | MACH_SEND_TIMEOUT, timeout_ms(timeout)),
            None => (MACH_SEND_MSG, MACH_MSG_TIMEOUT_NONE),
        };

        let header = storage.as_mut_ptr() as *mut mach_msg_header_t;

        // SAFETY: `header` points at a complete, aligned message of `msg.len()` bytes.
        let code: KernReturn = unsafe {
            mach_msg(header, options, msg.len() as mach_msg_type_number_t, 0, MACH_PORT_NULL, ms, MACH_PORT_NULL)
        };

        check(code)
    }
}

impl MachKernel {
    fn port_is_set(&self, port: Port) -> bool {
        let mut ty: u32 = 0;

        // SAFETY: `ty` is a valid out-pointer.
        let code = unsafe { mach_port_type(self.self_task, port, &mut ty) };

        code == MACH_KERN_SUCCESS && ty & MACH_PORT_TYPE_PORT_SET != 0
    }
}
