//! An in-memory [`Kernel`] that runs on any host.
//!
//! `SimKernel` models the parts of Mach this crate relies on: one port namespace (the
//! controlling task's), processes with memory regions and threads, message queues
//! with port sets, send-once reply rights, and exception port registration. Out-of-line
//! buffers are real heap allocations, so the same unsafe code paths run against it as
//! against the real kernel.
//!
//! Test code drives the target side through the inherent methods: spawning processes,
//! raising exceptions, and inspecting what the controller left behind.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::kernel::{
    Flavor, Gid, KernResult, KernReturn, Kernel, Pid, Port, PortRight, ProcessInfo, ProcessProbe,
    ProcessStatus, Uid, VmAddress, KERN_FAILURE, KERN_INVALID_ADDRESS, KERN_INVALID_ARGUMENT, KERN_INVALID_NAME,
    KERN_INVALID_RIGHT, KERN_PROTECTION_FAILURE, MACH_RCV_INVALID_NAME, MACH_RCV_TOO_LARGE,
    MACH_SEND_INVALID_DEST, MACH_SEND_MSG_TOO_SMALL, MACH_SEND_TIMED_OUT, PORT_NULL,
};
use crate::message::{
    ExceptionReply, ExceptionRequest, Header, EXCEPTION_RAISE_ID, MACH_EXCEPTION_RAISE_ID,
    MACH_MSGH_BITS_COMPLEX, MACH_MSG_TYPE_MOVE_SEND, MACH_MSG_TYPE_MOVE_SEND_ONCE,
};
use crate::regs::{Arch, RegisterSnapshot};

const FIRST_PID: i32 = 1000;
const FIRST_NAME: Port = 0x103;
const NAME_STRIDE: Port = 0x100;
const DEFAULT_PAGE_SIZE: u64 = 0x1000;
const THREAD_PC_BASE: u64 = 0x1_0000_0000;
const DEFAULT_PPID: i32 = 1;
const DEFAULT_UID: u32 = 501;
const DEFAULT_GID: u32 = 20;

/// `MACH_PORT_QLIMIT_DEFAULT`.
const QUEUE_LIMIT: usize = 5;

const MACH_EXCEPTION_CODES: i32 = i32::MIN;

/// Description of a simulated process, consumed by [`SimKernel::spawn()`].
#[derive(Clone, Debug)]
pub struct SimProcess {
    regions: Vec<Region>,
    threads: usize,
    arch: Arch,
    denied: bool,
    status: ProcessStatus,
    ppid: Pid,
    uid: Uid,
    gid: Gid,
}

impl Default for SimProcess {
    fn default() -> Self {
        Self {
            regions: vec![],
            threads: 1,
            arch: Arch::native().unwrap_or(Arch::X86_64),
            denied: false,
            status: ProcessStatus::Running,
            ppid: Pid::from_raw(DEFAULT_PPID),
            uid: Uid::from_raw(DEFAULT_UID),
            gid: Gid::from_raw(DEFAULT_GID),
        }
    }
}

impl SimProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register layout of every thread.
    pub fn arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self
    }

    pub fn threads(mut self, count: usize) -> Self {
        self.threads = count;
        self
    }

    /// Map `data` read-write at `start`.
    pub fn region(mut self, start: u64, data: Vec<u8>) -> Self {
        self.regions.push(Region { start, data, readable: true, writable: true });
        self
    }

    pub fn read_only_region(mut self, start: u64, data: Vec<u8>) -> Self {
        self.regions.push(Region { start, data, readable: true, writable: false });
        self
    }

    /// Map `len` bytes with no access at `start`.
    pub fn guard_region(mut self, start: u64, len: usize) -> Self {
        self.regions.push(Region { start, data: vec![0; len], readable: false, writable: false });
        self
    }

    /// Refuse `task_for_pid()` for this process, as for a caller without privilege.
    pub fn denied(mut self) -> Self {
        self.denied = true;
        self
    }

    /// Scheduling status reported by the process table. Mach suspensions do not
    /// change it.
    pub fn status(mut self, status: ProcessStatus) -> Self {
        self.status = status;
        self
    }

    pub fn parent(mut self, ppid: Pid) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn owner(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }
}

/// How a raised exception was answered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyOutcome {
    Replied(KernReturn),

    /// The reply right was destroyed without a reply.
    Destroyed,
}

/// The faulting side of a raised exception, waiting for its reply.
#[derive(Debug)]
pub struct PendingReply {
    shared: Arc<Shared>,
    slot: u64,
}

impl PendingReply {
    /// The outcome, if the exception has been answered.
    pub fn outcome(&self) -> Option<ReplyOutcome> {
        lock(&self.shared).replies.get(&self.slot).copied().flatten()
    }

    /// Block until the exception is answered, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<ReplyOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.shared);

        loop {
            if let Some(outcome) = state.replies.get(&self.slot).copied().flatten() {
                return Some(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// In-memory kernel. Clones share state.
#[derive(Clone, Debug)]
pub struct SimKernel {
    shared: Arc<Shared>,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: u64) -> Self {
        let shared = Shared {
            state: Mutex::new(State::new()),
            changed: Condvar::new(),
            page_size,
        };

        Self { shared: Arc::new(shared) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.shared)
    }

    fn notify(&self) {
        self.shared.changed.notify_all();
    }

    /// Create a process, returning its pid.
    pub fn spawn(&self, desc: SimProcess) -> Pid {
        let mut state = self.lock();

        let pid = state.next_pid;
        state.next_pid += 1;

        let threads = (0..desc.threads)
            .map(|index| {
                let tid = state.next_object();
                SimThread { tid, arch: desc.arch, words: initial_state(desc.arch, index) }
            })
            .collect();

        let process = Process {
            regions: desc.regions,
            threads,
            denied: desc.denied,
            status: desc.status,
            ppid: desc.ppid,
            uid: desc.uid,
            gid: desc.gid,
            suspend_count: 0,
            terminated: false,
            exception_ports: HashMap::new(),
        };

        state.processes.insert(pid, process);
        trace!(pid, "spawned simulated process");

        Pid::from_raw(pid)
    }

    /// Raise `exception` on thread `index` of `pid`, as the kernel would on a fault.
    ///
    /// Returns `None` if no live port is registered for the exception.
    pub fn raise_exception(&self, pid: Pid, index: usize, exception: i32, codes: &[i64]) -> Option<PendingReply> {
        let mut state = self.lock();

        let process = state.processes.get(&pid.as_raw()).filter(|p| !p.terminated)?;
        let tid = process.threads.get(index)?.tid;
        let registration = *process.exception_ports.get(&exception)?;

        if !state.ports.contains_key(&registration.port) {
            return None;
        }

        let slot = state.next_object();
        state.replies.insert(slot, None);

        let payload = Payload::Exception {
            pid: pid.as_raw(),
            tid,
            exception,
            codes: codes.to_vec(),
            behavior: registration.behavior,
            reply: slot,
        };

        let seq = state.next_object();
        state.ports.get_mut(&registration.port)?.queue.push_back(Queued { seq, payload });

        drop(state);
        self.notify();

        Some(PendingReply { shared: self.shared.clone(), slot })
    }

    /// Whether a live port is registered for `exception` on `pid`.
    pub fn exception_port_registered(&self, pid: Pid, exception: i32) -> bool {
        let state = self.lock();

        state
            .processes
            .get(&pid.as_raw())
            .and_then(|p| p.exception_ports.get(&exception))
            .map_or(false, |r| state.ports.contains_key(&r.port))
    }

    pub fn suspend_count(&self, pid: Pid) -> Option<u32> {
        self.lock().processes.get(&pid.as_raw()).map(|p| p.suspend_count)
    }

    /// Suspend `pid` as some other actor would, outside any capability.
    pub fn suspend_externally(&self, pid: Pid) {
        if let Some(process) = self.lock().processes.get_mut(&pid.as_raw()) {
            process.suspend_count += 1;
        }
    }

    /// Make `pid` exit.
    pub fn terminate(&self, pid: Pid) {
        if let Some(process) = self.lock().processes.get_mut(&pid.as_raw()) {
            process.terminated = true;
        }
        self.notify();
    }

    pub fn is_terminated(&self, pid: Pid) -> bool {
        self.lock().processes.get(&pid.as_raw()).map_or(true, |p| p.terminated)
    }

    /// Give the controller a send right to thread `index` of `pid`, as a message
    /// carrying that thread would.
    pub fn insert_thread_right(&self, pid: Pid, index: usize) -> Option<Port> {
        let mut state = self.lock();
        let tid = state.processes.get(&pid.as_raw())?.threads.get(index)?.tid;

        Some(state.insert_send(Object::Thread(pid.as_raw(), tid)))
    }

    /// Target memory, read without going through a capability.
    pub fn peek(&self, pid: Pid, address: u64, len: usize) -> Option<Vec<u8>> {
        let state = self.lock();
        let process = state.processes.get(&pid.as_raw())?;

        process.copy_out(address, len as u64, false).ok()
    }

    /// Raw state words of thread `index`.
    pub fn thread_state(&self, pid: Pid, index: usize) -> Option<Vec<u32>> {
        let state = self.lock();
        let process = state.processes.get(&pid.as_raw())?;

        process.threads.get(index).map(|t| t.words.clone())
    }

    /// Report `count` words from every `thread_get_state()`, regardless of flavor.
    pub fn set_state_count_override(&self, count: Option<u32>) {
        self.lock().state_count_override = count;
    }

    /// Names in the controller's port namespace, of any right type.
    pub fn outstanding_rights(&self) -> usize {
        self.lock().names.len()
    }

    /// Out-of-line buffers handed out and not yet deallocated.
    pub fn outstanding_allocations(&self) -> usize {
        self.lock().allocations.len()
    }
}

unsafe impl Kernel for SimKernel {
    fn task_for_pid(&self, pid: Pid) -> KernResult<Port> {
        let mut state = self.lock();

        match state.processes.get(&pid.as_raw()) {
            Some(process) if !process.terminated && !process.denied => {},
            _ => return Err(KERN_FAILURE),
        }

        Ok(state.insert_send(Object::Task(pid.as_raw())))
    }

    fn probe_process(&self, pid: Pid) -> ProcessProbe {
        match self.lock().processes.get(&pid.as_raw()) {
            Some(process) if !process.terminated => ProcessProbe::Alive,
            _ => ProcessProbe::Missing,
        }
    }

    fn process_info(&self, pid: Pid) -> KernResult<ProcessInfo> {
        let state = self.lock();
        let process = state.processes.get(&pid.as_raw()).ok_or(KERN_FAILURE)?;

        let status = if process.terminated { ProcessStatus::Zombie } else { process.status };

        Ok(ProcessInfo { pid, ppid: process.ppid, uid: process.uid, gid: process.gid, status })
    }

    fn task_suspend(&self, task: Port) -> KernResult<()> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        state.process_mut(pid)?.suspend_count += 1;

        Ok(())
    }

    fn task_resume(&self, task: Port) -> KernResult<()> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;
        let process = state.process_mut(pid)?;

        if process.suspend_count == 0 {
            return Err(KERN_FAILURE);
        }

        process.suspend_count -= 1;

        Ok(())
    }

    fn task_suspend_count(&self, task: Port) -> KernResult<u32> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        Ok(state.process_mut(pid)?.suspend_count)
    }

    fn task_terminate(&self, task: Port) -> KernResult<()> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        state.process_mut(pid)?.terminated = true;
        trace!(pid, "terminated simulated process");

        drop(state);
        self.notify();

        Ok(())
    }

    fn task_threads(&self, task: Port) -> KernResult<(VmAddress, u32)> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        let tids: Vec<u64> = state.process_mut(pid)?.threads.iter().map(|t| t.tid).collect();

        if tids.is_empty() {
            return Ok((0, 0));
        }

        let names: Box<[Port]> = tids.iter().map(|&tid| state.insert_send(Object::Thread(pid, tid))).collect();
        let address = names.as_ptr() as VmAddress;
        let count = names.len() as u32;

        state.allocations.insert(address, Allocation::Names(names));

        Ok((address, count))
    }

    fn port_deallocate(&self, name: Port) -> KernResult<()> {
        let mut state = self.lock();
        let entry = state.names.get_mut(&name).ok_or(KERN_INVALID_NAME)?;

        let mut destroyed_reply = None;

        if entry.send > 0 {
            entry.send -= 1;
        } else if entry.send_once {
            entry.send_once = false;
            if let Object::Reply(slot) = entry.object {
                destroyed_reply = Some(slot);
            }
        } else {
            return Err(KERN_INVALID_RIGHT);
        }

        if entry.is_empty() {
            state.names.remove(&name);
        }

        if let Some(slot) = destroyed_reply {
            state.destroy_reply(slot);
            drop(state);
            self.notify();
        }

        Ok(())
    }

    fn vm_read(&self, task: Port, address: u64, size: u64) -> KernResult<(VmAddress, u32)> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        if size == 0 {
            return Ok((0, 0));
        }

        let data = state.process_mut(pid)?.copy_out(address, size, true)?.into_boxed_slice();
        let buffer = data.as_ptr() as VmAddress;
        let count = data.len() as u32;

        state.allocations.insert(buffer, Allocation::Bytes(data));

        Ok((buffer, count))
    }

    fn vm_deallocate(&self, address: VmAddress, size: u64) -> KernResult<()> {
        let mut state = self.lock();

        let allocation = state.allocations.get(&address).ok_or(KERN_INVALID_ADDRESS)?;

        if allocation.size() != size {
            return Err(KERN_INVALID_ARGUMENT);
        }

        state.allocations.remove(&address);

        Ok(())
    }

    fn vm_write(&self, task: Port, address: u64, data: &[u8]) -> KernResult<()> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        state.process_mut(pid)?.copy_in(address, data)
    }

    fn page_size(&self) -> u64 {
        self.shared.page_size
    }

    fn thread_get_state(&self, thread: Port, flavor: Flavor, out: &mut [u32]) -> KernResult<u32> {
        let mut state = self.lock();
        let count_override = state.state_count_override;
        let thread = state.thread_mut(thread)?;

        if thread.arch.flavor() != flavor {
            return Err(KERN_INVALID_ARGUMENT);
        }

        let count = count_override.unwrap_or(thread.words.len() as u32);

        if count as usize > out.len() {
            return Err(KERN_INVALID_ARGUMENT);
        }

        let n = (count as usize).min(thread.words.len());
        out[..n].copy_from_slice(&thread.words[..n]);

        Ok(count)
    }

    fn thread_set_state(&self, thread: Port, flavor: Flavor, words: &[u32]) -> KernResult<()> {
        let mut state = self.lock();
        let thread = state.thread_mut(thread)?;

        if thread.arch.flavor() != flavor || thread.words.len() != words.len() {
            return Err(KERN_INVALID_ARGUMENT);
        }

        thread.words.copy_from_slice(words);

        Ok(())
    }

    fn port_allocate(&self, right: PortRight) -> KernResult<Port> {
        let mut state = self.lock();
        let id = state.next_object();

        let object = match right {
            PortRight::Receive => {
                state.ports.insert(id, SimPort::default());
                Object::Port(id)
            },
            PortRight::PortSet => {
                state.sets.insert(id);
                Object::PortSet(id)
            },
        };

        let name = state.fresh_name();
        state.names.insert(name, Entry { object, receive: true, send: 0, send_once: false });

        Ok(name)
    }

    fn port_insert_send_right(&self, port: Port) -> KernResult<()> {
        let mut state = self.lock();
        let entry = state.names.get_mut(&port).ok_or(KERN_INVALID_NAME)?;

        match entry.object {
            Object::Port(_) if entry.receive => {
                entry.send += 1;
                Ok(())
            },
            _ => Err(KERN_INVALID_RIGHT),
        }
    }

    fn port_move_member(&self, member: Port, set: Port) -> KernResult<()> {
        let mut state = self.lock();

        let port = match state.names.get(&member) {
            Some(Entry { object: Object::Port(id), receive: true, .. }) => *id,
            Some(_) => return Err(KERN_INVALID_RIGHT),
            None => return Err(KERN_INVALID_NAME),
        };

        let set = match state.names.get(&set) {
            Some(Entry { object: Object::PortSet(id), .. }) => *id,
            Some(_) => return Err(KERN_INVALID_RIGHT),
            None => return Err(KERN_INVALID_NAME),
        };

        state.ports.get_mut(&port).ok_or(KERN_INVALID_NAME)?.set = Some(set);

        Ok(())
    }

    fn port_destroy_receive(&self, name: Port) -> KernResult<()> {
        let mut state = self.lock();
        let entry = state.names.get_mut(&name).ok_or(KERN_INVALID_NAME)?;

        if !entry.receive {
            return Err(KERN_INVALID_RIGHT);
        }

        entry.receive = false;
        let object = entry.object;

        match object {
            Object::PortSet(id) => {
                state.names.remove(&name);
                state.sets.remove(&id);

                for port in state.ports.values_mut().filter(|p| p.set == Some(id)) {
                    port.set = None;
                }
            },
            Object::Port(id) => {
                match state.names.get_mut(&name) {
                    Some(entry) if entry.send > 0 => entry.object = Object::Dead,
                    _ => {
                        state.names.remove(&name);
                    },
                }

                if let Some(port) = state.ports.remove(&id) {
                    for queued in port.queue {
                        if let Payload::Exception { reply, .. } = queued.payload {
                            state.destroy_reply(reply);
                        }
                    }
                }
            },
            _ => return Err(KERN_INVALID_RIGHT),
        }

        drop(state);
        self.notify();

        Ok(())
    }

    fn set_exception_ports(&self, task: Port, mask: u32, port: Port, behavior: i32, _flavor: Flavor) -> KernResult<()> {
        let mut state = self.lock();
        let pid = state.task_pid(task)?;

        let target = if port == PORT_NULL {
            None
        } else {
            match state.names.get(&port) {
                Some(Entry { object: Object::Port(id), send, .. }) if *send > 0 => Some(*id),
                _ => return Err(KERN_INVALID_ARGUMENT),
            }
        };

        if !matches!(behavior & !MACH_EXCEPTION_CODES, 1..=3) {
            return Err(KERN_INVALID_ARGUMENT);
        }

        let process = state.process_mut(pid)?;

        for exception in (1..32).filter(|e| mask & (1 << e) != 0) {
            match target {
                Some(port) => {
                    process.exception_ports.insert(exception, Registration { port, behavior });
                },
                None => {
                    process.exception_ports.remove(&exception);
                },
            }
        }

        Ok(())
    }

    fn msg_receive(&self, port: Port, buf: &mut [u8], timeout: Option<Duration>) -> KernResult<Option<usize>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            let sources = state.receive_sources(port)?;

            if let Some(id) = state.oldest(&sources) {
                return state.deliver(id, buf).map(Some);
            }

            state = match deadline {
                None => self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return Ok(None);
                    }

                    self.shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                },
            };
        }
    }

    fn msg_send(&self, msg: &[u8], timeout: Option<Duration>) -> KernResult<()> {
        let header = Header::decode(msg).map_err(|_| MACH_SEND_MSG_TOO_SMALL)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();

        loop {
            let (object, send, send_once) = match state.names.get(&header.remote_port) {
                Some(entry) => (entry.object, entry.send, entry.send_once),
                None => return Err(MACH_SEND_INVALID_DEST),
            };

            match object {
                Object::Reply(slot) if send_once => {
                    let reply = ExceptionReply::decode(msg).map_err(|_| MACH_SEND_MSG_TOO_SMALL)?;

                    state.names.remove(&header.remote_port);
                    state.replies.insert(slot, Some(ReplyOutcome::Replied(reply.ret_code)));

                    drop(state);
                    self.notify();

                    return Ok(());
                },
                Object::Port(id) if send > 0 => {
                    let queued = state.ports.get(&id).map(|p| p.queue.len()).ok_or(MACH_SEND_INVALID_DEST)?;

                    if queued < QUEUE_LIMIT {
                        if header.remote_disposition() == u32::from(MACH_MSG_TYPE_MOVE_SEND) {
                            state.release_send(header.remote_port);
                        }

                        let seq = state.next_object();
                        let payload = Payload::Raw(msg.to_vec());
                        state.ports.get_mut(&id).ok_or(MACH_SEND_INVALID_DEST)?.queue.push_back(Queued { seq, payload });

                        drop(state);
                        self.notify();

                        return Ok(());
                    }
                },
                _ => return Err(MACH_SEND_INVALID_DEST),
            }

            // Queue full: wait for the receiver to make room.
            state = match deadline {
                None => self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        return Err(MACH_SEND_TIMED_OUT);
                    }

                    self.shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                },
            };
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, State> {
    shared.state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn initial_state(arch: Arch, index: usize) -> Vec<u32> {
    let words = vec![0u32; arch.state_count() as usize];

    match RegisterSnapshot::from_words(arch, &words) {
        Ok(mut snapshot) => {
            snapshot.set_pc(THREAD_PC_BASE + 0x1000 * index as u64);
            snapshot.to_words()
        },
        Err(_) => words,
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    changed: Condvar,
    page_size: u64,
}

#[derive(Clone, Debug)]
struct Region {
    start: u64,
    data: Vec<u8>,
    readable: bool,
    writable: bool,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end()
    }
}

#[derive(Debug)]
struct SimThread {
    tid: u64,
    arch: Arch,
    words: Vec<u32>,
}

#[derive(Clone, Copy, Debug)]
struct Registration {
    port: u64,
    behavior: i32,
}

#[derive(Debug)]
struct Process {
    regions: Vec<Region>,
    threads: Vec<SimThread>,
    denied: bool,
    status: ProcessStatus,
    ppid: Pid,
    uid: Uid,
    gid: Gid,
    suspend_count: u32,
    terminated: bool,
    exception_ports: HashMap<i32, Registration>,
}

impl Process {
    fn region_at(&self, address: u64) -> KernResult<&Region> {
        self.regions.iter().find(|r| r.contains(address)).ok_or(KERN_INVALID_ADDRESS)
    }

    fn copy_out(&self, address: u64, size: u64, check_access: bool) -> KernResult<Vec<u8>> {
        let end = address.checked_add(size).ok_or(KERN_INVALID_ADDRESS)?;
        let mut out = Vec::with_capacity(size as usize);
        let mut cursor = address;

        while cursor < end {
            let region = self.region_at(cursor)?;

            if check_access && !region.readable {
                return Err(KERN_PROTECTION_FAILURE);
            }

            let from = (cursor - region.start) as usize;
            let to = (end.min(region.end()) - region.start) as usize;

            out.extend_from_slice(&region.data[from..to]);
            cursor = region.start + to as u64;
        }

        Ok(out)
    }

    // All or nothing: the whole range is checked before any byte is written.
    fn copy_in(&mut self, address: u64, data: &[u8]) -> KernResult<()> {
        let end = address.checked_add(data.len() as u64).ok_or(KERN_INVALID_ADDRESS)?;
        let mut cursor = address;

        while cursor < end {
            let region = self.region_at(cursor)?;

            if !region.writable {
                return Err(KERN_PROTECTION_FAILURE);
            }

            cursor = region.end();
        }

        let mut cursor = address;

        while cursor < end {
            let offset = (cursor - address) as usize;

            let region = self
                .regions
                .iter_mut()
                .find(|r| r.contains(cursor))
                .ok_or(KERN_INVALID_ADDRESS)?;

            let from = (cursor - region.start) as usize;
            let to = (end.min(region.end()) - region.start) as usize;

            region.data[from..to].copy_from_slice(&data[offset..offset + (to - from)]);
            cursor = region.start + to as u64;
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Object {
    Task(i32),
    Thread(i32, u64),
    Port(u64),
    PortSet(u64),
    Reply(u64),
    Dead,
}

#[derive(Debug)]
struct Entry {
    object: Object,
    receive: bool,
    send: u32,
    send_once: bool,
}

impl Entry {
    fn is_empty(&self) -> bool {
        !self.receive && self.send == 0 && !self.send_once
    }
}

#[derive(Debug, Default)]
struct SimPort {
    queue: VecDeque<Queued>,
    set: Option<u64>,
}

#[derive(Debug)]
struct Queued {
    seq: u64,
    payload: Payload,
}

#[derive(Debug)]
enum Payload {
    Raw(Vec<u8>),
    Exception {
        pid: i32,
        tid: u64,
        exception: i32,
        codes: Vec<i64>,
        behavior: i32,
        reply: u64,
    },
}

#[derive(Debug)]
enum Allocation {
    Names(Box<[Port]>),
    Bytes(Box<[u8]>),
}

impl Allocation {
    fn size(&self) -> u64 {
        match self {
            Allocation::Names(names) => (names.len() * std::mem::size_of::<Port>()) as u64,
            Allocation::Bytes(bytes) => bytes.len() as u64,
        }
    }
}

#[derive(Debug)]
struct State {
    next_pid: i32,
    next_name: Port,
    next_object: u64,
    processes: HashMap<i32, Process>,
    names: BTreeMap<Port, Entry>,
    ports: HashMap<u64, SimPort>,
    sets: HashSet<u64>,
    replies: HashMap<u64, Option<ReplyOutcome>>,
    allocations: HashMap<VmAddress, Allocation>,
    state_count_override: Option<u32>,
}

impl State {
    fn new() -> Self {
        Self {
            next_pid: FIRST_PID,
            next_name: FIRST_NAME,
            next_object: 1,
            processes: HashMap::new(),
            names: BTreeMap::new(),
            ports: HashMap::new(),
            sets: HashSet::new(),
            replies: HashMap::new(),
            allocations: HashMap::new(),
            state_count_override: None,
        }
    }

    fn next_object(&mut self) -> u64 {
        let id = self.next_object;
        self.next_object += 1;
        id
    }

    fn fresh_name(&mut self) -> Port {
        let name = self.next_name;
        self.next_name += NAME_STRIDE;
        name
    }

    // Send rights to the same object coalesce under one name.
    fn insert_send(&mut self, object: Object) -> Port {
        if let Some((&name, entry)) = self.names.iter_mut().find(|(_, e)| e.object == object) {
            entry.send += 1;
            return name;
        }

        let name = self.fresh_name();
        self.names.insert(name, Entry { object, receive: false, send: 1, send_once: false });
        name
    }

    fn insert_send_once(&mut self, object: Object) -> Port {
        let name = self.fresh_name();
        self.names.insert(name, Entry { object, receive: false, send: 0, send_once: true });
        name
    }

    fn release_send(&mut self, name: Port) {
        if let Some(entry) = self.names.get_mut(&name) {
            entry.send = entry.send.saturating_sub(1);

            if entry.is_empty() {
                self.names.remove(&name);
            }
        }
    }

    fn destroy_reply(&mut self, slot: u64) {
        if let Some(outcome) = self.replies.get_mut(&slot) {
            outcome.get_or_insert(ReplyOutcome::Destroyed);
        }
    }

    fn process_mut(&mut self, pid: i32) -> KernResult<&mut Process> {
        match self.processes.get_mut(&pid) {
            Some(process) if !process.terminated => Ok(process),
            _ => Err(MACH_SEND_INVALID_DEST),
        }
    }

    fn task_pid(&self, name: Port) -> KernResult<i32> {
        match self.names.get(&name) {
            Some(Entry { object: Object::Task(pid), send, .. }) if *send > 0 => Ok(*pid),
            _ => Err(MACH_SEND_INVALID_DEST),
        }
    }

    fn thread_mut(&mut self, name: Port) -> KernResult<&mut SimThread> {
        let (pid, tid) = match self.names.get(&name) {
            Some(Entry { object: Object::Thread(pid, tid), send, .. }) if *send > 0 => (*pid, *tid),
            _ => return Err(MACH_SEND_INVALID_DEST),
        };

        self.process_mut(pid)?
            .threads
            .iter_mut()
            .find(|t| t.tid == tid)
            .ok_or(MACH_SEND_INVALID_DEST)
    }

    fn receive_name(&self, id: u64) -> Port {
        self.names
            .iter()
            .find(|(_, e)| e.receive && e.object == Object::Port(id))
            .map_or(PORT_NULL, |(&name, _)| name)
    }

    fn receive_sources(&self, name: Port) -> KernResult<Vec<u64>> {
        match self.names.get(&name) {
            Some(Entry { object: Object::Port(id), receive: true, .. }) => Ok(vec![*id]),
            Some(Entry { object: Object::PortSet(set), receive: true, .. }) => Ok(self
                .ports
                .iter()
                .filter(|(_, p)| p.set == Some(*set))
                .map(|(&id, _)| id)
                .collect()),
            _ => Err(MACH_RCV_INVALID_NAME),
        }
    }

    fn oldest(&self, sources: &[u64]) -> Option<u64> {
        sources
            .iter()
            .filter_map(|id| self.ports.get(id).and_then(|p| p.queue.front()).map(|q| (q.seq, *id)))
            .min()
            .map(|(_, id)| id)
    }

    fn deliver(&mut self, id: u64, buf: &mut [u8]) -> KernResult<usize> {
        let local = self.receive_name(id);

        let queued = self
            .ports
            .get_mut(&id)
            .and_then(|p| p.queue.pop_front())
            .ok_or(MACH_RCV_INVALID_NAME)?;

        match queued.payload {
            Payload::Raw(mut bytes) => {
                if bytes.len() > buf.len() {
                    return Err(MACH_RCV_TOO_LARGE);
                }

                // The sender's reply port becomes our remote port; the destination
                // becomes our local port.
                let reply: [u8; 4] = [bytes[12], bytes[13], bytes[14], bytes[15]];
                bytes[8..12].copy_from_slice(&reply);
                bytes[12..16].copy_from_slice(&local.to_ne_bytes());

                buf[..bytes.len()].copy_from_slice(&bytes);

                Ok(bytes.len())
            },
            Payload::Exception { pid, tid, exception, codes, behavior, reply } => {
                let id = if behavior & MACH_EXCEPTION_CODES != 0 {
                    MACH_EXCEPTION_RAISE_ID
                } else {
                    EXCEPTION_RAISE_ID
                };

                let header = Header {
                    bits: MACH_MSG_TYPE_MOVE_SEND_ONCE | MACH_MSGH_BITS_COMPLEX,
                    local_port: local,
                    id,
                    ..Header::default()
                };

                let mut request = ExceptionRequest { header, thread: PORT_NULL, task: PORT_NULL, exception, codes };

                let size = request.encode().map_err(|_| MACH_RCV_TOO_LARGE)?.len();

                if size > buf.len() {
                    self.destroy_reply(reply);
                    return Err(MACH_RCV_TOO_LARGE);
                }

                request.thread = self.insert_send(Object::Thread(pid, tid));
                request.task = self.insert_send(Object::Task(pid));
                request.header.remote_port = self.insert_send_once(Object::Reply(reply));

                let bytes = request.encode().map_err(|_| MACH_RCV_TOO_LARGE)?;
                buf[..bytes.len()].copy_from_slice(&bytes);

                trace!(pid, exception, "delivered exception");

                Ok(bytes.len())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_rights_coalesce() {
        let kernel = SimKernel::new();
        let pid = kernel.spawn(SimProcess::new());

        let a = kernel.task_for_pid(pid).unwrap();
        let b = kernel.task_for_pid(pid).unwrap();
        assert_eq!(a, b);

        kernel.port_deallocate(a).unwrap();
        assert_eq!(kernel.outstanding_rights(), 1);

        kernel.port_deallocate(b).unwrap();
        assert_eq!(kernel.outstanding_rights(), 0);
        assert_eq!(kernel.port_deallocate(b), Err(KERN_INVALID_NAME));
    }

    #[test]
    fn test_destroyed_receive_right_leaves_dead_name() {
        let kernel = SimKernel::new();
        let port = kernel.port_allocate(PortRight::Receive).unwrap();
        kernel.port_insert_send_right(port).unwrap();

        kernel.port_destroy_receive(port).unwrap();
        assert_eq!(kernel.outstanding_rights(), 1);

        let msg = crate::message::stop_message(port);
        assert_eq!(kernel.msg_send(&msg, None), Err(MACH_SEND_INVALID_DEST));

        kernel.port_deallocate(port).unwrap();
        assert_eq!(kernel.outstanding_rights(), 0);
    }

    #[test]
    fn test_receive_rewrites_header() {
        let kernel = SimKernel::new();
        let port = kernel.port_allocate(PortRight::Receive).unwrap();
        kernel.port_insert_send_right(port).unwrap();

        kernel.msg_send(&crate::message::stop_message(port), None).unwrap();

        let mut buf = [0u8; 64];
        let len = kernel.msg_receive(port, &mut buf, Some(Duration::from_secs(0))).unwrap().unwrap();
        let header = Header::decode(&buf[..len]).unwrap();

        assert_eq!(header.local_port, port);
        assert_eq!(header.remote_port, PORT_NULL);
        assert_eq!(kernel.msg_receive(port, &mut buf, Some(Duration::from_millis(1))), Ok(None));
    }

    #[test]
    fn test_queue_limit() {
        let kernel = SimKernel::new();
        let port = kernel.port_allocate(PortRight::Receive).unwrap();
        kernel.port_insert_send_right(port).unwrap();

        let msg = crate::message::stop_message(port);
        for _ in 0..QUEUE_LIMIT {
            kernel.msg_send(&msg, Some(Duration::from_secs(0))).unwrap();
        }

        assert_eq!(kernel.msg_send(&msg, Some(Duration::from_secs(0))), Err(MACH_SEND_TIMED_OUT));
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let kernel = SimKernel::new();
        let pid = kernel.spawn(
            SimProcess::new()
                .region(0x1000, vec![0; 0x1000])
                .read_only_region(0x2000, vec![0; 0x1000]),
        );
        let task = kernel.task_for_pid(pid).unwrap();

        assert_eq!(kernel.vm_write(task, 0x1ffe, &[1, 2, 3, 4]), Err(KERN_PROTECTION_FAILURE));
        assert_eq!(kernel.peek(pid, 0x1ffe, 2), Some(vec![0, 0]));
    }

    #[test]
    fn test_vm_deallocate_checks_size() {
        let kernel = SimKernel::new();
        let pid = kernel.spawn(SimProcess::new().region(0x1000, vec![7; 16]));
        let task = kernel.task_for_pid(pid).unwrap();

        let (address, count) = kernel.vm_read(task, 0x1000, 16).unwrap();
        assert_eq!(count, 16);
        assert_eq!(kernel.vm_deallocate(address, 8), Err(KERN_INVALID_ARGUMENT));
        assert_eq!(kernel.vm_deallocate(address, 16), Ok(()));
        assert_eq!(kernel.outstanding_allocations(), 0);
    }
}
