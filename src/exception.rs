//! Receiving exception notifications from a task, and replying to them.
//!
//! An [`ExceptionMonitor`] owns a receive right registered as the task's exception
//! port. Its receive loop decodes each request into an [`ExceptionNotification`],
//! hands it to a handler, and always replies before receiving the next message: a
//! request that never gets a reply leaves the faulting thread stopped for good.

use std::any::Any;
use std::convert::TryFrom;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use nix::sys::signal::Signal;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result, ResultExt};
use crate::kernel::{
    Flavor, KernReturn, KernelRef, Port, PortRight, KERN_FAILURE, KERN_SUCCESS, MACH_RCV_TOO_LARGE,
    MACH_SEND_INVALID_DEST, MACH_SEND_TIMED_OUT, MIG_BAD_ID, PORT_NULL,
};
use crate::message::{self, ExceptionReply, ExceptionRequest, Header, STOP_ID};
use crate::task::{Task, Thread};

/// `EXC_SOFT_SIGNAL`: first code of an `EXC_SOFTWARE` raised for a Unix signal.
pub const EXC_SOFT_SIGNAL: i64 = 0x10003;

const EXCEPTION_DEFAULT: i32 = 1;
const MACH_EXCEPTION_CODES: i32 = i32::MIN;

// Ignored by `EXCEPTION_DEFAULT`, but must be valid for the host.
const THREAD_STATE_NONE: Flavor = if cfg!(target_arch = "aarch64") { 5 } else { 13 };

const DEFAULT_RECEIVE_BUFFER: usize = 1024;

/// Class of an exception raised by a thread.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExceptionType {
    BadAccess,
    BadInstruction,
    Arithmetic,
    Emulation,
    Software,
    Breakpoint,
    Other(i32),
}

impl ExceptionType {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ExceptionType::BadAccess,
            2 => ExceptionType::BadInstruction,
            3 => ExceptionType::Arithmetic,
            4 => ExceptionType::Emulation,
            5 => ExceptionType::Software,
            6 => ExceptionType::Breakpoint,
            n => ExceptionType::Other(n),
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ExceptionType::BadAccess => 1,
            ExceptionType::BadInstruction => 2,
            ExceptionType::Arithmetic => 3,
            ExceptionType::Emulation => 4,
            ExceptionType::Software => 5,
            ExceptionType::Breakpoint => 6,
            ExceptionType::Other(n) => n,
        }
    }
}

bitflags! {
    /// Exception classes routed to a port.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct ExceptionMask: u32 {
        const BAD_ACCESS = 1 << 1;
        const BAD_INSTRUCTION = 1 << 2;
        const ARITHMETIC = 1 << 3;
        const EMULATION = 1 << 4;
        const SOFTWARE = 1 << 5;
        const BREAKPOINT = 1 << 6;
        const SYSCALL = 1 << 7;
        const MACH_SYSCALL = 1 << 8;
        const RPC_ALERT = 1 << 9;
        const CRASH = 1 << 10;
        const RESOURCE = 1 << 11;
        const GUARD = 1 << 12;
        const CORPSE_NOTIFY = 1 << 13;

        /// `EXC_MASK_ALL`. Excludes `CRASH` and `CORPSE_NOTIFY`, which cannot be
        /// caught by a task-level handler.
        const ALL = Self::BAD_ACCESS.bits()
            | Self::BAD_INSTRUCTION.bits()
            | Self::ARITHMETIC.bits()
            | Self::EMULATION.bits()
            | Self::SOFTWARE.bits()
            | Self::BREAKPOINT.bits()
            | Self::SYSCALL.bits()
            | Self::MACH_SYSCALL.bits()
            | Self::RPC_ALERT.bits()
            | Self::RESOURCE.bits()
            | Self::GUARD.bits();
    }
}

impl ExceptionMask {
    /// The mask bit for `exception`, if it has one.
    pub fn of(exception: ExceptionType) -> Option<Self> {
        let raw = exception.raw();

        if (0..32).contains(&raw) {
            Some(Self::from_bits_retain(1 << raw))
        } else {
            None
        }
    }
}

/// How exceptions are delivered to the port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Behavior {
    /// `EXCEPTION_DEFAULT`, with 32-bit codes.
    Default,

    /// `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`, with 64-bit codes.
    DefaultWithMachCodes,
}

impl Behavior {
    pub fn raw(self) -> i32 {
        match self {
            Behavior::Default => EXCEPTION_DEFAULT,
            Behavior::DefaultWithMachCodes => EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES,
        }
    }
}

/// How the faulting thread should proceed once the handler returns.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resume {
    /// The exception was handled: resume the thread (`KERN_SUCCESS`).
    Continue,

    /// Not handled: pass it on to the next handler, e.g. the host's (`KERN_FAILURE`).
    Forward,

    /// Terminate the task, then release the thread.
    Terminate,
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = std::result::Result<Resume, HandlerError>;

/// One decoded exception request.
///
/// Owns the thread and task rights the request carried; both are released when the
/// notification is dropped, after its reply is sent.
pub struct ExceptionNotification {
    header: Header,
    thread: Thread,
    task: Port,
    exception: ExceptionType,
    codes: Vec<i64>,
    kernel: KernelRef,
}

impl ExceptionNotification {
    fn new(kernel: KernelRef, request: ExceptionRequest) -> Self {
        let thread = Thread::new(kernel.clone(), request.thread, request.task);

        Self {
            header: request.header,
            thread,
            task: request.task,
            exception: ExceptionType::from_raw(request.exception),
            codes: request.codes,
            kernel,
        }
    }

    /// The faulting thread, parked until the reply is sent.
    pub fn thread(&self) -> &Thread {
        &self.thread
    }

    pub fn task_port(&self) -> Port {
        self.task
    }

    pub fn exception(&self) -> ExceptionType {
        self.exception
    }

    /// Exception-specific codes, in delivery order.
    pub fn codes(&self) -> &[i64] {
        &self.codes
    }

    /// Id of the request message, which selects the id of the reply.
    pub fn request_id(&self) -> i32 {
        self.header.id
    }

    /// The Unix signal behind a signal-as-exception notification.
    pub fn signal(&self) -> Option<Signal> {
        if self.exception != ExceptionType::Software {
            return None;
        }

        match self.codes.as_slice() {
            [EXC_SOFT_SIGNAL, signo, ..] => Signal::try_from(*signo as i32).ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for ExceptionNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionNotification")
            .field("thread", &self.thread.port())
            .field("task", &self.task)
            .field("exception", &self.exception)
            .field("codes", &self.codes)
            .finish()
    }
}

impl Drop for ExceptionNotification {
    fn drop(&mut self) {
        if let Err(code) = self.kernel.port_deallocate(self.task) {
            warn!(code, task = self.task, "could not release task right from exception");
        }
    }
}

/// Configuration of an [`ExceptionMonitor`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MonitorConfig {
    mask: ExceptionMask,
    behavior: Behavior,
    receive_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mask: ExceptionMask::ALL,
            behavior: Behavior::DefaultWithMachCodes,
            receive_buffer: DEFAULT_RECEIVE_BUFFER,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mask(&self) -> ExceptionMask {
        self.mask
    }

    pub fn set_mask(&mut self, mask: ExceptionMask) -> &mut Self {
        self.mask = mask;
        self
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn set_behavior(&mut self, behavior: Behavior) -> &mut Self {
        self.behavior = behavior;
        self
    }

    /// Size of the buffer messages are received into.
    pub fn receive_buffer(&self) -> usize {
        self.receive_buffer
    }

    pub fn set_receive_buffer(&mut self, size: usize) -> &mut Self {
        self.receive_buffer = size.max(Header::SIZE);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorState {
    Uninitialized,
    Registered,
    Running,
    Stopped,
}

/// Counters for one run of the receive loop.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MonitorStats {
    pub received: u64,
    pub replied: u64,
    pub failures: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct ReceiveRight {
    name: Port,
    send: bool,
}

/// Exception port for one task, and the loop that services it.
pub struct ExceptionMonitor {
    kernel: KernelRef,
    config: MonitorConfig,
    exceptions: ReceiveRight,
    control: ReceiveRight,
    set: Port,
    state: MonitorState,
    registered: Option<Port>,
    errors: Option<Sender<Error>>,
    alive: Arc<AtomicBool>,
    released: bool,
}

impl ExceptionMonitor {
    /// Allocate the exception port, a send right for it, and the control port used to
    /// stop the receive loop.
    pub fn create(kernel: KernelRef, config: MonitorConfig) -> Result<Self> {
        let mut monitor = Self {
            kernel,
            config,
            exceptions: ReceiveRight::default(),
            control: ReceiveRight::default(),
            set: PORT_NULL,
            state: MonitorState::Uninitialized,
            registered: None,
            errors: None,
            alive: Arc::new(AtomicBool::new(true)),
            released: false,
        };

        // Partially-acquired rights are released by `Drop` if any step fails.
        monitor.exceptions.name = monitor.kernel.port_allocate(PortRight::Receive).or_kernel("mach_port_allocate")?;
        monitor.kernel.port_insert_send_right(monitor.exceptions.name).or_kernel("mach_port_insert_right")?;
        monitor.exceptions.send = true;

        monitor.control.name = monitor.kernel.port_allocate(PortRight::Receive).or_kernel("mach_port_allocate")?;
        monitor.kernel.port_insert_send_right(monitor.control.name).or_kernel("mach_port_insert_right")?;
        monitor.control.send = true;

        monitor.set = monitor.kernel.port_allocate(PortRight::PortSet).or_kernel("mach_port_allocate")?;
        monitor.kernel.port_move_member(monitor.exceptions.name, monitor.set).or_kernel("mach_port_move_member")?;
        monitor.kernel.port_move_member(monitor.control.name, monitor.set).or_kernel("mach_port_move_member")?;

        debug!(port = monitor.exceptions.name, control = monitor.control.name, "created exception port");

        Ok(monitor)
    }

    /// Name of the exception port.
    pub fn port(&self) -> Port {
        self.exceptions.name
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Report swallowed failures (bad messages, handler errors, failed replies) on `sink`.
    pub fn set_error_sink(&mut self, sink: Sender<Error>) {
        self.errors = Some(sink);
    }

    /// Route the configured exception classes of `task` to this monitor.
    ///
    /// The target must already be at a ready point (see [`crate::ready`]): the caller
    /// is responsible for that synchronization.
    pub fn register(&mut self, task: &Task) -> Result<()> {
        self.expect_state(MonitorState::Uninitialized)?;

        self.kernel
            .set_exception_ports(
                task.port(),
                self.config.mask.bits(),
                self.exceptions.name,
                self.config.behavior.raw(),
                THREAD_STATE_NONE,
            )
            .or_kernel("task_set_exception_ports")?;

        self.registered = Some(task.port());
        self.state = MonitorState::Registered;

        info!(pid = task.pid().as_raw(), mask = ?self.config.mask, "registered exception port");

        Ok(())
    }

    /// Clear the exception port of `task`, if this monitor registered it.
    pub fn unregister(&mut self, task: &Task) -> Result<()> {
        if self.registered != Some(task.port()) {
            return Ok(());
        }

        self.registered = None;

        if self.state == MonitorState::Registered {
            self.state = MonitorState::Uninitialized;
        }

        self.kernel
            .set_exception_ports(
                task.port(),
                self.config.mask.bits(),
                PORT_NULL,
                self.config.behavior.raw(),
                THREAD_STATE_NONE,
            )
            .or_kernel("task_set_exception_ports")?;

        debug!(pid = task.pid().as_raw(), "unregistered exception port");

        Ok(())
    }

    /// A handle that stops [`ExceptionMonitor::run()`] from any thread.
    pub fn stopper(&self) -> Stopper {
        Stopper {
            kernel: self.kernel.clone(),
            control: self.control.name,
            alive: self.alive.clone(),
        }
    }

    /// Receive and answer exceptions until stopped.
    ///
    /// Every request gets exactly one reply before the next message is received. When
    /// a handler fails or panics, the failure is reported on the error sink and the
    /// request is answered with `KERN_FAILURE`. After a stop request, notifications
    /// already queued are still handled and answered before the loop returns.
    pub fn run<F>(&mut self, mut handler: F) -> Result<MonitorStats>
    where
        F: FnMut(&ExceptionNotification) -> HandlerResult,
    {
        self.expect_state(MonitorState::Registered)?;
        self.state = MonitorState::Running;

        info!(port = self.exceptions.name, "exception loop running");

        let mut stats = MonitorStats::default();
        let mut buf = vec![0u8; self.config.receive_buffer];
        let mut stopping = false;

        loop {
            let timeout = if stopping { Some(Duration::from_secs(0)) } else { None };

            let len = match self.kernel.msg_receive(self.set, &mut buf, timeout) {
                Ok(Some(len)) => len,
                Ok(None) if stopping => break,
                Ok(None) => continue,
                Err(MACH_RCV_TOO_LARGE) => {
                    // The kernel destroyed the message, and with it the reply right.
                    stats.failures += 1;
                    self.report(Error::MalformedMessage("message exceeds receive buffer".into()));
                    continue;
                },
                Err(code) => {
                    self.state = MonitorState::Stopped;
                    return Err(Error::from_kern("mach_msg", code));
                },
            };

            let bytes = &buf[..len.min(buf.len())];

            let header = match Header::decode(bytes) {
                Ok(header) => header,
                Err(err) => {
                    stats.failures += 1;
                    self.report(err);
                    continue;
                },
            };

            if header.local_port == self.control.name {
                if header.id == STOP_ID && !stopping {
                    debug!("stop requested, draining queued exceptions");
                    stopping = true;
                }
                continue;
            }

            stats.received += 1;
            self.dispatch(bytes, &header, &mut handler, &mut stats);
        }

        self.state = MonitorState::Stopped;

        info!(?stats, "exception loop stopped");

        Ok(stats)
    }

    fn dispatch<F>(&self, bytes: &[u8], header: &Header, handler: &mut F, stats: &mut MonitorStats)
    where
        F: FnMut(&ExceptionNotification) -> HandlerResult,
    {
        let request = match ExceptionRequest::decode(bytes) {
            Ok(request) => request,
            Err(err) => {
                stats.failures += 1;
                self.report(err);

                for port in message::carried_ports(bytes) {
                    if let Err(code) = self.kernel.port_deallocate(port) {
                        warn!(port, code, "could not release port carried by malformed request");
                    }
                }

                if header.remote_port != PORT_NULL {
                    self.reply(header, MIG_BAD_ID, stats);
                }

                return;
            },
        };

        let notification = ExceptionNotification::new(self.kernel.clone(), request);

        trace!(?notification, "received exception");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&notification)));

        let code = match outcome {
            Ok(Ok(Resume::Continue)) => KERN_SUCCESS,
            Ok(Ok(Resume::Forward)) => KERN_FAILURE,
            Ok(Ok(Resume::Terminate)) => {
                if let Err(code) = self.kernel.task_terminate(notification.task_port()) {
                    stats.failures += 1;
                    self.report(Error::from_kern("task_terminate", code));
                }
                KERN_SUCCESS
            },
            Ok(Err(err)) => {
                stats.failures += 1;
                self.report(Error::Handler(err.to_string()));
                KERN_FAILURE
            },
            Err(payload) => {
                stats.failures += 1;
                self.report(Error::Handler(panic_message(payload.as_ref())));
                KERN_FAILURE
            },
        };

        self.reply(&notification.header, code, stats);
    }

    fn reply(&self, request: &Header, code: KernReturn, stats: &mut MonitorStats) {
        let reply = ExceptionReply::to(request, code).encode();

        match self.kernel.msg_send(&reply, None) {
            Ok(()) => {
                stats.replied += 1;
                trace!(id = request.id, code, "replied to exception");
            },
            Err(err) => {
                stats.failures += 1;
                self.report(Error::from_kern("mach_msg", err));

                // An unsent reply leaves the send-once right with us.
                let _ = self.kernel.port_deallocate(request.remote_port);
            },
        }
    }

    fn report(&self, err: Error) {
        warn!(%err, "exception monitor failure");

        if let Some(sink) = &self.errors {
            let _ = sink.send(err);
        }
    }

    fn expect_state(&self, expected: MonitorState) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased { name: self.exceptions.name });
        }

        if self.state != expected {
            return Err(Error::MonitorState { expected, actual: self.state });
        }

        Ok(())
    }

    /// Destroy the exception and control ports.
    ///
    /// The kernel drops the task's registration along with the port. Prefer
    /// [`ExceptionMonitor::unregister()`] first while the task is still held.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::AlreadyReleased { name: self.exceptions.name });
        }

        self.released = true;
        self.alive.store(false, Ordering::SeqCst);

        let mut first_err = None;

        if self.set != PORT_NULL {
            if let Err(code) = self.kernel.port_destroy_receive(self.set) {
                first_err.get_or_insert(Error::from_kern("mach_port_mod_refs", code));
            }
        }

        for right in [self.exceptions, self.control] {
            if let Err(err) = release_receive_right(&self.kernel, right) {
                first_err.get_or_insert(err);
            }
        }

        debug!(port = self.exceptions.name, "released exception port");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ExceptionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionMonitor")
            .field("port", &self.exceptions.name)
            .field("control", &self.control.name)
            .field("state", &self.state)
            .field("registered", &self.registered)
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for ExceptionMonitor {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

fn release_receive_right(kernel: &KernelRef, right: ReceiveRight) -> Result<()> {
    if right.name == PORT_NULL {
        return Ok(());
    }

    kernel.port_destroy_receive(right.name).or_kernel("mach_port_mod_refs")?;

    // Our send right is now a dead name.
    if right.send {
        kernel.port_deallocate(right.name).or_kernel("mach_port_deallocate")?;
    }

    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".into()
    }
}

/// Stops a running [`ExceptionMonitor`] from another thread.
#[derive(Clone)]
pub struct Stopper {
    kernel: KernelRef,
    control: Port,
    alive: Arc<AtomicBool>,
}

impl Stopper {
    /// Ask the receive loop to stop. Notifications it already received or that are
    /// already queued are still answered.
    pub fn stop(&self) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.kernel.msg_send(&message::stop_message(self.control), Some(Duration::from_secs(0))) {
            // The control queue is full, so a stop is already pending.
            Ok(()) | Err(MACH_SEND_TIMED_OUT) => Ok(()),
            // Released between the check above and the send.
            Err(MACH_SEND_INVALID_DEST) if !self.alive.load(Ordering::SeqCst) => Ok(()),
            Err(code) => Err(Error::from_kern("mach_msg", code)),
        }
    }
}

impl fmt::Debug for Stopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stopper").field("control", &self.control).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_all_matches_mach() {
        assert_eq!(ExceptionMask::ALL.bits(), 0x1bfe);
        assert!(!ExceptionMask::ALL.contains(ExceptionMask::CRASH));
    }

    #[test]
    fn test_mask_of_type() {
        assert_eq!(ExceptionMask::of(ExceptionType::Breakpoint), Some(ExceptionMask::BREAKPOINT));
        assert_eq!(ExceptionMask::of(ExceptionType::Other(-1)), None);
    }

    #[test]
    fn test_exception_type_raw() {
        for raw in 0..16 {
            assert_eq!(ExceptionType::from_raw(raw).raw(), raw);
        }

        assert_eq!(ExceptionType::from_raw(1), ExceptionType::BadAccess);
        assert_eq!(ExceptionType::from_raw(12), ExceptionType::Other(12));
    }

    #[test]
    fn test_behavior_raw() {
        assert_eq!(Behavior::Default.raw(), 1);
        assert_eq!(Behavior::DefaultWithMachCodes.raw() as u32, 0x8000_0001);
    }

    #[test]
    fn test_config_builder() {
        let mut config = MonitorConfig::new();
        config.set_mask(ExceptionMask::BREAKPOINT | ExceptionMask::BAD_ACCESS).set_receive_buffer(8);

        assert_eq!(config.mask(), ExceptionMask::BREAKPOINT | ExceptionMask::BAD_ACCESS);
        assert_eq!(config.receive_buffer(), Header::SIZE);
        assert_eq!(config.behavior(), Behavior::DefaultWithMachCodes);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "handler panicked: boom");
    }
}
