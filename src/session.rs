//! Attaching to a target process, and detaching from it cleanly.
//!
//! A [`Session`] bundles a [`Task`] with an optional [`ExceptionMonitor`] and owns the
//! order in which they are torn down: stop the receive loop, resume the target,
//! clear its exception ports, then release the task and port rights. Dropping a
//! session detaches it.

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{internal_error, Error, Result};
use crate::exception::{
    ExceptionMonitor, ExceptionNotification, HandlerResult, MonitorConfig, MonitorState, MonitorStats, Stopper,
};
use crate::kernel::{KernelRef, Pid};
use crate::ready::ReadyWait;
use crate::task::Task;

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct AttachOptions {
    suspend: bool,
    exceptions: Option<MonitorConfig>,
    ready_timeout: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            suspend: true,
            exceptions: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the target is suspended as part of attaching. Defaults to `true`.
    pub fn suspend(&self) -> bool {
        self.suspend
    }

    pub fn set_suspend(&mut self, suspend: bool) -> &mut Self {
        self.suspend = suspend;
        self
    }

    pub fn exceptions(&self) -> Option<&MonitorConfig> {
        self.exceptions.as_ref()
    }

    /// Create and register an exception monitor while attaching.
    pub fn set_exceptions(&mut self, config: Option<MonitorConfig>) -> &mut Self {
        self.exceptions = config;
        self
    }

    pub fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// How long [`Session::attach_when_ready()`] waits for the target.
    pub fn set_ready_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.ready_timeout = timeout;
        self
    }
}

struct MonitorHandle {
    stopper: Stopper,
    join: JoinHandle<(ExceptionMonitor, Result<MonitorStats>)>,
}

/// An attachment to one target process.
pub struct Session {
    task: Task,
    monitor: Option<ExceptionMonitor>,
    running: Option<MonitorHandle>,
    detached: bool,
}

impl Session {
    /// Acquire the task of `pid`, optionally register an exception monitor, and
    /// optionally suspend it.
    ///
    /// On failure, everything acquired so far is released and the target is left
    /// running as it was.
    pub fn attach(kernel: KernelRef, pid: Pid, options: &AttachOptions) -> Result<Self> {
        let mut task = Task::attach(kernel.clone(), pid)?;

        let monitor = match options.exceptions {
            Some(config) => {
                let mut monitor = ExceptionMonitor::create(kernel, config)?;
                monitor.register(&task)?;
                Some(monitor)
            },
            None => None,
        };

        if options.suspend {
            task.suspend()?;
        }

        info!(pid = pid.as_raw(), suspended = options.suspend, monitored = monitor.is_some(), "attached");

        Ok(Self { task, monitor, running: None, detached: false })
    }

    /// Wait for the target to signal readiness, then [`Session::attach()`].
    pub fn attach_when_ready(kernel: KernelRef, pid: Pid, ready: ReadyWait, options: &AttachOptions) -> Result<Self> {
        ready.wait(Some(options.ready_timeout))?;
        Self::attach(kernel, pid, options)
    }

    pub fn pid(&self) -> Pid {
        self.task.pid()
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_mut(&mut self) -> &mut Task {
        &mut self.task
    }

    /// The exception monitor, unless it is running on its own thread.
    pub fn monitor(&self) -> Option<&ExceptionMonitor> {
        self.monitor.as_ref()
    }

    pub fn monitor_mut(&mut self) -> Option<&mut ExceptionMonitor> {
        self.monitor.as_mut()
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.is_some()
    }

    /// Run the exception loop on a dedicated thread, answering with `handler`.
    ///
    /// Returns a [`Stopper`] for the loop. [`Session::stop_monitor()`] or detaching
    /// stops it too.
    pub fn spawn_monitor<F>(&mut self, handler: F) -> Result<Stopper>
    where
        F: FnMut(&ExceptionNotification) -> HandlerResult + Send + 'static,
    {
        let monitor = match self.monitor.take() {
            Some(monitor) => monitor,
            None => {
                let actual = if self.running.is_some() { MonitorState::Running } else { MonitorState::Uninitialized };
                return Err(Error::MonitorState { expected: MonitorState::Registered, actual });
            },
        };

        if monitor.state() != MonitorState::Registered {
            let actual = monitor.state();
            self.monitor = Some(monitor);
            return Err(Error::MonitorState { expected: MonitorState::Registered, actual });
        }

        let stopper = monitor.stopper();

        let join = thread::Builder::new()
            .name(format!("exceptions-{}", self.task.pid()))
            .spawn(move || {
                let mut monitor = monitor;
                let result = monitor.run(handler);
                (monitor, result)
            })?;

        self.running = Some(MonitorHandle { stopper: stopper.clone(), join });

        Ok(stopper)
    }

    /// Stop the exception thread and wait for it, returning what it handled.
    pub fn stop_monitor(&mut self) -> Result<MonitorStats> {
        let handle = match self.running.take() {
            Some(handle) => handle,
            None => {
                let actual = self.monitor.as_ref().map_or(MonitorState::Uninitialized, |m| m.state());
                return Err(Error::MonitorState { expected: MonitorState::Running, actual });
            },
        };

        handle.stopper.stop()?;

        let (monitor, result) = match handle.join.join() {
            Ok(joined) => joined,
            Err(_) => internal_error!("exception thread panicked"),
        };

        self.monitor = Some(monitor);

        result
    }

    /// Detach from the target, reporting the first failure.
    ///
    /// Every step is attempted even if an earlier one fails.
    pub fn detach(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }

        self.detached = true;

        let pid = self.task.pid().as_raw();
        let mut first_err = None;

        if self.running.is_some() {
            match self.stop_monitor() {
                Ok(stats) => info!(pid, ?stats, "stopped exception thread"),
                Err(err) => {
                    first_err.get_or_insert(err);
                },
            }
        }

        while self.task.is_suspended() {
            if let Err(err) = self.task.resume() {
                if self.task.exited(&err) {
                    warn!(pid, %err, "target exited while suspended");
                    self.task.forget_suspensions();
                } else {
                    first_err.get_or_insert(err);
                }
                break;
            }
        }

        // The kernel drops the exception ports of a task that exited.
        if let Some(monitor) = self.monitor.as_mut() {
            if let Err(err) = monitor.unregister(&self.task) {
                if self.task.exited(&err) {
                    warn!(pid, %err, "target exited before its exception ports were cleared");
                } else {
                    first_err.get_or_insert(err);
                }
            }
        }

        if !self.task.is_released() {
            if let Err(err) = self.task.release() {
                first_err.get_or_insert(err);
            }
        }

        if let Some(mut monitor) = self.monitor.take() {
            if let Err(err) = monitor.release() {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => {
                warn!(pid, %err, "detached with errors");
                Err(err)
            },
            None => {
                info!(pid, "detached");
                Ok(())
            },
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("task", &self.task)
            .field("monitor", &self.monitor)
            .field("monitoring", &self.running.is_some())
            .field("detached", &self.detached)
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
