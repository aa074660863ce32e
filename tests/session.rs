use std::thread;
use std::time::Duration;

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use taskport::kernel::KERN_SUCCESS;
use taskport::ready;
use taskport::sim::{ReplyOutcome, SimProcess};
use taskport::{AttachOptions, Error, MonitorConfig, MonitorState, Resume, Session};

#[macro_use]
mod support;
use support::*;

const BREAKPOINT: i32 = 6;

fn monitored() -> AttachOptions {
    let mut options = AttachOptions::new();
    options.set_exceptions(Some(MonitorConfig::default()));
    options
}

#[test]
#[timeout(1000)]
fn test_attach_suspends_by_default() -> Result<()> {
    let target = Target::standard(1);

    let session = Session::attach(target.kernel.clone(), target.pid, &AttachOptions::default())?;

    assert_eq!(session.pid(), target.pid);
    assert!(session.task().is_suspended());
    assert!(session.monitor().is_none());
    assert_eq!(target.sim.suspend_count(target.pid), Some(1));

    session.detach()?;

    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_without_suspending() -> Result<()> {
    let target = Target::standard(1);

    let mut options = AttachOptions::new();
    options.set_suspend(false);

    let session = Session::attach(target.kernel.clone(), target.pid, &options)?;
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));

    let data = session.task().read_memory(DATA, 4)?;
    assert_eq!(&data[..], &PATTERN[..4]);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_detach_undoes_extra_suspensions() -> Result<()> {
    let target = Target::standard(1);

    let mut session = Session::attach(target.kernel.clone(), target.pid, &AttachOptions::default())?;
    session.task_mut().suspend()?;
    session.task_mut().suspend()?;

    assert_eq!(target.sim.suspend_count(target.pid), Some(3));

    drop(session);

    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_failed_attach_leaves_nothing_behind() -> Result<()> {
    let target = Target::spawn(SimProcess::new().denied());

    let err = Session::attach(target.kernel.clone(), target.pid, &monitored()).unwrap_err();

    assert_matches!(err, Error::PermissionDenied { .. });
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_monitor_thread() -> Result<()> {
    let target = Target::standard(1);

    let mut session = Session::attach(target.kernel.clone(), target.pid, &monitored())?;
    assert_eq!(session.monitor().map(|m| m.state()), Some(MonitorState::Registered));

    // Exceptions are raised by running threads.
    session.task_mut().resume()?;

    session.spawn_monitor(|exc| {
        eprintln!("exception: {:?}", exc);
        Ok(Resume::Continue)
    })?;

    assert!(session.is_monitoring());
    assert!(session.monitor().is_none());

    let err = session.spawn_monitor(|_| Ok(Resume::Continue)).unwrap_err();
    assert_matches!(err, Error::MonitorState { actual: MonitorState::Running, .. });

    let pending = target.sim.raise_exception(target.pid, 0, BREAKPOINT, &[1]).unwrap();
    assert_eq!(pending.wait(Duration::from_secs(1)), Some(ReplyOutcome::Replied(KERN_SUCCESS)));

    let stats = session.stop_monitor()?;

    assert_eq!(stats.received, 1);
    assert_eq!(stats.replied, 1);
    assert_eq!(session.monitor().map(|m| m.state()), Some(MonitorState::Stopped));

    session.detach()?;

    assert!(!target.sim.exception_port_registered(target.pid, BREAKPOINT));
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_detach_stops_running_monitor() -> Result<()> {
    let target = Target::standard(1);

    let mut session = Session::attach(target.kernel.clone(), target.pid, &monitored())?;
    session.spawn_monitor(|_| Ok(Resume::Continue))?;

    session.detach()?;

    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_spawn_monitor_requires_exceptions() -> Result<()> {
    let target = Target::standard(1);

    let mut session = Session::attach(target.kernel.clone(), target.pid, &AttachOptions::default())?;

    let err = session.spawn_monitor(|_| Ok(Resume::Continue)).unwrap_err();
    assert_matches!(err, Error::MonitorState { actual: MonitorState::Uninitialized, .. });

    assert_matches!(session.stop_monitor().unwrap_err(), Error::MonitorState { .. });

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_attach_when_ready() -> Result<()> {
    let target = Target::standard(1);
    let (signal, wait) = ready::channel()?;

    let t = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        signal.signal()
    });

    let session = Session::attach_when_ready(target.kernel.clone(), target.pid, wait, &monitored())?;
    t.join().unwrap()?;

    assert!(target.sim.exception_port_registered(target.pid, BREAKPOINT));

    session.detach()?;

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_attach_when_never_ready() -> Result<()> {
    let target = Target::standard(1);
    let (signal, wait) = ready::channel()?;

    let mut options = monitored();
    options.set_ready_timeout(Duration::from_millis(20));

    let err = Session::attach_when_ready(target.kernel.clone(), target.pid, wait, &options).unwrap_err();

    assert_matches!(err, Error::NotReady(_));
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    drop(signal);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_detach_after_target_exited() -> Result<()> {
    let target = Target::standard(1);

    let session = Session::attach(target.kernel.clone(), target.pid, &monitored())?;
    assert!(session.task().is_suspended());

    target.sim.terminate(target.pid);

    session.detach()?;

    assert_eq!(target.sim.outstanding_rights(), 0);
    assert_eq!(target.sim.outstanding_allocations(), 0);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_detach_after_handler_terminates_target() -> Result<()> {
    let target = Target::standard(1);

    let mut session = Session::attach(target.kernel.clone(), target.pid, &monitored())?;
    session.task_mut().resume()?;

    session.spawn_monitor(|_| Ok(Resume::Terminate))?;

    let pending = target.sim.raise_exception(target.pid, 0, BREAKPOINT, &[1]).unwrap();
    assert_eq!(pending.wait(Duration::from_secs(1)), Some(ReplyOutcome::Replied(KERN_SUCCESS)));
    assert!(target.sim.is_terminated(target.pid));

    session.detach()?;

    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_write_read_detach() -> Result<()> {
    let target = Target::standard(2);
    let bytes: Vec<u8> = (0x00..0x08).collect();

    let session = Session::attach(target.kernel.clone(), target.pid, &AttachOptions::default())?;

    session.task().write_memory(DATA, &bytes)?;
    assert_eq!(session.task().read_memory(DATA, bytes.len())?, bytes);

    let threads = session.task().threads()?;
    assert_eq!(threads.len(), 2);
    drop(threads);

    session.detach()?;

    assert_eq!(target.sim.peek(target.pid, DATA, 8), Some(bytes));
    assert_eq!(target.sim.outstanding_rights(), 0);
    assert_eq!(target.sim.outstanding_allocations(), 0);
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_registers_and_suspends() -> Result<()> {
    let target = Target::standard(1);

    let session = Session::attach(target.kernel.clone(), target.pid, &monitored())?;

    assert_eq!(session.monitor().map(|m| m.state()), Some(MonitorState::Registered));
    assert!(target.sim.exception_port_registered(target.pid, BREAKPOINT));
    assert_eq!(target.sim.suspend_count(target.pid), Some(1));

    session.detach()?;

    assert!(!target.sim.exception_port_registered(target.pid, BREAKPOINT));
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));

    Ok(())
}
