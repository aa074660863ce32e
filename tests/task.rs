use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use taskport::sim::SimProcess;
use taskport::{Error, Gid, Pid, ProcessStatus, Task, Uid};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(1000)]
fn test_attach_does_not_suspend() -> Result<()> {
    let target = Target::standard(1);

    let task = Task::attach(target.kernel.clone(), target.pid)?;

    assert_eq!(task.pid(), target.pid);
    assert!(!task.is_suspended());
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(task.status()?, ProcessStatus::Running);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_missing_process() -> Result<()> {
    let target = Target::standard(1);
    let missing = Pid::from_raw(target.pid.as_raw() + 100);

    let err = Task::attach(target.kernel.clone(), missing).unwrap_err();
    eprintln!("{}", err);

    assert_matches!(err, Error::NoSuchProcess { .. });
    assert!(!err.is_permission_denied());
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_without_privilege() -> Result<()> {
    let target = Target::spawn(SimProcess::new().denied());

    let err = Task::attach(target.kernel.clone(), target.pid).unwrap_err();

    assert_matches!(err, Error::PermissionDenied { .. });
    assert!(err.is_permission_denied());

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_exited_process() -> Result<()> {
    let target = Target::standard(1);
    target.sim.terminate(target.pid);

    let err = Task::attach(target.kernel.clone(), target.pid).unwrap_err();
    assert_matches!(err, Error::NoSuchProcess { .. });

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_attach_invalid_pid() -> Result<()> {
    let target = Target::standard(1);

    for raw in [0, -1] {
        let err = Task::attach(target.kernel.clone(), Pid::from_raw(raw)).unwrap_err();
        assert_matches!(err, Error::InvalidArgument { .. });
    }

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_suspend_nests() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    task.suspend()?;
    task.suspend()?;

    assert_eq!(task.suspend_depth(), 2);
    assert_eq!(task.kernel_suspend_count()?, 2);
    assert_eq!(target.sim.suspend_count(target.pid), Some(2));

    // Mach suspension is invisible to the BSD process status.
    assert_eq!(task.status()?, ProcessStatus::Running);

    task.resume()?;
    assert!(task.is_suspended());
    assert_eq!(target.sim.suspend_count(target.pid), Some(1));

    task.resume()?;
    assert!(!task.is_suspended());
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_over_resume_leaves_kernel_alone() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    // Someone else holds a suspension. We must not undo it.
    target.sim.suspend_externally(target.pid);

    let err = task.resume().unwrap_err();

    assert_matches!(err, Error::OverResume { .. });
    assert_eq!(task.suspend_depth(), 0);
    assert_eq!(task.kernel_suspend_count()?, 1);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_release_resumes_outstanding_suspensions() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    task.suspend()?;
    task.suspend()?;
    task.suspend()?;

    task.release()?;

    assert!(task.is_released());
    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    let err = task.release().unwrap_err();
    assert_matches!(err, Error::AlreadyReleased { .. });

    let err = task.suspend().unwrap_err();
    assert_matches!(err, Error::AlreadyReleased { .. });

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_drop_releases_task() -> Result<()> {
    let target = Target::standard(1);

    {
        let mut task = Task::attach(target.kernel.clone(), target.pid)?;
        task.suspend()?;
    }

    assert_eq!(target.sim.suspend_count(target.pid), Some(0));
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_threads_are_released() -> Result<()> {
    let target = Target::standard(3);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let threads = task.threads()?;

    assert_eq!(threads.len(), 3);
    assert_eq!(target.sim.outstanding_allocations(), 0);

    for thread in &threads {
        assert_eq!(thread.task_port(), task.port());
        assert!(!thread.is_released());
    }

    // One name for the task, one per thread.
    assert_eq!(target.sim.outstanding_rights(), 4);

    let mut first = threads.into_iter().next().unwrap();
    first.release()?;

    let err = first.release().unwrap_err();
    assert_matches!(err, Error::AlreadyReleased { .. });

    drop(first);
    assert_eq!(target.sim.outstanding_rights(), 1);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_threads_of_threadless_task() -> Result<()> {
    let target = Target::spawn(SimProcess::new().threads(0));
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    assert!(task.threads()?.is_empty());
    assert_eq!(target.sim.outstanding_allocations(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_operations_on_exited_task_fail() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    target.sim.terminate(target.pid);

    assert!(task.suspend().is_err());
    assert!(task.threads().is_err());
    assert_eq!(task.status()?, ProcessStatus::Zombie);

    task.release()?;
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_process_info() -> Result<()> {
    let target = Target::spawn(
        standard_process()
            .parent(Pid::from_raw(77))
            .owner(Uid::from_raw(0), Gid::from_raw(80))
            .status(ProcessStatus::Sleeping),
    );
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let info = task.info()?;

    assert_eq!(info.pid, target.pid);
    assert_eq!(info.ppid, Pid::from_raw(77));
    assert_eq!(info.uid, Uid::from_raw(0));
    assert_eq!(info.gid, Gid::from_raw(80));
    assert_eq!(info.status, ProcessStatus::Sleeping);
    assert_eq!(task.status()?, ProcessStatus::Sleeping);

    target.sim.terminate(target.pid);
    assert_eq!(task.info()?.status, ProcessStatus::Zombie);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_release_after_suspended_target_exited() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    task.suspend()?;
    task.suspend()?;
    target.sim.terminate(target.pid);

    task.release()?;

    assert!(task.is_released());
    assert_eq!(task.suspend_depth(), 0);
    assert_eq!(target.sim.outstanding_rights(), 0);

    Ok(())
}
