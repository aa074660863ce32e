use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use taskport::{Error, Task};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(1000)]
fn test_read_memory() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let data = task.read_memory(DATA + 0x10, 0x20)?;

    assert_eq!(&data[..], &PATTERN[0x10..0x30]);
    assert_eq!(target.sim.outstanding_allocations(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_read_spanning_pages() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let data = task.read_memory(DATA + 0xff0, 0x20)?;

    assert_eq!(&data[..], &PATTERN[0xff0..0x1010]);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_short_read_at_guard_page() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let data = task.read_memory(DATA + 0x1800, 0x1000)?;

    assert_eq!(data.len(), 0x800);
    assert_eq!(&data[..], &PATTERN[0x1800..]);
    assert_eq!(target.sim.outstanding_allocations(), 0);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_short_read_at_unmapped_tail() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let data = task.read_memory(TEXT + 0xf00, 0x200)?;

    assert_eq!(data, vec![0xcc; 0x100]);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_read_unmapped() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let err = task.read_memory(UNMAPPED, 16).unwrap_err();
    assert_matches!(err, Error::InvalidAddress { address: UNMAPPED, .. });

    let err = task.read_memory(GUARD, 16).unwrap_err();
    assert_matches!(err, Error::InvalidAddress { .. });

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_zero_length_access() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    assert!(task.read_memory(UNMAPPED, 0)?.is_empty());
    task.write_memory(UNMAPPED, &[])?;

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_write_memory() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    task.suspend()?;
    task.write_memory(DATA + 0xffe, &[0xde, 0xad, 0xbe, 0xef])?;
    task.resume()?;

    assert_eq!(target.sim.peek(target.pid, DATA + 0xffe, 4), Some(vec![0xde, 0xad, 0xbe, 0xef]));
    assert_eq!(task.read_memory(DATA + 0xffe, 4)?, vec![0xde, 0xad, 0xbe, 0xef]);

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_write_read_only() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    let err = task.write_memory(TEXT, &[0x90]).unwrap_err();

    assert_matches!(err, Error::ReadOnlyMemory { address: TEXT, .. });
    assert_eq!(target.sim.peek(target.pid, TEXT, 1), Some(vec![0xcc]));

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_write_is_all_or_nothing() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    // Runs off the end of `DATA` into the guard page.
    let end = GUARD - 2;
    let err = task.write_memory(end, &[1, 2, 3, 4]).unwrap_err();

    assert_matches!(err, Error::ReadOnlyMemory { .. });
    assert_eq!(target.sim.peek(target.pid, end, 2), Some(PATTERN[PATTERN.len() - 2..].to_vec()));

    let err = task.write_memory(UNMAPPED, &[1]).unwrap_err();
    assert_matches!(err, Error::InvalidAddress { .. });

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_u64_access() -> Result<()> {
    let target = Target::standard(1);
    let task = Task::attach(target.kernel.clone(), target.pid)?;

    task.write_u64(DATA + 8, 0x0102_0304_0506_0708)?;

    assert_eq!(task.read_u64(DATA + 8)?, 0x0102_0304_0506_0708);
    assert_eq!(target.sim.peek(target.pid, DATA + 8, 1), Some(vec![0x08]));

    // Only four bytes are mapped before the guard page.
    let err = task.read_u64(GUARD - 4).unwrap_err();
    assert_matches!(err, Error::InvalidAddress { .. });

    Ok(())
}

#[test]
#[timeout(1000)]
fn test_access_after_release() -> Result<()> {
    let target = Target::standard(1);
    let mut task = Task::attach(target.kernel.clone(), target.pid)?;

    task.release()?;

    assert_matches!(task.read_memory(DATA, 1).unwrap_err(), Error::AlreadyReleased { .. });
    assert_matches!(task.write_memory(DATA, &[1]).unwrap_err(), Error::AlreadyReleased { .. });

    Ok(())
}
