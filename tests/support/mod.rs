use std::sync::Arc;

use lazy_static::lazy_static;
use taskport::sim::{SimKernel, SimProcess};
use taskport::{KernelRef, Pid};

#[allow(unused)]
pub const PAGE_SIZE: u64 = 0x1000;

/// Read-write data, two pages of `PATTERN`.
#[allow(unused)]
pub const DATA: u64 = 0x10000;

/// No-access page directly after `DATA`.
#[allow(unused)]
pub const GUARD: u64 = DATA + 2 * PAGE_SIZE;

/// Read-only page of `0xcc`.
#[allow(unused)]
pub const TEXT: u64 = 0x20000;

#[allow(unused)]
pub const UNMAPPED: u64 = 0x40000;

lazy_static! {
    pub static ref PATTERN: Vec<u8> = (0..2 * PAGE_SIZE as usize).map(|i| (i % 251) as u8).collect();
}

/// Assert that an expression matches a pattern, printing the value on failure.
#[allow(unused)]
macro_rules! assert_matches {
    ($expr: expr, $pat: pat $(if $guard: expr)?) => {
        match $expr {
            $pat $(if $guard)? => {},
            ref other => panic!("expected `{}` to match `{}`, got {:?}", stringify!($expr), stringify!($pat), other),
        }
    };
}

/// A simulated target process.
///
/// `kernel` is the handle the controller sees; `sim` drives the target side.
#[allow(unused)]
pub struct Target {
    pub sim: SimKernel,
    pub kernel: KernelRef,
    pub pid: Pid,
}

#[allow(unused)]
impl Target {
    pub fn spawn(process: SimProcess) -> Self {
        init_tracing();

        let sim = SimKernel::with_page_size(PAGE_SIZE);
        let pid = sim.spawn(process);
        let kernel: KernelRef = Arc::new(sim.clone());

        Self { sim, kernel, pid }
    }

    /// A process with the standard memory layout and `threads` threads.
    pub fn standard(threads: usize) -> Self {
        Self::spawn(standard_process().threads(threads))
    }
}

#[allow(unused)]
pub fn standard_process() -> SimProcess {
    SimProcess::new()
        .region(DATA, PATTERN.clone())
        .guard_region(GUARD, PAGE_SIZE as usize)
        .read_only_region(TEXT, vec![0xcc; PAGE_SIZE as usize])
}

/// Send `RUST_LOG`-filtered logs to the test's captured output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
