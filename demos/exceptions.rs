use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;
use taskport::sim::{SimKernel, SimProcess};
use taskport::{AttachOptions, ExceptionMask, KernelRef, MonitorConfig, Pid, Resume, Session};

#[derive(StructOpt, Debug)]
struct Opt {
    /// Target pid. Without one, watch a simulated process that faults a few times.
    pid: Option<i32>,

    /// How long to watch, in seconds.
    #[structopt(short, long, default_value = "10")]
    seconds: u64,

    /// Let the host's handler see exceptions after we do.
    #[structopt(short, long)]
    forward: bool,

    /// Only catch breakpoints and bad accesses.
    #[structopt(long)]
    faults_only: bool,
}

#[cfg(target_os = "macos")]
fn host_kernel() -> KernelRef {
    Arc::new(taskport::MachKernel::new())
}

#[cfg(not(target_os = "macos"))]
fn host_kernel() -> KernelRef {
    eprintln!("no Mach kernel on this host, using a simulated one");
    Arc::new(SimKernel::new())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    let mut sim = None;

    let (kernel, pid): (KernelRef, Pid) = match opt.pid {
        Some(raw) => (host_kernel(), Pid::from_raw(raw)),
        None => {
            let kernel = SimKernel::new();
            let pid = kernel.spawn(SimProcess::new());
            sim = Some(kernel.clone());
            (Arc::new(kernel), pid)
        },
    };

    let mut config = MonitorConfig::new();
    if opt.faults_only {
        config.set_mask(ExceptionMask::BREAKPOINT | ExceptionMask::BAD_ACCESS);
    }

    let mut options = AttachOptions::new();
    options.set_suspend(false).set_exceptions(Some(config));

    let mut session = Session::attach(kernel, pid, &options)?;

    let forward = opt.forward;
    session.spawn_monitor(move |exc| {
        println!(
            "thread {:#x}: {:?} codes = {:x?} signal = {:?}",
            exc.thread().port(),
            exc.exception(),
            exc.codes(),
            exc.signal(),
        );

        Ok(if forward { Resume::Forward } else { Resume::Continue })
    })?;

    if let Some(sim) = sim {
        // EXC_BREAKPOINT, EXC_BAD_ACCESS, then SIGUSR1 as EXC_SOFTWARE.
        for (exception, codes) in [(6, vec![1i64, 0x1000]), (1, vec![1, 0xdead_0000]), (5, vec![0x10003, 30])] {
            if let Some(pending) = sim.raise_exception(pid, 0, exception, &codes) {
                println!("reply: {:?}", pending.wait(Duration::from_secs(1)));
            }
        }
    } else {
        thread::sleep(Duration::from_secs(opt.seconds));
    }

    let stats = session.stop_monitor()?;
    println!("{:?}", stats);

    session.detach()?;

    Ok(())
}
