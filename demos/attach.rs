use std::sync::Arc;

use anyhow::Result;
use structopt::StructOpt;
use taskport::sim::{SimKernel, SimProcess};
use taskport::{Arch, AttachOptions, KernelRef, Pid, Session};

#[derive(StructOpt, Debug)]
struct Opt {
    /// Target pid. Without one, attach to a simulated process.
    pid: Option<i32>,

    /// Dump memory at this address (hex).
    #[structopt(short, long, parse(try_from_str = parse_address))]
    read: Option<u64>,

    #[structopt(short, long, default_value = "64")]
    len: usize,

    /// Leave the target running while inspecting it.
    #[structopt(long)]
    no_suspend: bool,
}

fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x");
    Ok(u64::from_str_radix(s, 16)?)
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

    let (kernel, pid): (KernelRef, Pid) = match opt.pid {
        Some(raw) => (host_kernel(), Pid::from_raw(raw)),
        None => {
            let sim = SimKernel::new();
            let data = (0..=255).collect();
            let pid = sim.spawn(SimProcess::new().threads(2).region(0x10000, data));
            (Arc::new(sim), pid)
        },
    };

    let mut options = AttachOptions::new();
    options.set_suspend(!opt.no_suspend);

    let session = Session::attach(kernel, pid, &options)?;
    let task = session.task();

    println!("pid = {}, status = {:?}, suspend count = {}", pid, task.status()?, task.kernel_suspend_count()?);

    if let Some(arch) = Arch::native() {
        for thread in task.threads()? {
            let regs = thread.registers(arch)?;
            println!("thread {:#x}: pc = {:x}, sp = {:x}", thread.port(), regs.pc(), regs.sp());
        }
    }

    let address = opt.read.or_else(|| opt.pid.map_or(Some(0x10000), |_| None));

    if let Some(address) = address {
        let data = task.read_memory(address, opt.len)?;

        for (i, line) in data.chunks(16).enumerate() {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
            println!("{:>16x}: {}", address + 16 * i as u64, hex.join(" "));
        }
    }

    session.detach()?;

    Ok(())
}
