//! Per-thread CPU register state.
//!
//! Register state is read and written as a whole snapshot. The kernel transfers it as
//! an array of 32-bit words whose layout is fixed by the flavor; the snapshot types
//! below decode and encode that layout explicitly, so a snapshot taken from one
//! architecture can be inspected on any host.

use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::kernel::Flavor;
use crate::task::Thread;

/// `x86_THREAD_STATE64`.
pub const X86_THREAD_STATE64: Flavor = 4;

/// Word count of `x86_thread_state64_t`.
pub const X86_THREAD_STATE64_COUNT: u32 = 42;

/// `ARM_THREAD_STATE64`.
pub const ARM_THREAD_STATE64: Flavor = 6;

/// Word count of `arm_thread_state64_t`.
pub const ARM_THREAD_STATE64_COUNT: u32 = 68;

/// Supported register layouts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// The architecture of the controlling process.
    pub fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Arm64)
        } else {
            None
        }
    }

    pub fn flavor(self) -> Flavor {
        match self {
            Arch::X86_64 => X86_THREAD_STATE64,
            Arch::Arm64 => ARM_THREAD_STATE64,
        }
    }

    /// Expected word count for this architecture's flavor.
    pub fn state_count(self) -> u32 {
        match self {
            Arch::X86_64 => X86_THREAD_STATE64_COUNT,
            Arch::Arm64 => ARM_THREAD_STATE64_COUNT,
        }
    }
}

/// `x86_thread_state64_t`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct X86ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl X86ThreadState64 {
    fn from_words(words: &[u32]) -> Self {
        let mut q = Quads::new(words);

        Self {
            rax: q.quad(),
            rbx: q.quad(),
            rcx: q.quad(),
            rdx: q.quad(),
            rdi: q.quad(),
            rsi: q.quad(),
            rbp: q.quad(),
            rsp: q.quad(),
            r8: q.quad(),
            r9: q.quad(),
            r10: q.quad(),
            r11: q.quad(),
            r12: q.quad(),
            r13: q.quad(),
            r14: q.quad(),
            r15: q.quad(),
            rip: q.quad(),
            rflags: q.quad(),
            cs: q.quad(),
            fs: q.quad(),
            gs: q.quad(),
        }
    }

    fn to_words(&self) -> Vec<u32> {
        let fields = [
            self.rax, self.rbx, self.rcx, self.rdx, self.rdi, self.rsi, self.rbp, self.rsp,
            self.r8, self.r9, self.r10, self.r11, self.r12, self.r13, self.r14, self.r15,
            self.rip, self.rflags, self.cs, self.fs, self.gs,
        ];

        let mut words = Vec::with_capacity(X86_THREAD_STATE64_COUNT as usize);
        fields.iter().for_each(|&v| push_quad(&mut words, v));
        words
    }
}

/// `arm_thread_state64_t`.
///
/// On arm64e targets `fp`, `lr`, `sp`, and `pc` may carry pointer-authentication
/// signatures, flagged in `flags`. They are passed through unmodified.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArmThreadState64 {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub flags: u32,
}

impl ArmThreadState64 {
    fn from_words(words: &[u32]) -> Self {
        let mut q = Quads::new(words);

        let mut x = [0u64; 29];
        x.iter_mut().for_each(|r| *r = q.quad());

        let fp = q.quad();
        let lr = q.quad();
        let sp = q.quad();
        let pc = q.quad();
        let cpsr = q.word();
        let flags = q.word();

        Self { x, fp, lr, sp, pc, cpsr, flags }
    }

    fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(ARM_THREAD_STATE64_COUNT as usize);

        for &v in self.x.iter().chain(&[self.fp, self.lr, self.sp, self.pc]) {
            push_quad(&mut words, v);
        }

        words.push(self.cpsr);
        words.push(self.flags);
        words
    }
}

/// Register state of one thread, tagged with the layout that produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegisterSnapshot {
    X86_64(X86ThreadState64),
    Arm64(ArmThreadState64),
}

impl RegisterSnapshot {
    pub fn arch(&self) -> Arch {
        match self {
            RegisterSnapshot::X86_64(_) => Arch::X86_64,
            RegisterSnapshot::Arm64(_) => Arch::Arm64,
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.arch().flavor()
    }

    /// Decode the kernel's words for `arch`. `words` must hold exactly the flavor's count.
    pub fn from_words(arch: Arch, words: &[u32]) -> Result<Self> {
        let expected = arch.state_count();

        if words.len() != expected as usize {
            return Err(Error::UnexpectedStateSize {
                flavor: arch.flavor(),
                expected,
                actual: words.len() as u32,
            });
        }

        let snapshot = match arch {
            Arch::X86_64 => RegisterSnapshot::X86_64(X86ThreadState64::from_words(words)),
            Arch::Arm64 => RegisterSnapshot::Arm64(ArmThreadState64::from_words(words)),
        };

        Ok(snapshot)
    }

    pub fn to_words(&self) -> Vec<u32> {
        match self {
            RegisterSnapshot::X86_64(state) => state.to_words(),
            RegisterSnapshot::Arm64(state) => state.to_words(),
        }
    }

    /// Program counter.
    pub fn pc(&self) -> u64 {
        match self {
            RegisterSnapshot::X86_64(state) => state.rip,
            RegisterSnapshot::Arm64(state) => state.pc,
        }
    }

    pub fn set_pc(&mut self, pc: u64) {
        match self {
            RegisterSnapshot::X86_64(state) => state.rip = pc,
            RegisterSnapshot::Arm64(state) => state.pc = pc,
        }
    }

    /// Stack pointer.
    pub fn sp(&self) -> u64 {
        match self {
            RegisterSnapshot::X86_64(state) => state.rsp,
            RegisterSnapshot::Arm64(state) => state.sp,
        }
    }
}

impl Thread {
    /// Read the thread's register state in the layout of `arch`.
    ///
    /// The thread should be stopped (its task suspended, or the thread parked in an
    /// exception) for the snapshot to be consistent.
    pub fn registers(&self, arch: Arch) -> Result<RegisterSnapshot> {
        self.check_live()?;

        let flavor = arch.flavor();
        let expected = arch.state_count();
        let mut words = vec![0u32; expected as usize];

        let actual = self
            .kernel()
            .thread_get_state(self.port(), flavor, &mut words)
            .or_kernel("thread_get_state")?;

        if actual != expected {
            return Err(Error::UnexpectedStateSize { flavor, expected, actual });
        }

        RegisterSnapshot::from_words(arch, &words)
    }

    /// Overwrite the thread's entire register state with `snapshot`.
    pub fn set_registers(&self, snapshot: &RegisterSnapshot) -> Result<()> {
        self.check_live()?;

        let words = snapshot.to_words();

        self.kernel()
            .thread_set_state(self.port(), snapshot.flavor(), &words)
            .or_kernel("thread_set_state")?;

        debug!(thread = self.port(), pc = snapshot.pc(), "set thread state");

        Ok(())
    }
}

// Consumes 32-bit words as little-endian 64-bit fields.
struct Quads<'a> {
    words: &'a [u32],
    pos: usize,
}

impl<'a> Quads<'a> {
    fn new(words: &'a [u32]) -> Self {
        Self { words, pos: 0 }
    }

    fn word(&mut self) -> u32 {
        let w = self.words[self.pos];
        self.pos += 1;
        w
    }

    fn quad(&mut self) -> u64 {
        let lo = u64::from(self.word());
        let hi = u64::from(self.word());
        lo | (hi << 32)
    }
}

fn push_quad(words: &mut Vec<u32>, value: u64) {
    words.push(value as u32);
    words.push((value >> 32) as u32);
}

#[cfg(test)]
mod tests {
    use std::mem;

    use super::*;

    #[test]
    fn test_layout_sizes_match_counts() {
        assert_eq!(mem::size_of::<X86ThreadState64>(), X86_THREAD_STATE64_COUNT as usize * 4);
        assert_eq!(mem::size_of::<ArmThreadState64>(), ARM_THREAD_STATE64_COUNT as usize * 4);
    }

    #[test]
    fn test_field_offsets_match_word_order() {
        use memoffset::offset_of;

        assert_eq!(offset_of!(X86ThreadState64, rsp), 14 * 4);
        assert_eq!(offset_of!(X86ThreadState64, rip), 32 * 4);
        assert_eq!(offset_of!(ArmThreadState64, pc), 64 * 4);
        assert_eq!(offset_of!(ArmThreadState64, cpsr), 66 * 4);
    }

    #[test]
    fn test_x86_word_order() {
        let mut words = vec![0u32; X86_THREAD_STATE64_COUNT as usize];

        // rip is the 17th field.
        words[32] = 0xcafe_babe;
        words[33] = 0x0000_0001;
        // rsp is the 8th field.
        words[14] = 0x7ff0;

        let snapshot = RegisterSnapshot::from_words(Arch::X86_64, &words).unwrap();

        assert_eq!(snapshot.pc(), 0x1_cafe_babe);
        assert_eq!(snapshot.sp(), 0x7ff0);
        assert_eq!(snapshot.to_words(), words);
    }

    #[test]
    fn test_arm_cpsr_is_32_bit() {
        let mut state = ArmThreadState64::default();
        state.x[0] = 0xdead_beef_cafe_babe;
        state.pc = 0x1_0000_4000;
        state.cpsr = 0x6000_0000;

        let words = RegisterSnapshot::Arm64(state).to_words();

        assert_eq!(words.len(), ARM_THREAD_STATE64_COUNT as usize);
        assert_eq!(words[0], 0xcafe_babe);
        assert_eq!(words[1], 0xdead_beef);
        assert_eq!(words[66], 0x6000_0000);
    }

    #[test]
    fn test_wrong_word_count() {
        let words = vec![0u32; 40];
        let err = RegisterSnapshot::from_words(Arch::X86_64, &words).unwrap_err();

        assert!(matches!(
            err,
            Error::UnexpectedStateSize { flavor: X86_THREAD_STATE64, expected: 42, actual: 40 }
        ));
    }

    #[test]
    fn test_set_pc_dispatches_on_tag() {
        let mut snapshot = RegisterSnapshot::Arm64(ArmThreadState64::default());
        snapshot.set_pc(0x4000);

        assert_eq!(snapshot.pc(), 0x4000);
        assert_eq!(snapshot.flavor(), ARM_THREAD_STATE64);
    }
}
