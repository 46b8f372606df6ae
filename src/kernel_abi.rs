//! The narrow surface behind which CPU differences hide.
//!
//! Everything the ptrace engine needs to know about the architecture is
//! expressed here: how to stage a six-argument call in a stopped thread's
//! registers, whether the return address lives in a register or on the
//! stack, where the return value comes out, and how far to advance the
//! instruction pointer past the trap instruction the trampoline executes.

use crate::registers::RegisterSet;
use crate::remote_ptr::{RemotePtr, Void};

/// Register-passed arguments of a remote call. Calls needing more than six
/// arguments are not supported.
pub type CallArgs = [u64; 6];

pub trait Arch {
    /// Byte length of the trap instruction the trampoline busy-waits on;
    /// the engine skips this many bytes to resume past it.
    const TRAP_INSTRUCTION_LEN: u64;

    /// Stage a call to `func` in `regs`: argument registers, instruction
    /// pointer, and the return address (where the ABI passes it in a
    /// register).
    fn setup_call(regs: &mut RegisterSet, args: &CallArgs, func: u64, return_addr: u64);

    /// Reserve a word of stack for the return address and return its
    /// location, on ABIs where the caller pushes it. None on aarch64.
    fn reserve_return_slot(regs: &mut RegisterSet) -> Option<RemotePtr<Void>>;

    /// The called function's return value.
    fn retval(regs: &RegisterSet) -> u64;

    fn advance_past_trap(regs: &mut RegisterSet);
}

#[cfg(target_arch = "aarch64")]
pub struct Arm64;

#[cfg(target_arch = "aarch64")]
impl Arch for Arm64 {
    // brk #0x0
    const TRAP_INSTRUCTION_LEN: u64 = 4;

    fn setup_call(regs: &mut RegisterSet, args: &CallArgs, func: u64, return_addr: u64) {
        regs.regs[..6].copy_from_slice(args);
        regs.pc = func;
        // link register (x30)
        regs.regs[30] = return_addr;
    }

    fn reserve_return_slot(_regs: &mut RegisterSet) -> Option<RemotePtr<Void>> {
        None
    }

    fn retval(regs: &RegisterSet) -> u64 {
        regs.regs[0]
    }

    fn advance_past_trap(regs: &mut RegisterSet) {
        regs.pc = regs.pc.wrapping_add(Self::TRAP_INSTRUCTION_LEN);
    }
}

#[cfg(target_arch = "x86_64")]
pub struct X64;

#[cfg(target_arch = "x86_64")]
impl Arch for X64 {
    // int3
    const TRAP_INSTRUCTION_LEN: u64 = 1;

    fn setup_call(regs: &mut RegisterSet, args: &CallArgs, func: u64, _return_addr: u64) {
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.rcx = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.rip = func;
        // rax carries the vector-register count for varargs callees
        regs.rax = 0;
        // the return address goes on the stack; see reserve_return_slot
    }

    fn reserve_return_slot(regs: &mut RegisterSet) -> Option<RemotePtr<Void>> {
        regs.rsp = regs.rsp.wrapping_sub(std::mem::size_of::<u64>() as u64);
        Some(RemotePtr::from(regs.rsp))
    }

    fn retval(regs: &RegisterSet) -> u64 {
        regs.rax
    }

    fn advance_past_trap(regs: &mut RegisterSet) {
        regs.rip = regs.rip.wrapping_add(Self::TRAP_INSTRUCTION_LEN);
    }
}

#[cfg(target_arch = "aarch64")]
pub type NativeArch = Arm64;

#[cfg(target_arch = "x86_64")]
pub type NativeArch = X64;

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("only aarch64 and x86_64 targets are supported");

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_regs() -> RegisterSet {
        unsafe { std::mem::zeroed() }
    }

    const ARGS: CallArgs = [1, 2, 3, 4, 5, 6];

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn call_setup_follows_the_sysv_abi() {
        let mut regs = zeroed_regs();
        regs.rax = 0x5555;
        X64::setup_call(&mut regs, &ARGS, 0x4000_0000, 0);
        assert_eq!(
            [regs.rdi, regs.rsi, regs.rdx, regs.rcx, regs.r8, regs.r9],
            ARGS
        );
        assert_eq!(regs.rip, 0x4000_0000);
        assert_eq!(regs.rax, 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn return_slot_is_one_word_below_the_old_stack_pointer() {
        let mut regs = zeroed_regs();
        regs.rsp = 0x7fff_0000;
        let slot = X64::reserve_return_slot(&mut regs).unwrap();
        assert_eq!(slot.as_u64(), 0x7fff_0000 - 8);
        assert_eq!(regs.rsp, 0x7fff_0000 - 8);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn trap_advance_skips_int3() {
        let mut regs = zeroed_regs();
        regs.rip = 0x1000;
        X64::advance_past_trap(&mut regs);
        assert_eq!(regs.rip, 0x1001);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn retval_reads_rax() {
        let mut regs = zeroed_regs();
        regs.rax = 77;
        assert_eq!(X64::retval(&regs), 77);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn call_setup_follows_the_aapcs64_abi() {
        let mut regs = zeroed_regs();
        Arm64::setup_call(&mut regs, &ARGS, 0x4000_0000, 0);
        assert_eq!(regs.regs[..6], ARGS);
        assert_eq!(regs.pc, 0x4000_0000);
        assert_eq!(regs.regs[30], 0);
        assert!(Arm64::reserve_return_slot(&mut regs).is_none());
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn trap_advance_skips_brk() {
        let mut regs = zeroed_regs();
        regs.pc = 0x1000;
        Arm64::advance_past_trap(&mut regs);
        assert_eq!(regs.pc, 0x1004);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn retval_reads_x0() {
        let mut regs = zeroed_regs();
        regs.regs[0] = 77;
        assert_eq!(Arm64::retval(&regs), 77);
    }
}
