//! Syscall register layout of AArch64.

use crate::ptracer::SYSCALL_ARGS;

#[cfg(all(target_os = "android"))]
pub(crate) const PTRACE_GETREGSET: i32 = 0x4204;

#[cfg(all(not(target_os = "android")))]
pub(crate) const PTRACE_GETREGSET: u32 = 0x4204;

#[cfg(all(target_os = "android"))]
pub(crate) const PTRACE_SETREGSET: i32 = 0x4205;

#[cfg(all(not(target_os = "android")))]
pub(crate) const PTRACE_SETREGSET: u32 = 0x4205;

/// Defined in [`include/uapi/linux/elf.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/include/uapi/linux/elf.h#421).
pub(crate) const NT_PRSTATUS: i32 = 0x1;
pub(crate) const NT_ARM_SYSTEM_CALL: i32 = 0x404;

// Syscall number register of the AArch64 calling convention.
const NUMBER_REGISTER: usize = 8;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

pub(crate) fn syscall_number(regs: &user_pt_regs) -> i64 {
    regs.regs[NUMBER_REGISTER] as i64
}

pub(crate) fn syscall_args(regs: &user_pt_regs) -> [u64; SYSCALL_ARGS] {
    let mut args = [0; SYSCALL_ARGS];
    args.copy_from_slice(&regs.regs[..SYSCALL_ARGS]);
    args
}

// `x0` holds both the first argument and the return value.
pub(crate) fn return_value(regs: &user_pt_regs) -> i64 {
    regs.regs[0] as i64
}

pub(crate) fn stack_pointer(regs: &user_pt_regs) -> u64 {
    regs.sp
}
