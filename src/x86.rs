//! Syscall register layout of x86-64.

use memoffset::offset_of;

use crate::ptracer::{Registers, SYSCALL_ARGS};

/// Offset of the syscall number in the virtual `user` area.
///
/// At a syscall-entry-stop, the kernel dispatches on `orig_rax`, so rewriting it
/// replaces the syscall about to run.
pub(crate) fn number_offset() -> u64 {
    offset_of!(libc::user_regs_struct, orig_rax) as u64
}

/// Offset of the syscall argument register `index` in the virtual `user` area.
pub(crate) fn arg_offset(index: usize) -> Option<u64> {
    let off = match index {
        0 => offset_of!(libc::user_regs_struct, rdi),
        1 => offset_of!(libc::user_regs_struct, rsi),
        2 => offset_of!(libc::user_regs_struct, rdx),
        3 => offset_of!(libc::user_regs_struct, r10),
        4 => offset_of!(libc::user_regs_struct, r8),
        5 => offset_of!(libc::user_regs_struct, r9),
        _ => return None,
    };

    Some(off as u64)
}

pub(crate) fn syscall_number(regs: &Registers) -> i64 {
    regs.orig_rax as i64
}

pub(crate) fn syscall_args(regs: &Registers) -> [u64; SYSCALL_ARGS] {
    [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9]
}

pub(crate) fn return_value(regs: &Registers) -> i64 {
    regs.rax as i64
}

pub(crate) fn stack_pointer(regs: &Registers) -> u64 {
    regs.rsp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_offsets_follow_abi_order() {
        let offsets: Vec<_> = (0..SYSCALL_ARGS).map(|i| arg_offset(i).unwrap()).collect();

        // `user_regs_struct` is the first member of `user`, and each register is a word.
        assert!(offsets.iter().all(|off| off % 8 == 0));
        assert_eq!(offsets[0], 14 * 8);
        assert_eq!(arg_offset(SYSCALL_ARGS), None);
        assert_eq!(number_offset(), 15 * 8);
    }
}
