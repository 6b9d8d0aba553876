//! Guest entry and VM-exit trampolines.
//!
//! ```text
//!  host stack (HOST_RSP = top - 16)
//!  High    top - 8      owning Vcpu pointer
//!          top - 16     padding, keeps HOST_RSP 16 byte aligned
//!          ...          GuestContext (pushed by vmx_exit_trampoline)
//!  Low     ...
//! ```
//!
//! `vmx_launch_guest` takes no arguments. It writes the guest RSP and RIP so
//! that the guest resumes inside the function itself, right after `vmlaunch`,
//! and returns 1 there. A failed `vmlaunch` falls through and returns 0.
//!
//! `vmx_exit_trampoline` is `HOST_RIP`. It stores every guest register into a
//! [`GuestContext`] on the host stack, calls `handle_vm_exit(vcpu, context)`
//! with the System V ABI and restores the (possibly modified) registers before
//! `vmresume`. If `vmresume` fails, `handle_vm_resume_failure(vcpu)` is called,
//! which never returns.

use crate::vmx::{descriptors::HOST_STACK_RESERVED, guest::GuestContext, vmexit};
use core::{arch::global_asm, mem::offset_of, mem::size_of};
use x86::vmx::vmcs;

/// Offset of the owning `Vcpu` pointer above `HOST_RSP`.
const OWNER_OFFSET: usize = HOST_STACK_RESERVED - size_of::<u64>();

extern "sysv64" {
    pub fn vmx_launch_guest() -> u8;
    pub fn vmx_exit_trampoline();
}

global_asm!(
    r#"
    .globl vmx_launch_guest
vmx_launch_guest:
    mov     rax, {guest_rsp}
    vmwrite rax, rsp
    jbe     2f

    lea     rdx, [rip + 3f]
    mov     rax, {guest_rip}
    vmwrite rax, rdx
    jbe     2f

    vmlaunch

2:
    xor     eax, eax
    ret

3:
    mov     eax, 1
    ret
"#,
    guest_rsp = const vmcs::guest::RSP,
    guest_rip = const vmcs::guest::RIP,
);

global_asm!(
    r#"
    .globl vmx_exit_trampoline
vmx_exit_trampoline:
    sub     rsp, {context_size}

    mov     [rsp + {rax}], rax
    mov     [rsp + {rcx}], rcx
    mov     [rsp + {rdx}], rdx
    mov     [rsp + {rbx}], rbx
    mov     [rsp + {rbp}], rbp
    mov     [rsp + {rsi}], rsi
    mov     [rsp + {rdi}], rdi
    mov     [rsp + {r8}], r8
    mov     [rsp + {r9}], r9
    mov     [rsp + {r10}], r10
    mov     [rsp + {r11}], r11
    mov     [rsp + {r12}], r12
    mov     [rsp + {r13}], r13
    mov     [rsp + {r14}], r14
    mov     [rsp + {r15}], r15

    mov     rax, cr2
    mov     [rsp + {cr2}], rax
    mov     rax, cr8
    mov     [rsp + {cr8}], rax

    movdqu  [rsp + {xmm0}], xmm0
    movdqu  [rsp + {xmm1}], xmm1
    movdqu  [rsp + {xmm2}], xmm2
    movdqu  [rsp + {xmm3}], xmm3
    movdqu  [rsp + {xmm4}], xmm4
    movdqu  [rsp + {xmm5}], xmm5
    movdqu  [rsp + {xmm6}], xmm6
    movdqu  [rsp + {xmm7}], xmm7
    movdqu  [rsp + {xmm8}], xmm8
    movdqu  [rsp + {xmm9}], xmm9
    movdqu  [rsp + {xmm10}], xmm10
    movdqu  [rsp + {xmm11}], xmm11
    movdqu  [rsp + {xmm12}], xmm12
    movdqu  [rsp + {xmm13}], xmm13
    movdqu  [rsp + {xmm14}], xmm14
    movdqu  [rsp + {xmm15}], xmm15

    mov     rdi, [rsp + {context_size} + {owner}]
    mov     rsi, rsp
    cld
    call    {handle_vm_exit}

    movdqu  xmm0, [rsp + {xmm0}]
    movdqu  xmm1, [rsp + {xmm1}]
    movdqu  xmm2, [rsp + {xmm2}]
    movdqu  xmm3, [rsp + {xmm3}]
    movdqu  xmm4, [rsp + {xmm4}]
    movdqu  xmm5, [rsp + {xmm5}]
    movdqu  xmm6, [rsp + {xmm6}]
    movdqu  xmm7, [rsp + {xmm7}]
    movdqu  xmm8, [rsp + {xmm8}]
    movdqu  xmm9, [rsp + {xmm9}]
    movdqu  xmm10, [rsp + {xmm10}]
    movdqu  xmm11, [rsp + {xmm11}]
    movdqu  xmm12, [rsp + {xmm12}]
    movdqu  xmm13, [rsp + {xmm13}]
    movdqu  xmm14, [rsp + {xmm14}]
    movdqu  xmm15, [rsp + {xmm15}]

    mov     rax, [rsp + {cr2}]
    mov     cr2, rax
    mov     rax, [rsp + {cr8}]
    mov     cr8, rax

    mov     rax, [rsp + {rax}]
    mov     rcx, [rsp + {rcx}]
    mov     rdx, [rsp + {rdx}]
    mov     rbx, [rsp + {rbx}]
    mov     rbp, [rsp + {rbp}]
    mov     rsi, [rsp + {rsi}]
    mov     rdi, [rsp + {rdi}]
    mov     r8, [rsp + {r8}]
    mov     r9, [rsp + {r9}]
    mov     r10, [rsp + {r10}]
    mov     r11, [rsp + {r11}]
    mov     r12, [rsp + {r12}]
    mov     r13, [rsp + {r13}]
    mov     r14, [rsp + {r14}]
    mov     r15, [rsp + {r15}]

    add     rsp, {context_size}
    vmresume

    mov     rdi, [rsp + {owner}]
    call    {handle_vm_resume_failure}
    ud2
"#,
    context_size = const size_of::<GuestContext>(),
    owner = const OWNER_OFFSET,
    rax = const offset_of!(GuestContext, rax),
    rcx = const offset_of!(GuestContext, rcx),
    rdx = const offset_of!(GuestContext, rdx),
    rbx = const offset_of!(GuestContext, rbx),
    rbp = const offset_of!(GuestContext, rbp),
    rsi = const offset_of!(GuestContext, rsi),
    rdi = const offset_of!(GuestContext, rdi),
    r8 = const offset_of!(GuestContext, r8),
    r9 = const offset_of!(GuestContext, r9),
    r10 = const offset_of!(GuestContext, r10),
    r11 = const offset_of!(GuestContext, r11),
    r12 = const offset_of!(GuestContext, r12),
    r13 = const offset_of!(GuestContext, r13),
    r14 = const offset_of!(GuestContext, r14),
    r15 = const offset_of!(GuestContext, r15),
    cr2 = const offset_of!(GuestContext, cr2),
    cr8 = const offset_of!(GuestContext, cr8),
    xmm0 = const offset_of!(GuestContext, xmm0),
    xmm1 = const offset_of!(GuestContext, xmm1),
    xmm2 = const offset_of!(GuestContext, xmm2),
    xmm3 = const offset_of!(GuestContext, xmm3),
    xmm4 = const offset_of!(GuestContext, xmm4),
    xmm5 = const offset_of!(GuestContext, xmm5),
    xmm6 = const offset_of!(GuestContext, xmm6),
    xmm7 = const offset_of!(GuestContext, xmm7),
    xmm8 = const offset_of!(GuestContext, xmm8),
    xmm9 = const offset_of!(GuestContext, xmm9),
    xmm10 = const offset_of!(GuestContext, xmm10),
    xmm11 = const offset_of!(GuestContext, xmm11),
    xmm12 = const offset_of!(GuestContext, xmm12),
    xmm13 = const offset_of!(GuestContext, xmm13),
    xmm14 = const offset_of!(GuestContext, xmm14),
    xmm15 = const offset_of!(GuestContext, xmm15),
    handle_vm_exit = sym vmexit::handle_vm_exit,
    handle_vm_resume_failure = sym vmexit::handle_vm_resume_failure,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{utils::alloc::zeroed_box, vmx::descriptors::HostStack};

    /// Reads a qword the way the exit trampoline does, relative to its `rsp`.
    fn load(rsp: u64, displacement: usize) -> u64 {
        unsafe { core::ptr::read_unaligned((rsp + displacement as u64) as *const u64) }
    }

    #[test]
    fn trampoline_finds_owner_on_host_stack() {
        let mut stack = unsafe { zeroed_box::<HostStack>() }.unwrap();
        stack.set_owner(0xFFFF_8000_DEAD_BEEF);
        let context_size = size_of::<GuestContext>();

        // After `sub rsp, context_size`.
        let rsp = stack.host_rsp() - context_size as u64;
        assert_eq!(load(rsp, context_size + OWNER_OFFSET), stack.owner());

        // After `add rsp, context_size` and a failed `vmresume`.
        let rsp = stack.host_rsp();
        assert_eq!(load(rsp, OWNER_OFFSET), stack.owner());
        assert_eq!(rsp + OWNER_OFFSET as u64, stack.top() - 8);
    }

    #[test]
    fn exit_handler_is_called_with_aligned_stack() {
        let stack = unsafe { zeroed_box::<HostStack>() }.unwrap();

        assert_eq!(stack.host_rsp() % 16, 0);
        assert_eq!(size_of::<GuestContext>() % 16, 0);
        assert!(OWNER_OFFSET + size_of::<u64>() <= HOST_STACK_RESERVED);
    }
}
