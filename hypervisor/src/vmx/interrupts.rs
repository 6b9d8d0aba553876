//! Host interrupt handling while the processor runs in VMX root operation.
//!
//! VM-exits load `RFLAGS` with `IF` cleared, so only NMIs and exceptions raised
//! by the host itself arrive here. Every vector has a 16 byte stub in
//! `host_isr_table`: vectors 0 to 31 get their own stub, everything above
//! shares the last one which reports vector `0xFF`.

use crate::{
    error::HypervisorError,
    vmx::{hw::Intel, vcpu::Vcpu},
};
use core::{arch::global_asm, mem::size_of};
use x86::msr::{rdmsr, IA32_GS_BASE};

pub const NMI_VECTOR: u64 = 2;
pub const SHARED_STUB_VECTOR: u64 = 0xFF;

const STUB_SIZE: u64 = 16;
const DEDICATED_STUBS: u8 = 32;

/// Stack layout built by the stubs, lowest address first.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,

    pub vector: u64,
    /// Zero for vectors without a hardware error code.
    pub error: u64,

    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}
const_assert_eq!(size_of::<TrapFrame>(), 176);
const_assert_eq!(size_of::<TrapFrame>() % 16, 0);

/// Record of a host exception that was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostException {
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
}

extern "sysv64" {
    fn host_isr_table();

    /// Returns 1 and stores the value, or 0 if `rdmsr` raised `#GP`.
    pub(crate) fn vmx_checked_rdmsr(msr: u32, value: *mut u64) -> u8;
    /// Returns 1, or 0 if `wrmsr` raised `#GP`.
    pub(crate) fn vmx_checked_wrmsr(msr: u32, value: u64) -> u8;

    fn vmx_rdmsr_access();
    fn vmx_wrmsr_access();
    fn vmx_msr_faulted();
}

/// Address of the stub handling `vector`.
pub fn host_isr_address(vector: u8) -> u64 {
    stub_address(host_isr_table as usize as u64, vector)
}

fn stub_address(table: u64, vector: u8) -> u64 {
    table + STUB_SIZE * vector.min(DEDICATED_STUBS) as u64
}

global_asm!(
    r#"
.macro HOST_ISR_NOERR vector
    .balign 16
    push    0
    push    \vector
    jmp     host_isr_common
.endm

.macro HOST_ISR_ERR vector
    .balign 16
    push    \vector
    jmp     host_isr_common
.endm

    .balign 16
    .globl host_isr_table
host_isr_table:
    HOST_ISR_NOERR 0
    HOST_ISR_NOERR 1
    HOST_ISR_NOERR 2
    HOST_ISR_NOERR 3
    HOST_ISR_NOERR 4
    HOST_ISR_NOERR 5
    HOST_ISR_NOERR 6
    HOST_ISR_NOERR 7
    HOST_ISR_ERR   8
    HOST_ISR_NOERR 9
    HOST_ISR_ERR   10
    HOST_ISR_ERR   11
    HOST_ISR_ERR   12
    HOST_ISR_ERR   13
    HOST_ISR_ERR   14
    HOST_ISR_NOERR 15
    HOST_ISR_NOERR 16
    HOST_ISR_ERR   17
    HOST_ISR_NOERR 18
    HOST_ISR_NOERR 19
    HOST_ISR_NOERR 20
    HOST_ISR_ERR   21
    HOST_ISR_NOERR 22
    HOST_ISR_NOERR 23
    HOST_ISR_NOERR 24
    HOST_ISR_NOERR 25
    HOST_ISR_NOERR 26
    HOST_ISR_NOERR 27
    HOST_ISR_NOERR 28
    HOST_ISR_ERR   29
    HOST_ISR_ERR   30
    HOST_ISR_NOERR 31
    HOST_ISR_NOERR {shared_vector}

host_isr_common:
    push    r15
    push    r14
    push    r13
    push    r12
    push    r11
    push    r10
    push    r9
    push    r8
    push    rbp
    push    rdi
    push    rsi
    push    rdx
    push    rcx
    push    rbx
    push    rax

    mov     rdi, rsp
    cld
    call    {handler}

    pop     rax
    pop     rbx
    pop     rcx
    pop     rdx
    pop     rsi
    pop     rdi
    pop     rbp
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15

    add     rsp, 16
    iretq
"#,
    shared_vector = const SHARED_STUB_VECTOR,
    handler = sym handle_host_interrupt,
);

/// Resume address for a host exception raised at `rip` by one of the checked
/// MSR accesses.
pub fn msr_fault_fixup(rip: u64) -> Option<u64> {
    let faulting = [
        vmx_rdmsr_access as usize as u64,
        vmx_wrmsr_access as usize as u64,
    ];

    faulting
        .contains(&rip)
        .then_some(vmx_msr_faulted as usize as u64)
}

// The faulting instruction is resumed at `vmx_msr_faulted` with the stack
// as it was, so the `ret` there returns to the caller.
global_asm!(
    r#"
    .globl vmx_checked_rdmsr
vmx_checked_rdmsr:
    mov     ecx, edi
    .globl vmx_rdmsr_access
vmx_rdmsr_access:
    rdmsr
    shl     rdx, 32
    or      rax, rdx
    mov     [rsi], rax
    mov     eax, 1
    ret

    .globl vmx_checked_wrmsr
vmx_checked_wrmsr:
    mov     ecx, edi
    mov     eax, esi
    mov     rdx, rsi
    shr     rdx, 32
    .globl vmx_wrmsr_access
vmx_wrmsr_access:
    wrmsr
    mov     eax, 1
    ret

    .globl vmx_msr_faulted
vmx_msr_faulted:
    xor     eax, eax
    ret
"#
);

/// Called by `host_isr_common`. Host `GS` base points to the owning vCPU.
unsafe extern "sysv64" fn handle_host_interrupt(frame: *mut TrapFrame) {
    let vcpu = rdmsr(IA32_GS_BASE) as *mut Vcpu<Intel>;

    let (Some(vcpu), Some(frame)) = (vcpu.as_mut(), frame.as_mut()) else {
        panic!("Host interrupt without an owning processor");
    };

    if let Err(error) = vcpu.on_host_interrupt(frame) {
        fatal_host_interrupt(vcpu, error);
    }
}

fn fatal_host_interrupt(vcpu: &mut Vcpu<Intel>, error: HypervisorError) -> ! {
    log::error!("Processor {}: {}", vcpu.index(), error);

    vcpu.abort(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn frame_matches_push_order() {
        assert_eq!(offset_of!(TrapFrame, rax), 0);
        assert_eq!(offset_of!(TrapFrame, r15), 14 * 8);
        assert_eq!(offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(offset_of!(TrapFrame, error), 16 * 8);
        assert_eq!(offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, ss), 21 * 8);
    }

    #[test]
    fn only_checked_msr_accesses_are_fixed_up() {
        let landing = Some(vmx_msr_faulted as usize as u64);

        assert_eq!(msr_fault_fixup(vmx_rdmsr_access as usize as u64), landing);
        assert_eq!(msr_fault_fixup(vmx_wrmsr_access as usize as u64), landing);
        assert_eq!(msr_fault_fixup(vmx_checked_rdmsr as usize as u64), None);
        assert_eq!(msr_fault_fixup(0), None);
    }

    #[test]
    fn vectors_above_31_share_a_stub() {
        let table = 0x1000;

        assert_eq!(stub_address(table, 0), 0x1000);
        assert_eq!(stub_address(table, 14), 0x1000 + 14 * 16);
        assert_eq!(stub_address(table, 32), 0x1000 + 32 * 16);
        assert_eq!(stub_address(table, 255), stub_address(table, 32));
    }
}
