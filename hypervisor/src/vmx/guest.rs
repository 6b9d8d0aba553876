use core::mem::size_of;

/// Guest general purpose and vector registers, saved by the exit trampoline on
/// the host stack and restored before `vmresume`.
///
/// `rsp` is never written by the trampoline; the guest stack pointer lives in
/// the VMCS. The slot is kept so the GPRs stay in encoding order.
#[repr(C, align(16))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestContext {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cr2: u64,
    pub cr8: u64,
    pub xmm0: u128,
    pub xmm1: u128,
    pub xmm2: u128,
    pub xmm3: u128,
    pub xmm4: u128,
    pub xmm5: u128,
    pub xmm6: u128,
    pub xmm7: u128,
    pub xmm8: u128,
    pub xmm9: u128,
    pub xmm10: u128,
    pub xmm11: u128,
    pub xmm12: u128,
    pub xmm13: u128,
    pub xmm14: u128,
    pub xmm15: u128,
}
const_assert_eq!(size_of::<GuestContext>(), 400);
const_assert_eq!(size_of::<GuestContext>() % 16, 0);

impl GuestContext {
    /// `edx:eax` as used by `rdmsr`/`wrmsr`.
    pub fn msr_value(&self) -> u64 {
        (self.rdx as u32 as u64) << 32 | self.rax as u32 as u64
    }

    pub fn set_msr_value(&mut self, value: u64) {
        self.rax = value as u32 as u64;
        self.rdx = value >> 32;
    }
}

/// Access rights bit marking a segment register as unusable.
pub const SEGMENT_UNUSABLE: u32 = 1 << 16;

const DESCRIPTOR_S: u64 = 1 << 44;
const DESCRIPTOR_G: u64 = 1 << 55;
const TSS_AVAILABLE: u32 = 0x9;
const TSS_BUSY: u32 = 0xB;

/// Hidden part of a segment register in the layout the VMCS expects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentState {
    pub fn unusable(selector: u16) -> Self {
        Self {
            selector,
            base: 0,
            limit: 0,
            access_rights: SEGMENT_UNUSABLE,
        }
    }

    /// Decodes the descriptor referenced by `selector` from `gdt`.
    ///
    /// Null selectors, LDT selectors and selectors past the end of the table
    /// are reported as unusable. System descriptors take their upper base bits
    /// from the following slot and an available TSS is reported as busy, as
    /// VM-entry requires.
    pub fn from_gdt(gdt: &[u64], selector: u16) -> Self {
        let index = (selector >> 3) as usize;
        let table_indicator = selector & 0b100;
        if index == 0 || table_indicator != 0 || index >= gdt.len() {
            return Self::unusable(selector);
        }

        let entry = gdt[index];

        let mut base = ((entry >> 16) & 0xFF_FFFF) | ((entry >> 56) & 0xFF) << 24;
        if entry & DESCRIPTOR_S == 0 {
            if let Some(high) = gdt.get(index + 1) {
                base |= (high & 0xFFFF_FFFF) << 32;
            }
        }

        let mut limit = (entry & 0xFFFF) | ((entry >> 32) & 0xF_0000);
        if entry & DESCRIPTOR_G != 0 {
            limit = (limit << 12) | 0xFFF;
        }

        let mut access_rights = ((entry >> 40) & 0xF0FF) as u32;
        if entry & DESCRIPTOR_S == 0 && access_rights & 0xF == TSS_AVAILABLE {
            access_rights = (access_rights & !0xF) | TSS_BUSY;
        }

        Self {
            selector,
            base,
            limit: limit as u32,
            access_rights,
        }
    }
}

/// Register state of the running processor, captured right before the first
/// VM-entry and used as the initial guest state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub dr7: u64,
    pub rflags: u64,
    pub debugctl: u64,
    pub efer: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub gdtr_base: u64,
    pub gdtr_limit: u16,
    pub idtr_base: u64,
    pub idtr_limit: u16,
    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ldtr: SegmentState,
    pub tr: SegmentState,
}
