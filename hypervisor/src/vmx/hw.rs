//! The seam between the virtualization logic and the processor.
//!
//! Everything that touches privileged state goes through [`Hardware`], so the
//! bootstrap, VMCS programming and exit dispatch can run against
//! a recording double in tests and against [`Intel`] on real hardware.

use crate::{
    error::VmxFailure,
    vmx::{
        guest::{ProcessorState, SegmentState},
        interrupts, vmlaunch,
    },
};
use core::arch::asm;
use x86_64::registers::control::{Cr0, Cr4};
use x86::{
    bits64::{rflags, vmx},
    controlregs,
    cpuid::cpuid,
    debugregs::dr7,
    dtables::{self, DescriptorTablePointer},
    msr::{self, rdmsr, wrmsr},
    segmentation,
    task,
    vmx::{vmcs, VmFail},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Access to the current VMCS. This is all an exit handler gets to see of the
/// hardware.
pub trait VmcsAccess {
    fn vmread(&self, field: u32) -> Result<u64, VmxFailure>;
    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmxFailure>;
}

/// What an exit handler gets to see of the processor: the current VMCS and
/// MSR accesses that report `#GP` instead of faulting the host.
pub trait ExitAccess: VmcsAccess {
    fn read_msr(&mut self, msr: u32) -> Option<u64>;
    fn write_msr(&mut self, msr: u32, value: u64) -> bool;
}

impl<H: Hardware + ?Sized> ExitAccess for H {
    fn read_msr(&mut self, msr: u32) -> Option<u64> {
        self.try_rdmsr(msr)
    }

    fn write_msr(&mut self, msr: u32, value: u64) -> bool {
        self.try_wrmsr(msr, value)
    }
}

pub trait Hardware: VmcsAccess {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;
    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&mut self, msr: u32, value: u64);

    /// `rdmsr` that returns `None` if the access raised `#GP`.
    fn try_rdmsr(&self, msr: u32) -> Option<u64>;
    /// `wrmsr` that returns `false` if the access raised `#GP`.
    fn try_wrmsr(&mut self, msr: u32, value: u64) -> bool;

    /// Where a host exception at `rip` resumes, if `rip` is one of the
    /// checked MSR accesses.
    fn fault_fixup(&self, rip: u64) -> Option<u64>;

    fn cr0(&self) -> u64;
    fn set_cr0(&mut self, value: u64);
    fn cr3(&self) -> u64;
    fn cr4(&self) -> u64;
    fn set_cr4(&mut self, value: u64);

    fn rdtsc(&self) -> u64;

    /// Host physical address backing the host virtual address `va`.
    fn physical_address(&self, va: u64) -> u64;

    fn vmxon(&mut self, pa: u64) -> Result<(), VmxFailure>;
    fn vmxoff(&mut self) -> Result<(), VmxFailure>;
    fn vmclear(&mut self, pa: u64) -> Result<(), VmxFailure>;
    fn vmptrld(&mut self, pa: u64) -> Result<(), VmxFailure>;

    /// Executes `vmlaunch` with the guest continuing right after this call.
    ///
    /// Returns `true` when execution resumes in the guest and `false` if the
    /// launch failed; the processor then is still in VMX root operation.
    fn launch(&mut self) -> bool;

    /// Captures the state the guest starts with.
    fn processor_state(&self) -> ProcessorState;

    /// Address the processor jumps to on every VM-exit.
    fn exit_trampoline(&self) -> u64;

    /// Address of the host interrupt stub for `vector`.
    fn host_isr_address(&self, vector: u8) -> u64;
}

/// The real processor.
pub struct Intel {
    virt_to_phys: fn(u64) -> u64,
}

impl Intel {
    /// # Safety
    ///
    /// Must only be used at CPL 0 on the processor being virtualized.
    /// `virt_to_phys` must translate host virtual addresses of heap memory.
    pub unsafe fn new(virt_to_phys: fn(u64) -> u64) -> Self {
        Self { virt_to_phys }
    }

    /// For hosts that identity map their heap.
    ///
    /// # Safety
    ///
    /// See [`Intel::new`].
    pub unsafe fn identity_mapped() -> Self {
        Self::new(|va| va)
    }

    fn vm_failure(&self, failure: VmFail) -> VmxFailure {
        match failure {
            VmFail::VmFailValid => {
                let error = unsafe { vmx::vmread(vmcs::ro::VM_INSTRUCTION_ERROR) }.unwrap_or(0);
                VmxFailure::Valid(error as u32)
            }
            VmFail::VmFailInvalid => VmxFailure::Invalid,
        }
    }

    fn sldt() -> u16 {
        let ldtr: u16;
        unsafe { asm!("sldt {0:x}", out(reg) ldtr, options(nomem, nostack, preserves_flags)) };
        ldtr
    }
}

impl VmcsAccess for Intel {
    fn vmread(&self, field: u32) -> Result<u64, VmxFailure> {
        unsafe { vmx::vmread(field) }.map_err(|e| self.vm_failure(e))
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmxFailure> {
        unsafe { vmx::vmwrite(field, value) }.map_err(|e| self.vm_failure(e))
    }
}

impl Hardware for Intel {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let result = cpuid!(leaf, subleaf);

        CpuidResult {
            eax: result.eax,
            ebx: result.ebx,
            ecx: result.ecx,
            edx: result.edx,
        }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        unsafe { rdmsr(msr) }
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        unsafe { wrmsr(msr, value) }
    }

    fn try_rdmsr(&self, msr: u32) -> Option<u64> {
        let mut value = 0;
        let succeeded = unsafe { interrupts::vmx_checked_rdmsr(msr, &mut value) } != 0;

        succeeded.then_some(value)
    }

    fn try_wrmsr(&mut self, msr: u32, value: u64) -> bool {
        unsafe { interrupts::vmx_checked_wrmsr(msr, value) != 0 }
    }

    fn fault_fixup(&self, rip: u64) -> Option<u64> {
        interrupts::msr_fault_fixup(rip)
    }

    // Raw accessors, the flag types drop bits they do not know (CET, PKS).
    fn cr0(&self) -> u64 {
        Cr0::read_raw()
    }

    fn set_cr0(&mut self, value: u64) {
        unsafe { Cr0::write_raw(value) }
    }

    fn cr3(&self) -> u64 {
        unsafe { controlregs::cr3() }
    }

    fn cr4(&self) -> u64 {
        Cr4::read_raw()
    }

    fn set_cr4(&mut self, value: u64) {
        unsafe { Cr4::write_raw(value) }
    }

    fn rdtsc(&self) -> u64 {
        unsafe { x86::time::rdtsc() }
    }

    fn physical_address(&self, va: u64) -> u64 {
        (self.virt_to_phys)(va)
    }

    fn vmxon(&mut self, pa: u64) -> Result<(), VmxFailure> {
        unsafe { vmx::vmxon(pa) }.map_err(|e| self.vm_failure(e))
    }

    fn vmxoff(&mut self) -> Result<(), VmxFailure> {
        unsafe { vmx::vmxoff() }.map_err(|e| self.vm_failure(e))
    }

    fn vmclear(&mut self, pa: u64) -> Result<(), VmxFailure> {
        unsafe { vmx::vmclear(pa) }.map_err(|e| self.vm_failure(e))
    }

    fn vmptrld(&mut self, pa: u64) -> Result<(), VmxFailure> {
        unsafe { vmx::vmptrld(pa) }.map_err(|e| self.vm_failure(e))
    }

    fn launch(&mut self) -> bool {
        unsafe { vmlaunch::vmx_launch_guest() != 0 }
    }

    fn processor_state(&self) -> ProcessorState {
        let mut gdtr = DescriptorTablePointer::<u64>::default();
        let mut idtr = DescriptorTablePointer::<u64>::default();
        unsafe {
            dtables::sgdt(&mut gdtr);
            dtables::sidt(&mut idtr);
        }

        let gdt = unsafe {
            core::slice::from_raw_parts(gdtr.base, (gdtr.limit as usize + 1) / 8)
        };
        let segment = |selector: segmentation::SegmentSelector| {
            SegmentState::from_gdt(gdt, selector.bits())
        };

        let mut fs = segment(segmentation::fs());
        let mut gs = segment(segmentation::gs());
        let fs_base = unsafe { rdmsr(msr::IA32_FS_BASE) };
        let gs_base = unsafe { rdmsr(msr::IA32_GS_BASE) };
        fs.base = fs_base;
        gs.base = gs_base;

        ProcessorState {
            cr0: self.cr0(),
            cr3: self.cr3(),
            cr4: self.cr4(),
            dr7: unsafe { dr7() }.0 as u64,
            rflags: rflags::read().bits(),
            debugctl: unsafe { rdmsr(msr::IA32_DEBUGCTL) },
            efer: unsafe { rdmsr(msr::IA32_EFER) },
            sysenter_cs: unsafe { rdmsr(msr::IA32_SYSENTER_CS) },
            sysenter_esp: unsafe { rdmsr(msr::IA32_SYSENTER_ESP) },
            sysenter_eip: unsafe { rdmsr(msr::IA32_SYSENTER_EIP) },
            fs_base,
            gs_base,
            gdtr_base: gdtr.base as u64,
            gdtr_limit: gdtr.limit,
            idtr_base: idtr.base as u64,
            idtr_limit: idtr.limit,
            es: segment(segmentation::es()),
            cs: segment(segmentation::cs()),
            ss: segment(segmentation::ss()),
            ds: segment(segmentation::ds()),
            fs,
            gs,
            ldtr: SegmentState::from_gdt(gdt, Self::sldt()),
            tr: segment(unsafe { task::tr() }),
        }
    }

    fn exit_trampoline(&self) -> u64 {
        vmlaunch::vmx_exit_trampoline as usize as u64
    }

    fn host_isr_address(&self, vector: u8) -> u64 {
        interrupts::host_isr_address(vector)
    }
}
