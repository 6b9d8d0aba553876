//! A recording stand-in for the processor used by the unit tests.

use crate::{
    error::VmxFailure,
    vmx::{
        guest::{ProcessorState, SegmentState},
        hw::{CpuidResult, Hardware, VmcsAccess},
    },
};
use alloc::collections::{BTreeMap, BTreeSet};
use core::cell::Cell;
use x86::{msr, vmx::vmcs};

pub const TRAMPOLINE: u64 = 0xFFFF_8000_0010_0000;
pub const ISR_TABLE: u64 = 0xFFFF_8000_0020_0000;
/// Where the checked MSR access lives, and where it resumes after `#GP`.
pub const MSR_ACCESS_RIP: u64 = 0xFFFF_8000_0030_0004;
pub const MSR_FAULT_LANDING: u64 = 0xFFFF_8000_0030_0040;

/// Cycles `rdtsc` advances by on its own.
pub const TSC_STEP: u64 = 20;
/// Cycles a `cpuid` round trip through the hypervisor costs.
pub const EXIT_LATENCY: u64 = 1_000;
pub const MAX_JITTER: u64 = 30;

pub struct MockHardware {
    pub msrs: BTreeMap<u32, u64>,
    /// MSRs whose checked accesses raise `#GP`.
    pub faulting_msrs: BTreeSet<u32>,
    pub cpuid: BTreeMap<u32, CpuidResult>,
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub fields: BTreeMap<u32, u64>,
    pub writes: usize,
    pub current_vmcs: Option<u64>,
    pub cleared: Option<u64>,
    pub vmxon_region: Option<u64>,

    pub vmxon_calls: usize,
    pub vmxoff_calls: usize,
    pub launch_calls: usize,

    pub fail_vmxon: bool,
    pub fail_vmptrld: bool,
    pub fail_launch: bool,
    pub fail_write: Option<u32>,

    tsc: Cell<u64>,
    cpuid_calls: Cell<u64>,
}

impl MockHardware {
    /// A processor that satisfies every requirement for VMX operation.
    pub fn capable() -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(msr::IA32_FEATURE_CONTROL, 0b101);
        msrs.insert(msr::IA32_VMX_BASIC, 0x12 | 1 << 55);
        msrs.insert(msr::IA32_VMX_CR0_FIXED0, 0x8000_0021);
        msrs.insert(msr::IA32_VMX_CR0_FIXED1, 0xFFFF_FFFF);
        msrs.insert(msr::IA32_VMX_CR4_FIXED0, 0x2000);
        msrs.insert(msr::IA32_VMX_CR4_FIXED1, 0x0037_67FF);
        msrs.insert(msr::IA32_VMX_TRUE_PINBASED_CTLS, 0x0000_007F_0000_0016);
        msrs.insert(msr::IA32_VMX_TRUE_PROCBASED_CTLS, 0xFFF9_FFFE_0400_6172);
        msrs.insert(msr::IA32_VMX_PROCBASED_CTLS2, 0x0053_FFFF_0000_0000);
        msrs.insert(msr::IA32_VMX_TRUE_EXIT_CTLS, 0x01FF_FFFF_0003_6DFB);
        msrs.insert(msr::IA32_VMX_TRUE_ENTRY_CTLS, 0x0003_FFFF_0000_11FB);

        let mut cpuid = BTreeMap::new();
        cpuid.insert(
            1,
            CpuidResult {
                ecx: 1 << 5,
                ..Default::default()
            },
        );
        cpuid.insert(
            0xD,
            CpuidResult {
                eax: 0x2E7,
                ..Default::default()
            },
        );
        cpuid.insert(
            0x8000_0000,
            CpuidResult {
                eax: 0x8000_0008,
                ..Default::default()
            },
        );
        cpuid.insert(
            0x8000_0008,
            CpuidResult {
                eax: 0x3027,
                ..Default::default()
            },
        );

        Self {
            msrs,
            faulting_msrs: BTreeSet::new(),
            cpuid,
            cr0: 0x8005_0033,
            cr3: 0x1AD000,
            cr4: 0x0037_0678,
            fields: BTreeMap::new(),
            writes: 0,
            current_vmcs: None,
            cleared: None,
            vmxon_region: None,
            vmxon_calls: 0,
            vmxoff_calls: 0,
            launch_calls: 0,
            fail_vmxon: false,
            fail_vmptrld: false,
            fail_launch: false,
            fail_write: None,
            tsc: Cell::new(0),
            cpuid_calls: Cell::new(0),
        }
    }

    pub fn set_cpuid(&mut self, leaf: u32, result: CpuidResult) {
        self.cpuid.insert(leaf, result);
    }

    pub fn field(&self, field: u32) -> Option<u64> {
        self.fields.get(&field).copied()
    }

    pub fn in_vmx_operation(&self) -> bool {
        self.vmxon_region.is_some()
    }

    fn fail(&self) -> VmxFailure {
        if self.current_vmcs.is_some() {
            VmxFailure::Valid(7)
        } else {
            VmxFailure::Invalid
        }
    }
}

impl VmcsAccess for MockHardware {
    fn vmread(&self, field: u32) -> Result<u64, VmxFailure> {
        if self.current_vmcs.is_none() {
            return Err(VmxFailure::Invalid);
        }

        Ok(self.fields.get(&field).copied().unwrap_or(0))
    }

    fn vmwrite(&mut self, field: u32, value: u64) -> Result<(), VmxFailure> {
        if self.current_vmcs.is_none() {
            return Err(VmxFailure::Invalid);
        }
        if self.fail_write == Some(field) {
            return Err(VmxFailure::Valid(12));
        }

        self.writes += 1;
        self.fields.insert(field, value);
        Ok(())
    }
}

impl Hardware for MockHardware {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        // Behaves like an intercepted instruction: every call costs one exit.
        let calls = self.cpuid_calls.get();
        self.cpuid_calls.set(calls + 1);
        self.tsc
            .set(self.tsc.get() + EXIT_LATENCY + (calls * 7) % (MAX_JITTER + 1));

        self.cpuid.get(&leaf).copied().unwrap_or_default()
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        self.msrs.get(&msr).copied().unwrap_or(0)
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        self.msrs.insert(msr, value);
    }

    fn try_rdmsr(&self, msr: u32) -> Option<u64> {
        (!self.faulting_msrs.contains(&msr)).then(|| self.rdmsr(msr))
    }

    fn try_wrmsr(&mut self, msr: u32, value: u64) -> bool {
        if self.faulting_msrs.contains(&msr) {
            return false;
        }

        self.wrmsr(msr, value);
        true
    }

    fn fault_fixup(&self, rip: u64) -> Option<u64> {
        (rip == MSR_ACCESS_RIP).then_some(MSR_FAULT_LANDING)
    }

    fn cr0(&self) -> u64 {
        self.cr0
    }

    fn set_cr0(&mut self, value: u64) {
        self.cr0 = value;
    }

    fn cr3(&self) -> u64 {
        self.cr3
    }

    fn cr4(&self) -> u64 {
        self.cr4
    }

    fn set_cr4(&mut self, value: u64) {
        self.cr4 = value;
    }

    fn rdtsc(&self) -> u64 {
        let now = self.tsc.get();
        self.tsc.set(now + TSC_STEP);
        now
    }

    fn physical_address(&self, va: u64) -> u64 {
        va
    }

    fn vmxon(&mut self, pa: u64) -> Result<(), VmxFailure> {
        self.vmxon_calls += 1;
        if self.fail_vmxon || self.in_vmx_operation() {
            return Err(VmxFailure::Invalid);
        }

        self.vmxon_region = Some(pa);
        Ok(())
    }

    fn vmxoff(&mut self) -> Result<(), VmxFailure> {
        self.vmxoff_calls += 1;
        if !self.in_vmx_operation() {
            return Err(VmxFailure::Invalid);
        }

        self.vmxon_region = None;
        self.current_vmcs = None;
        Ok(())
    }

    fn vmclear(&mut self, pa: u64) -> Result<(), VmxFailure> {
        if !self.in_vmx_operation() {
            return Err(self.fail());
        }

        if self.current_vmcs == Some(pa) {
            self.current_vmcs = None;
        }
        self.cleared = Some(pa);
        Ok(())
    }

    fn vmptrld(&mut self, pa: u64) -> Result<(), VmxFailure> {
        if !self.in_vmx_operation() || self.fail_vmptrld {
            return Err(self.fail());
        }

        self.current_vmcs = Some(pa);
        Ok(())
    }

    fn launch(&mut self) -> bool {
        self.launch_calls += 1;
        if self.fail_launch || self.current_vmcs.is_none() {
            self.fields.insert(vmcs::ro::VM_INSTRUCTION_ERROR, 7);
            return false;
        }

        true
    }

    fn processor_state(&self) -> ProcessorState {
        let code = SegmentState {
            selector: 0x10,
            base: 0,
            limit: 0xFFFF_FFFF,
            access_rights: 0xA09B,
        };
        let data = SegmentState {
            selector: 0x18,
            base: 0,
            limit: 0xFFFF_FFFF,
            access_rights: 0xC093,
        };

        ProcessorState {
            cr0: self.cr0,
            cr3: self.cr3,
            cr4: self.cr4,
            dr7: 0x400,
            rflags: 0x2,
            efer: 0xD01,
            gdtr_base: 0xFFFF_F800_0000_0000,
            gdtr_limit: 0x57,
            idtr_base: 0xFFFF_F800_0000_1000,
            idtr_limit: 0xFFF,
            es: data,
            cs: code,
            ss: data,
            ds: data,
            fs: SegmentState::unusable(0),
            gs: SegmentState::unusable(0),
            ldtr: SegmentState::unusable(0),
            tr: SegmentState {
                selector: 0x40,
                base: 0xFFFF_F800_0000_2000,
                limit: 0x67,
                access_rights: 0x8B,
            },
            ..Default::default()
        }
    }

    fn exit_trampoline(&self) -> u64 {
        TRAMPOLINE
    }

    fn host_isr_address(&self, vector: u8) -> u64 {
        ISR_TABLE + 16 * vector.min(32) as u64
    }
}
