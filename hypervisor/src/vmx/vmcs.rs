//! VMXON and VMCS regions and the code that programs the current VMCS.

use crate::{
    config::HypervisorConfig,
    error::{Result, VmcsReadSnafu, VmcsWriteSnafu, VmxInstructionSnafu},
    vmx::{
        capability::CachedVcpuData,
        guest::{ProcessorState, SegmentState},
        hw::Hardware,
        rollback::{Rollback, RollbackAction},
        support::CR4_VMXE,
    },
};
use core::mem::size_of;
use x86::{
    bits64::paging::BASE_PAGE_SIZE,
    msr,
    vmx::vmcs::{
        self,
        control::{EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls},
    },
};

/// See: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    pub data: [u8; BASE_PAGE_SIZE - 4],
}
const_assert_eq!(size_of::<Vmxon>(), BASE_PAGE_SIZE);

/// See: 25.2 FORMAT OF THE VMCS REGION
#[repr(C, align(4096))]
pub struct Vmcs {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub data: [u8; BASE_PAGE_SIZE - 8],
}
const_assert_eq!(size_of::<Vmcs>(), BASE_PAGE_SIZE);

/// VMX control groups whose allowed settings are reported by a capability MSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmExit,
    VmEntry,
}

impl VmxControl {
    /// Capability MSR to consult. There is no TRUE variant for the secondary
    /// processor-based controls.
    ///
    /// See: A.3.1 Pin-Based VM-Execution Controls
    pub fn capability_msr(self, true_controls: bool) -> u32 {
        match (self, true_controls) {
            (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
            (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
            (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
            (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
            (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
            (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
            (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
            (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
        }
    }
}

/// Forces the bits of `requested` that the capability MSR fixes.
///
/// ```text
///        Allowed 0 (low)  Allowed 1 (high)  Meaning
/// Bit X  1                1                 The bit X is flexible
/// Bit X  1                0                 The bit X is fixed to 0
/// Bit X  0                1                 The bit X is fixed to 1
/// ```
pub fn adjust_to_capability(requested: u32, capability: u64) -> u32 {
    let allowed0 = capability as u32;
    let allowed1 = (capability >> 32) as u32;

    (requested | allowed0) & allowed1
}

/// Host state that does not come from the running processor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub cr3: u64,
    /// Owning vCPU, found again by the host interrupt handler.
    pub gs_base: u64,
    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub rsp: u64,
    pub rip: u64,
}

/// Handle to the VMCS that is current on this processor.
///
/// [`CurrentVmcs::load`] is the only constructor, so every field write is
/// preceded by `vmclear` and `vmptrld`.
pub struct CurrentVmcs<'a, H: Hardware + ?Sized> {
    hw: &'a mut H,
    pa: u64,
}

impl<'a, H: Hardware + ?Sized> CurrentVmcs<'a, H> {
    /// Stamps the revision identifier and makes `vmcs` current.
    pub fn load(
        hw: &'a mut H, vmcs: &mut Vmcs, cached: &CachedVcpuData, rollback: &mut Rollback,
    ) -> Result<Self> {
        vmcs.revision_id = cached.revision_id();
        vmcs.abort_indicator = 0;

        let pa = hw.physical_address(vmcs as *mut Vmcs as u64);
        log::trace!("vmcs region pa: {:#x}", pa);

        hw.vmclear(pa).map_err(|failure| {
            VmxInstructionSnafu {
                instruction: "vmclear",
                failure,
            }
            .build()
        })?;
        hw.vmptrld(pa).map_err(|failure| {
            VmxInstructionSnafu {
                instruction: "vmptrld",
                failure,
            }
            .build()
        })?;
        rollback.push(RollbackAction::ClearVmcs(pa));

        Ok(Self { hw, pa })
    }

    pub fn pa(&self) -> u64 {
        self.pa
    }

    pub fn write(&mut self, field: u32, value: u64) -> Result<()> {
        self.hw
            .vmwrite(field, value)
            .map_err(|failure| VmcsWriteSnafu { field, failure }.build())
    }

    pub fn read(&self, field: u32) -> Result<u64> {
        self.hw
            .vmread(field)
            .map_err(|failure| VmcsReadSnafu { field, failure }.build())
    }

    fn adjust_vmx_control(&self, control: VmxControl, requested: u32, cached: &CachedVcpuData) -> u64 {
        let capability = self.hw.rdmsr(control.capability_msr(cached.true_controls()));
        let effective = adjust_to_capability(requested, capability);

        if effective & requested != requested {
            log::warn!(
                "{:?} controls {:#x} were reduced to {:#x}",
                control,
                requested,
                effective
            );
        }

        effective as u64
    }

    /// Execution, exit and entry controls.
    ///
    /// See: 25.6 VM-EXECUTION CONTROL FIELDS
    pub fn write_ctrl_fields(
        &mut self, config: &HypervisorConfig, cached: &CachedVcpuData, msr_bitmap_pa: u64,
        eptp: Option<u64>,
    ) -> Result<()> {
        log::trace!("Writing control fields");

        // Guest NMIs exit and are re-injected through NMI-window exits, the
        // same way as NMIs the host takes in root operation.
        let pin = PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS;
        let primary = PrimaryControls::USE_MSR_BITMAPS | PrimaryControls::SECONDARY_CONTROLS;

        let mut secondary = SecondaryControls::ENABLE_RDTSCP
            | SecondaryControls::ENABLE_INVPCID
            | SecondaryControls::ENABLE_XSAVES_XRSTORS
            | SecondaryControls::ENABLE_VPID;
        if eptp.is_some() {
            secondary |= SecondaryControls::ENABLE_EPT;
        }

        let exit = ExitControls::HOST_ADDRESS_SPACE_SIZE | ExitControls::SAVE_DEBUG_CONTROLS;
        let entry = EntryControls::IA32E_MODE_GUEST | EntryControls::LOAD_DEBUG_CONTROLS;

        let values = [
            (vmcs::control::PINBASED_EXEC_CONTROLS, self.adjust_vmx_control(VmxControl::PinBased, pin.bits(), cached)),
            (
                vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
                self.adjust_vmx_control(VmxControl::ProcessorBased, primary.bits(), cached),
            ),
            (
                vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
                self.adjust_vmx_control(VmxControl::ProcessorBased2, secondary.bits(), cached),
            ),
            (vmcs::control::VMEXIT_CONTROLS, self.adjust_vmx_control(VmxControl::VmExit, exit.bits(), cached)),
            (vmcs::control::VMENTRY_CONTROLS, self.adjust_vmx_control(VmxControl::VmEntry, entry.bits(), cached)),
        ];
        for (field, value) in values {
            self.write(field, value)?;
        }

        self.write(vmcs::control::EXCEPTION_BITMAP, 0)?;

        // Bits the guest may not change on its own: everything fixed by VMX,
        // and VMXE which the guest must not see.
        let cr0_mask = cached.vmx_cr0_fixed0 | !cached.vmx_cr0_fixed1;
        let cr4_mask = cached.vmx_cr4_fixed0 | !cached.vmx_cr4_fixed1 | CR4_VMXE;
        self.write(vmcs::control::CR0_GUEST_HOST_MASK, cr0_mask)?;
        self.write(vmcs::control::CR4_GUEST_HOST_MASK, cr4_mask)?;

        let cr0 = self.hw.cr0();
        let cr4 = self.hw.cr4();
        self.write(vmcs::control::CR0_READ_SHADOW, cr0)?;
        self.write(vmcs::control::CR4_READ_SHADOW, cr4 & !CR4_VMXE)?;

        self.write(vmcs::control::MSR_BITMAPS_ADDR_FULL, msr_bitmap_pa)?;
        self.write(vmcs::control::VPID, config.guest_vpid as u64)?;
        if let Some(eptp) = eptp {
            self.write(vmcs::control::EPTP_FULL, eptp)?;
        }
        self.write(vmcs::control::TSC_OFFSET_FULL, 0)?;

        Ok(())
    }

    /// State loaded on every VM-exit.
    ///
    /// See: 25.5 HOST-STATE AREA
    pub fn write_host_fields(&mut self, config: &HypervisorConfig, host: &HostState) -> Result<()> {
        log::trace!("Writing host fields");

        self.write(vmcs::host::ES_SELECTOR, 0)?;
        self.write(vmcs::host::CS_SELECTOR, config.host_cs_selector.bits() as u64)?;
        self.write(vmcs::host::SS_SELECTOR, 0)?;
        self.write(vmcs::host::DS_SELECTOR, 0)?;
        self.write(vmcs::host::FS_SELECTOR, 0)?;
        self.write(vmcs::host::GS_SELECTOR, 0)?;
        self.write(vmcs::host::TR_SELECTOR, config.host_tr_selector.bits() as u64)?;

        let cr0 = self.hw.cr0();
        let cr4 = self.hw.cr4();
        self.write(vmcs::host::CR0, cr0)?;
        self.write(vmcs::host::CR3, host.cr3)?;
        self.write(vmcs::host::CR4, cr4)?;

        let fs_base = self.hw.rdmsr(msr::IA32_FS_BASE);
        self.write(vmcs::host::FS_BASE, fs_base)?;
        self.write(vmcs::host::GS_BASE, host.gs_base)?;
        self.write(vmcs::host::TR_BASE, host.tr_base)?;
        self.write(vmcs::host::GDTR_BASE, host.gdtr_base)?;
        self.write(vmcs::host::IDTR_BASE, host.idtr_base)?;

        let sysenter_cs = self.hw.rdmsr(msr::IA32_SYSENTER_CS);
        let sysenter_esp = self.hw.rdmsr(msr::IA32_SYSENTER_ESP);
        let sysenter_eip = self.hw.rdmsr(msr::IA32_SYSENTER_EIP);
        self.write(vmcs::host::IA32_SYSENTER_CS, sysenter_cs)?;
        self.write(vmcs::host::IA32_SYSENTER_ESP, sysenter_esp)?;
        self.write(vmcs::host::IA32_SYSENTER_EIP, sysenter_eip)?;

        self.write(vmcs::host::RSP, host.rsp)?;
        self.write(vmcs::host::RIP, host.rip)?;

        Ok(())
    }

    /// The guest continues with the state of the processor that virtualized
    /// itself. RSP and RIP are written by `vmx_launch_guest`.
    ///
    /// See: 25.4 GUEST-STATE AREA
    pub fn write_guest_fields(&mut self, state: &ProcessorState) -> Result<()> {
        log::trace!("Writing guest fields");

        self.write(vmcs::guest::CR0, state.cr0)?;
        self.write(vmcs::guest::CR3, state.cr3)?;
        self.write(vmcs::guest::CR4, state.cr4)?;
        self.write(vmcs::guest::DR7, state.dr7)?;
        self.write(vmcs::guest::RFLAGS, state.rflags)?;
        self.write(vmcs::guest::IA32_DEBUGCTL_FULL, state.debugctl)?;

        self.write(vmcs::guest::IA32_SYSENTER_CS, state.sysenter_cs)?;
        self.write(vmcs::guest::IA32_SYSENTER_ESP, state.sysenter_esp)?;
        self.write(vmcs::guest::IA32_SYSENTER_EIP, state.sysenter_eip)?;

        self.write_segment(
            [vmcs::guest::ES_SELECTOR, vmcs::guest::ES_BASE, vmcs::guest::ES_LIMIT, vmcs::guest::ES_ACCESS_RIGHTS],
            &state.es,
        )?;
        self.write_segment(
            [vmcs::guest::CS_SELECTOR, vmcs::guest::CS_BASE, vmcs::guest::CS_LIMIT, vmcs::guest::CS_ACCESS_RIGHTS],
            &state.cs,
        )?;
        self.write_segment(
            [vmcs::guest::SS_SELECTOR, vmcs::guest::SS_BASE, vmcs::guest::SS_LIMIT, vmcs::guest::SS_ACCESS_RIGHTS],
            &state.ss,
        )?;
        self.write_segment(
            [vmcs::guest::DS_SELECTOR, vmcs::guest::DS_BASE, vmcs::guest::DS_LIMIT, vmcs::guest::DS_ACCESS_RIGHTS],
            &state.ds,
        )?;
        self.write_segment(
            [vmcs::guest::FS_SELECTOR, vmcs::guest::FS_BASE, vmcs::guest::FS_LIMIT, vmcs::guest::FS_ACCESS_RIGHTS],
            &state.fs,
        )?;
        self.write_segment(
            [vmcs::guest::GS_SELECTOR, vmcs::guest::GS_BASE, vmcs::guest::GS_LIMIT, vmcs::guest::GS_ACCESS_RIGHTS],
            &state.gs,
        )?;
        self.write_segment(
            [
                vmcs::guest::LDTR_SELECTOR,
                vmcs::guest::LDTR_BASE,
                vmcs::guest::LDTR_LIMIT,
                vmcs::guest::LDTR_ACCESS_RIGHTS,
            ],
            &state.ldtr,
        )?;
        self.write_segment(
            [vmcs::guest::TR_SELECTOR, vmcs::guest::TR_BASE, vmcs::guest::TR_LIMIT, vmcs::guest::TR_ACCESS_RIGHTS],
            &state.tr,
        )?;

        // The MSRs win over the descriptor bases in 64-bit mode.
        self.write(vmcs::guest::FS_BASE, state.fs_base)?;
        self.write(vmcs::guest::GS_BASE, state.gs_base)?;

        self.write(vmcs::guest::GDTR_BASE, state.gdtr_base)?;
        self.write(vmcs::guest::GDTR_LIMIT, state.gdtr_limit as u64)?;
        self.write(vmcs::guest::IDTR_BASE, state.idtr_base)?;
        self.write(vmcs::guest::IDTR_LIMIT, state.idtr_limit as u64)?;

        self.write(vmcs::guest::LINK_PTR_FULL, u64::MAX)?;
        self.write(vmcs::guest::ACTIVITY_STATE, 0)?;
        self.write(vmcs::guest::INTERRUPTIBILITY_STATE, 0)?;

        Ok(())
    }

    /// `fields` is selector, base, limit and access rights, in that order.
    fn write_segment(&mut self, fields: [u32; 4], segment: &SegmentState) -> Result<()> {
        let [selector, base, limit, access_rights] = fields;

        self.write(selector, segment.selector as u64)?;
        self.write(base, segment.base)?;
        self.write(limit, segment.limit as u64)?;
        self.write(access_rights, segment.access_rights as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{HypervisorError, VmxFailure},
        utils::alloc::zeroed_box,
        vmx::{guest::SEGMENT_UNUSABLE, mock::MockHardware},
    };
    use alloc::boxed::Box;

    fn entered() -> (MockHardware, CachedVcpuData, Box<Vmcs>) {
        let mut hw = MockHardware::capable();
        hw.vmxon(0x1000).unwrap();
        let cached = CachedVcpuData::capture(&hw);
        let vmcs = unsafe { zeroed_box::<Vmcs>() }.unwrap();

        (hw, cached, vmcs)
    }

    #[test]
    fn adjusts_against_capability() {
        // bit 0 fixed to 1, bit 1 fixed to 0, bit 2 flexible
        let capability = 0x0000_0005_0000_0001;

        assert_eq!(adjust_to_capability(0b110, capability), 0b101);
        assert_eq!(adjust_to_capability(0, capability), 0b001);
    }

    #[test]
    fn selects_true_capability_msrs() {
        assert_eq!(
            VmxControl::PinBased.capability_msr(true),
            msr::IA32_VMX_TRUE_PINBASED_CTLS
        );
        assert_eq!(
            VmxControl::VmEntry.capability_msr(false),
            msr::IA32_VMX_ENTRY_CTLS
        );
        assert_eq!(
            VmxControl::ProcessorBased2.capability_msr(true),
            msr::IA32_VMX_PROCBASED_CTLS2
        );
    }

    #[test]
    fn load_makes_vmcs_current() {
        let (mut hw, cached, mut vmcs) = entered();
        let mut rollback = Rollback::new();
        let expected = vmcs.as_ref() as *const Vmcs as u64;

        let current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();
        assert_eq!(current.pa(), expected);

        assert_eq!(vmcs.revision_id, 0x12);
        assert_eq!(hw.current_vmcs, Some(expected));
        assert_eq!(hw.cleared, Some(expected));
        assert_eq!(rollback.actions(), &[RollbackAction::ClearVmcs(expected)]);
    }

    #[test]
    fn load_outside_vmx_operation_fails() {
        let mut hw = MockHardware::capable();
        let cached = CachedVcpuData::capture(&hw);
        let mut vmcs = unsafe { zeroed_box::<Vmcs>() }.unwrap();
        let mut rollback = Rollback::new();

        let result = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback);

        assert!(matches!(
            result,
            Err(HypervisorError::VmxInstruction {
                instruction: "vmclear",
                failure: VmxFailure::Invalid
            })
        ));
        assert!(rollback.is_empty());
    }

    #[test]
    fn failed_vmptrld_is_reported() {
        let (mut hw, cached, mut vmcs) = entered();
        hw.fail_vmptrld = true;
        let mut rollback = Rollback::new();

        let result = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback);

        assert!(matches!(
            result,
            Err(HypervisorError::VmxInstruction {
                instruction: "vmptrld",
                ..
            })
        ));
        assert!(rollback.is_empty());
    }

    #[test]
    fn control_fields() {
        let (mut hw, cached, mut vmcs) = entered();
        let config = HypervisorConfig::default();
        let mut rollback = Rollback::new();

        let mut current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();
        current
            .write_ctrl_fields(&config, &cached, 0x5000, None)
            .unwrap();
        drop(current);

        let primary = hw.field(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS).unwrap() as u32;
        assert_ne!(primary & PrimaryControls::USE_MSR_BITMAPS.bits(), 0);
        assert_ne!(primary & PrimaryControls::SECONDARY_CONTROLS.bits(), 0);
        // Required by the capability MSR even though nobody asked for it.
        assert_eq!(primary & 0x0400_6172, 0x0400_6172);

        let secondary = hw.field(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS).unwrap() as u32;
        assert_ne!(secondary & SecondaryControls::ENABLE_VPID.bits(), 0);
        assert_eq!(secondary & SecondaryControls::ENABLE_EPT.bits(), 0);
        assert_eq!(hw.field(vmcs::control::EPTP_FULL), None);

        assert_eq!(hw.field(vmcs::control::PINBASED_EXEC_CONTROLS), Some(0x3E));
        assert_eq!(primary & PrimaryControls::NMI_WINDOW_EXITING.bits(), 0);
        assert_eq!(hw.field(vmcs::control::VMEXIT_CONTROLS), Some(0x36FFF));
        assert_eq!(hw.field(vmcs::control::VMENTRY_CONTROLS), Some(0x13FF));
        assert_eq!(hw.field(vmcs::control::MSR_BITMAPS_ADDR_FULL), Some(0x5000));
        assert_eq!(hw.field(vmcs::control::VPID), Some(1));
        assert_eq!(hw.field(vmcs::control::EXCEPTION_BITMAP), Some(0));

        let cr4_mask = hw.field(vmcs::control::CR4_GUEST_HOST_MASK).unwrap();
        assert_ne!(cr4_mask & CR4_VMXE, 0);
        let shadow = hw.field(vmcs::control::CR4_READ_SHADOW).unwrap();
        assert_eq!(shadow & CR4_VMXE, 0);
    }

    #[test]
    fn eptp_enables_ept() {
        let (mut hw, cached, mut vmcs) = entered();
        let config = HypervisorConfig::default();
        let mut rollback = Rollback::new();

        let mut current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();
        current
            .write_ctrl_fields(&config, &cached, 0x5000, Some(0x7_001E))
            .unwrap();
        drop(current);

        let secondary = hw.field(vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS).unwrap() as u32;
        assert_ne!(secondary & SecondaryControls::ENABLE_EPT.bits(), 0);
        assert_eq!(hw.field(vmcs::control::EPTP_FULL), Some(0x7_001E));
    }

    #[test]
    fn host_fields() {
        let (mut hw, cached, mut vmcs) = entered();
        let config = HypervisorConfig::default();
        let mut rollback = Rollback::new();
        let host = HostState {
            cr3: 0x4_2000,
            gs_base: 0xFFFF_A000_0000_0000,
            tr_base: 0xFFFF_A000_0000_1000,
            gdtr_base: 0xFFFF_A000_0000_2000,
            idtr_base: 0xFFFF_A000_0000_3000,
            rsp: 0xFFFF_A000_0000_9FF0,
            rip: 0xFFFF_8000_0010_0000,
        };

        let mut current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();
        current.write_host_fields(&config, &host).unwrap();
        drop(current);

        assert_eq!(hw.field(vmcs::host::CS_SELECTOR), Some(0x8));
        assert_eq!(hw.field(vmcs::host::TR_SELECTOR), Some(0x10));
        assert_eq!(hw.field(vmcs::host::SS_SELECTOR), Some(0));
        assert_eq!(hw.field(vmcs::host::CR3), Some(0x4_2000));
        assert_eq!(hw.field(vmcs::host::GS_BASE), Some(host.gs_base));
        assert_eq!(hw.field(vmcs::host::TR_BASE), Some(host.tr_base));
        assert_eq!(hw.field(vmcs::host::GDTR_BASE), Some(host.gdtr_base));
        assert_eq!(hw.field(vmcs::host::IDTR_BASE), Some(host.idtr_base));
        assert_eq!(hw.field(vmcs::host::RSP), Some(host.rsp));
        assert_eq!(hw.field(vmcs::host::RIP), Some(host.rip));
    }

    #[test]
    fn guest_fields() {
        let (mut hw, cached, mut vmcs) = entered();
        let state = hw.processor_state();
        let mut rollback = Rollback::new();

        let mut current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();
        current.write_guest_fields(&state).unwrap();
        drop(current);

        assert_eq!(hw.field(vmcs::guest::LINK_PTR_FULL), Some(u64::MAX));
        assert_eq!(hw.field(vmcs::guest::CS_SELECTOR), Some(0x10));
        assert_eq!(hw.field(vmcs::guest::CS_ACCESS_RIGHTS), Some(0xA09B));
        assert_eq!(
            hw.field(vmcs::guest::LDTR_ACCESS_RIGHTS),
            Some(SEGMENT_UNUSABLE as u64)
        );
        assert_eq!(hw.field(vmcs::guest::TR_ACCESS_RIGHTS), Some(0x8B));
        assert_eq!(hw.field(vmcs::guest::GDTR_LIMIT), Some(0x57));
        assert_eq!(hw.field(vmcs::guest::ACTIVITY_STATE), Some(0));
        assert_eq!(hw.field(vmcs::guest::RIP), None);
    }

    #[test]
    fn write_failure_names_the_field() {
        let (mut hw, cached, mut vmcs) = entered();
        hw.fail_write = Some(vmcs::guest::LINK_PTR_FULL);
        let state = hw.processor_state();
        let mut rollback = Rollback::new();

        let mut current = CurrentVmcs::load(&mut hw, &mut vmcs, &cached, &mut rollback).unwrap();

        assert_eq!(
            current.write_guest_fields(&state),
            Err(HypervisorError::VmcsWrite {
                field: vmcs::guest::LINK_PTR_FULL,
                failure: VmxFailure::Valid(12)
            })
        );
    }
}
