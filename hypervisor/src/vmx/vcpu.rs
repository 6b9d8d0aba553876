use crate::{
    config::HypervisorConfig,
    error::{
        HypervisorError, Result, UnexpectedHostExceptionSnafu, UnhandledExitSnafu,
        UnknownExitReasonSnafu, VmEntryFailureSnafu,
    },
    utils::{addresses::PhysicalMemoryMap, alloc::zeroed_box},
    vmx::{
        capability::CachedVcpuData,
        descriptors::{self, HostGdt, HostIdt, HostStack, HostTss},
        events::InterruptionInfo,
        guest::GuestContext,
        hw::{Hardware, Intel},
        interrupts::{HostException, TrapFrame, NMI_VECTOR},
        msr_bitmap::MsrBitmap,
        rollback::Rollback,
        support,
        vmcs::{CurrentVmcs, HostState, Vmcs, Vmxon},
        vmexit::{ExitReasonField, ExitType, VmExitHandlers, VmExitReason},
        ExternalStructures,
    },
};
use alloc::{boxed::Box, sync::Arc};
use core::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicU32, Ordering},
};
use snafu::{ensure, OptionExt};
use x86::vmx::vmcs::{self, control::PrimaryControls};

/// Every page the processor references while it is virtualized.
#[repr(C, align(4096))]
pub struct VcpuRegions {
    pub vmxon: Vmxon,
    pub vmcs: Vmcs,
    pub msr_bitmap: MsrBitmap,
    pub host_tss: HostTss,
    pub host_stack: HostStack,
    pub host_idt: HostIdt,
    pub host_gdt: HostGdt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Uninitialized,
    VmxRoot,
    VmcsConfigured,
    GuestRunning,
    HandlingExit,
    Failed,
}

/// Cost of a guest to host round trip, in TSC ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransitionLatency {
    pub min: u64,
    pub max: u64,
    pub mean: u64,
    /// Cost of two back to back `rdtsc`, already subtracted from the samples.
    pub overhead: u64,
}

impl TransitionLatency {
    /// Whether the samples stay within `max_spread_percent` of the minimum.
    pub fn is_stable(&self, max_spread_percent: u64) -> bool {
        (self.max - self.min).saturating_mul(100) <= self.min.saturating_mul(max_spread_percent)
    }
}

/// Measures how long an exit takes by timing `cpuid`, which always exits.
pub fn measure_transition_latency<H: Hardware + ?Sized>(hw: &H, samples: usize) -> TransitionLatency {
    let samples = samples.max(1);

    let mut overhead = u64::MAX;
    for _ in 0..samples {
        let start = hw.rdtsc();
        let end = hw.rdtsc();
        overhead = overhead.min(end.saturating_sub(start));
    }

    let (mut min, mut max, mut total) = (u64::MAX, 0, 0u64);
    for _ in 0..samples {
        let start = hw.rdtsc();
        hw.cpuid(0, 0);
        let end = hw.rdtsc();

        let sample = end.saturating_sub(start).saturating_sub(overhead);
        min = min.min(sample);
        max = max.max(sample);
        total = total.saturating_add(sample);
    }

    TransitionLatency {
        min,
        max,
        mean: total / samples as u64,
        overhead,
    }
}

pub struct Vcpu<H: Hardware = Intel> {
    /// The index of the processor.
    index: u32,
    hw: H,

    config: &'static HypervisorConfig,
    handlers: Arc<VmExitHandlers>,
    external: ExternalStructures,
    physical_memory: PhysicalMemoryMap,

    regions: Box<VcpuRegions>,
    cached: Option<CachedVcpuData>,
    state: VcpuState,

    /// Registers saved by the exit trampoline for the exit being handled.
    guest_ctx: *mut GuestContext,

    vm_exit_tsc_latency: u64,
    latency: Option<TransitionLatency>,

    queued_nmis: AtomicU32,
    fault_recovery: Option<u64>,
    last_host_exception: Option<HostException>,
}

impl<H: Hardware> Vcpu<H> {
    pub fn new(
        index: u32, hw: H, config: &'static HypervisorConfig, handlers: Arc<VmExitHandlers>,
        external: ExternalStructures,
    ) -> Result<Box<Self>> {
        log::trace!("Creating processor {}", index);

        let regions = unsafe { zeroed_box::<VcpuRegions>() }?;

        Ok(Box::new(Self {
            index,
            hw,
            config,
            handlers,
            external,
            physical_memory: PhysicalMemoryMap::new(config),
            regions,
            cached: None,
            state: VcpuState::Uninitialized,
            guest_ctx: ptr::null_mut(),
            vm_exit_tsc_latency: 0,
            latency: None,
            queued_nmis: AtomicU32::new(0),
            fault_recovery: None,
            last_host_exception: None,
        }))
    }

    /// Moves this processor into a guest that continues right here.
    ///
    /// Returns `true` when running as the guest. On failure every hardware
    /// change is reverted and `false` is returned.
    pub fn virtualize(&mut self) -> bool {
        log::info!("Virtualizing processor {}", self.index);

        let mut rollback = Rollback::new();
        if let Err(error) = self.prepare(&mut rollback) {
            log::error!("Failed to prepare processor {}: {}", self.index, error);
            rollback.revert(&mut self.hw);
            self.state = VcpuState::Failed;
            return false;
        }

        log::info!("Launching guest on processor {}", self.index);
        if !self.hw.launch() {
            let error = self.hw.vmread(vmcs::ro::VM_INSTRUCTION_ERROR).unwrap_or(0);
            log::error!("vmlaunch failed on processor {} with error {}", self.index, error);
            rollback.revert(&mut self.hw);
            self.state = VcpuState::Failed;
            return false;
        }

        // Guest from here on.
        rollback.commit();
        self.state = VcpuState::GuestRunning;
        self.measure_tsc_latency();

        true
    }

    fn prepare(&mut self, rollback: &mut Rollback) -> Result<()> {
        let cached = self.cache_vcpu_data();

        support::enable_vmx_operation(&mut self.hw, &cached, rollback)?;
        support::enter_vmx_operation(&mut self.hw, &mut self.regions.vmxon, &cached, rollback)?;
        self.state = VcpuState::VmxRoot;

        self.prepare_external_structures();

        let msr_bitmap_pa = self
            .hw
            .physical_address(&self.regions.msr_bitmap as *const MsrBitmap as u64);
        let host = self.host_state();
        let guest = self.hw.processor_state();
        let config = self.config;
        let eptp = self.external.eptp;

        let mut vmcs = CurrentVmcs::load(&mut self.hw, &mut self.regions.vmcs, &cached, rollback)?;
        vmcs.write_ctrl_fields(config, &cached, msr_bitmap_pa, eptp)?;
        vmcs.write_host_fields(config, &host)?;
        vmcs.write_guest_fields(&guest)?;
        self.state = VcpuState::VmcsConfigured;

        Ok(())
    }

    fn cache_vcpu_data(&mut self) -> CachedVcpuData {
        *self
            .cached
            .get_or_insert_with(|| CachedVcpuData::capture(&self.hw))
    }

    /// Host stack owner slot, host TSS, GDT and IDT.
    fn prepare_external_structures(&mut self) {
        let owner = self as *mut Self as u64;
        let config = self.config;
        let hw = &self.hw;
        let regions = &mut *self.regions;

        regions.host_stack.set_owner(owner);
        regions.host_tss.prepare(regions.host_stack.top());
        descriptors::build_gdt(&mut regions.host_gdt, config, &regions.host_tss);
        descriptors::build_idt(&mut regions.host_idt, config.host_cs_selector, |vector| {
            hw.host_isr_address(vector)
        });
    }

    fn host_state(&self) -> HostState {
        HostState {
            cr3: self.external.host_cr3,
            gs_base: self as *const Self as u64,
            tr_base: self.regions.host_tss.base(),
            gdtr_base: self.regions.host_gdt.as_ptr() as u64,
            idtr_base: self.regions.host_idt.as_ptr() as u64,
            rsp: self.regions.host_stack.host_rsp(),
            rip: self.hw.exit_trampoline(),
        }
    }

    fn measure_tsc_latency(&mut self) {
        let latency = measure_transition_latency(&self.hw, self.config.tsc_latency_samples);
        if !latency.is_stable(50) {
            log::warn!("Exit latency is unstable: {:?}", latency);
        }
        log::info!("Processor {} exit latency: {} ticks", self.index, latency.min);

        self.vm_exit_tsc_latency = latency.min;
        self.latency = Some(latency);
    }

    /// Dispatches one VM-exit.
    ///
    /// # Safety
    ///
    /// `ctx` must point to the registers saved for this exit and stay valid
    /// until the guest is resumed.
    pub unsafe fn handle_exit(&mut self, mut ctx: NonNull<GuestContext>) -> Result<()> {
        self.guest_ctx = ctx.as_ptr();
        self.state = VcpuState::HandlingExit;

        let field = ExitReasonField(self.read(vmcs::ro::EXIT_REASON)? as u32);
        let basic_reason = field.basic_reason();
        ensure!(
            !field.entry_failure(),
            VmEntryFailureSnafu {
                reason: basic_reason
            }
        );

        let reason = VmExitReason::from_u16(basic_reason).context(UnknownExitReasonSnafu {
            reason: basic_reason,
        })?;

        match reason {
            VmExitReason::ExceptionOrNmi if self.exit_was_nmi()? => {
                self.queued_nmis.fetch_add(1, Ordering::Relaxed);
            }
            VmExitReason::NmiWindow => self.inject_queued_nmi()?,
            _ => self.dispatch(reason, ctx.as_mut())?,
        }

        // Queued NMIs are delivered once the guest can take them.
        let pending = self.queued_nmis.load(Ordering::Relaxed) != 0;
        if pending || reason == VmExitReason::NmiWindow {
            self.set_nmi_window_exiting(pending)?;
        }

        self.state = VcpuState::GuestRunning;
        Ok(())
    }

    fn dispatch(&mut self, reason: VmExitReason, ctx: &mut GuestContext) -> Result<()> {
        let handler = self
            .handlers
            .resolve(reason, ctx)
            .context(UnhandledExitSnafu {
                reason: reason as u16,
            })?;

        match handler(&mut self.hw, ctx) {
            ExitType::IncrementRip => {
                let rip = self.read(vmcs::guest::RIP)?;
                let length = self.read(vmcs::ro::VMEXIT_INSTRUCTION_LEN)?;
                self.write(vmcs::guest::RIP, rip + length)?;
            }
            ExitType::Continue => {}
        }

        Ok(())
    }

    fn exit_was_nmi(&self) -> Result<bool> {
        let info = self.read(vmcs::ro::VMEXIT_INTERRUPTION_INFO)?;

        Ok(InterruptionInfo(info as u32).is_nmi())
    }

    /// Injects one queued NMI. Called on NMI-window exits, where the guest is
    /// able to take it.
    fn inject_queued_nmi(&mut self) -> Result<()> {
        let queued = self.queued_nmis.load(Ordering::Relaxed);
        if queued == 0 {
            return Ok(());
        }

        self.write(
            vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD,
            InterruptionInfo::nmi().0 as u64,
        )?;
        self.queued_nmis.fetch_sub(1, Ordering::Relaxed);

        Ok(())
    }

    fn set_nmi_window_exiting(&mut self, enabled: bool) -> Result<()> {
        let field = vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS;
        let mut controls = PrimaryControls::from_bits_truncate(self.read(field)? as u32);
        if controls.contains(PrimaryControls::NMI_WINDOW_EXITING) == enabled {
            return Ok(());
        }

        controls.set(PrimaryControls::NMI_WINDOW_EXITING, enabled);
        self.write(field, controls.bits() as u64)
    }

    /// Handles an interrupt taken in VMX root operation. Does not look at the
    /// guest registers, there might not be an exit being handled.
    pub fn on_host_interrupt(&mut self, frame: &mut TrapFrame) -> Result<()> {
        if frame.vector == NMI_VECTOR {
            // Delivered to the guest through an NMI-window exit.
            self.queued_nmis.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let fixup = self.hw.fault_fixup(frame.rip);
        let Some(recovery) = fixup.or_else(|| self.fault_recovery.take()) else {
            return UnexpectedHostExceptionSnafu {
                vector: frame.vector,
                error_code: frame.error,
                rip: frame.rip,
            }
            .fail();
        };

        log::debug!(
            "Recovering from host exception {} at {:#x}",
            frame.vector,
            frame.rip
        );
        self.last_host_exception = Some(HostException {
            vector: frame.vector,
            error_code: frame.error,
            rip: frame.rip,
        });
        frame.rip = recovery;

        Ok(())
    }

    /// The next host exception resumes at `rip` instead of being fatal.
    pub fn arm_fault_recovery(&mut self, rip: u64) {
        self.fault_recovery = Some(rip);
    }

    pub fn disarm_fault_recovery(&mut self) {
        self.fault_recovery = None;
    }

    pub fn take_queued_nmis(&self) -> u32 {
        self.queued_nmis.swap(0, Ordering::Relaxed)
    }

    pub fn last_host_exception(&self) -> Option<HostException> {
        self.last_host_exception
    }

    /// Leaves VMX operation and stops. Used when an exit cannot be serviced.
    pub fn abort(&mut self, error: HypervisorError) -> ! {
        log::error!("Processor {} cannot continue: {}", self.index, error);
        self.state = VcpuState::Failed;

        if let Err(failure) = self.hw.vmxoff() {
            log::error!("vmxoff failed: {}", failure);
        }

        panic!("Processor {} stopped: {}", self.index, error)
    }

    pub fn toggle_exiting_for_msr(&mut self, msr: u32, enabled: bool) -> Result<()> {
        self.regions.msr_bitmap.toggle(msr, enabled)
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap {
        &self.regions.msr_bitmap
    }

    pub fn msr_bitmap_mut(&mut self) -> &mut MsrBitmap {
        &mut self.regions.msr_bitmap
    }

    /// Registers of the exit being handled, `None` before the first exit.
    pub fn ctx(&self) -> Option<NonNull<GuestContext>> {
        NonNull::new(self.guest_ctx)
    }

    pub fn cdata(&self) -> Option<&CachedVcpuData> {
        self.cached.as_ref()
    }

    pub fn vm_exit_tsc_latency(&self) -> u64 {
        self.vm_exit_tsc_latency
    }

    pub fn transition_latency(&self) -> Option<TransitionLatency> {
        self.latency
    }

    pub fn host_physical_memory(&self) -> &PhysicalMemoryMap {
        &self.physical_memory
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn regions(&self) -> &VcpuRegions {
        &self.regions
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    fn read(&self, field: u32) -> Result<u64> {
        self.hw
            .vmread(field)
            .map_err(|failure| crate::error::VmcsReadSnafu { field, failure }.build())
    }

    fn write(&mut self, field: u32, value: u64) -> Result<()> {
        self.hw
            .vmwrite(field, value)
            .map_err(|failure| crate::error::VmcsWriteSnafu { field, failure }.build())
    }
}
