use crate::{
    error::{HypervisorError, VmxFailure},
    vmx::{
        guest::GuestContext,
        hw::{ExitAccess, Intel, VmcsAccess},
        vcpu::Vcpu,
        VmExitType,
    },
};
use alloc::vec::Vec;
use bitfield::bitfield;
use core::ptr::NonNull;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use spin::RwLock;
use x86::{msr::IA32_FEATURE_CONTROL, vmx::vmcs};

pub mod cpuid;
pub mod msr;

pub type VmExitHandler = fn(&mut dyn ExitAccess, &mut GuestContext) -> ExitType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// The instruction was emulated, continue after it.
    IncrementRip,
    /// Resume at the current guest RIP, for example after injecting an event.
    Continue,
}

bitfield! {
    /// See: 25.9.1 Basic VM-Exit Information
    #[derive(Clone, Copy)]
    pub struct ExitReasonField(u32);
    impl Debug;
    u16;

    pub basic_reason, _: 15, 0;
    pub enclave_mode, _: 27;
    pub pending_mtf, _: 28;
    pub from_vmx_root, _: 29;
    pub entry_failure, _: 31;
}

macro_rules! exit_reasons {
    ($($name:ident = $value:literal,)*) => {
        /// Basic exit reasons.
        ///
        /// See: Table C-1. Basic Exit Reasons
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum VmExitReason {
            $($name = $value,)*
        }

        impl VmExitReason {
            pub fn from_u16(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }
        }
    };
}

exit_reasons! {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    ControlRegisterAccess = 28,
    MovDr = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    InvalidGuestState = 33,
    MsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    MachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PageModificationLogFull = 62,
    Xsaves = 63,
    Xrstors = 64,
    Pconfig = 65,
    SppEvent = 66,
    Umwait = 67,
    Tpause = 68,
    Loadiwkey = 69,
}

/// Exit handlers shared by every processor.
///
/// Handlers are registered before any processor is virtualized; exits only
/// take the read lock.
pub struct VmExitHandlers {
    handlers: RwLock<HashMap<VmExitType, VmExitHandler, FnvBuildHasher>>,
}

impl Default for VmExitHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl VmExitHandlers {
    /// A table without any handlers. Every exit is fatal until one is added.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::with_hasher(FnvBuildHasher::default())),
        }
    }

    /// Passthrough for the exits a guest can always cause, plus hiding VMX in
    /// `IA32_FEATURE_CONTROL`.
    pub fn with_defaults() -> Self {
        let handlers = Self::new();

        macro_rules! add_handler {
            ($vmexit_type:expr, $handler:expr) => {
                let _ = handlers.insert($vmexit_type, $handler as VmExitHandler);
            };
        }

        add_handler!(VmExitType::Reason(VmExitReason::Cpuid), cpuid::handle_default);
        add_handler!(VmExitType::Reason(VmExitReason::Rdmsr), msr::handle_rdmsr);
        add_handler!(VmExitType::Reason(VmExitReason::Wrmsr), msr::handle_wrmsr);
        add_handler!(VmExitType::Msr(IA32_FEATURE_CONTROL), msr::handle_feature_control);

        handlers
    }

    /// Returns the handler that was replaced, if any.
    pub fn insert(&self, vmexit_type: VmExitType, handler: VmExitHandler) -> Option<VmExitHandler> {
        self.handlers.write().insert(vmexit_type, handler)
    }

    pub fn get(&self, vmexit_type: &VmExitType) -> Option<VmExitHandler> {
        self.handlers.read().get(vmexit_type).copied()
    }

    pub fn contains(&self, vmexit_type: &VmExitType) -> bool {
        self.handlers.read().contains_key(vmexit_type)
    }

    pub fn keys(&self) -> Vec<VmExitType> {
        self.handlers.read().keys().copied().collect()
    }

    /// Finds the handler for `reason`. Instruction specific keys win over the
    /// plain exit reason.
    ///
    /// ```text
    /// CPUID   Cpuid(leaf)                    -> Reason(Cpuid)
    /// RDMSR   Rdmsr(msr) -> Msr(msr)         -> Reason(Rdmsr)
    /// WRMSR   Wrmsr(msr) -> Msr(msr)         -> Reason(Wrmsr)
    /// ```
    pub fn resolve(&self, reason: VmExitReason, ctx: &GuestContext) -> Option<VmExitHandler> {
        let handlers = self.handlers.read();
        let lookup = |vmexit_type: VmExitType| handlers.get(&vmexit_type).copied();

        let specific = match reason {
            VmExitReason::Cpuid => lookup(VmExitType::Cpuid(ctx.rax as u32)),
            VmExitReason::Rdmsr => {
                let msr = ctx.rcx as u32;
                lookup(VmExitType::Rdmsr(msr)).or_else(|| lookup(VmExitType::Msr(msr)))
            }
            VmExitReason::Wrmsr => {
                let msr = ctx.rcx as u32;
                lookup(VmExitType::Wrmsr(msr)).or_else(|| lookup(VmExitType::Msr(msr)))
            }
            _ => None,
        };

        specific.or_else(|| lookup(VmExitType::Reason(reason)))
    }
}

/// Called by `vmx_exit_trampoline` with the owning processor and the guest
/// registers it saved on the host stack.
pub(crate) unsafe extern "sysv64" fn handle_vm_exit(vcpu: *mut Vcpu<Intel>, ctx: *mut GuestContext) {
    let (Some(vcpu), Some(ctx)) = (vcpu.as_mut(), NonNull::new(ctx)) else {
        panic!("VM-exit without an owning processor");
    };

    if let Err(error) = vcpu.handle_exit(ctx) {
        vcpu.abort(error);
    }
}

/// Called by `vmx_exit_trampoline` when `vmresume` falls through.
pub(crate) unsafe extern "sysv64" fn handle_vm_resume_failure(vcpu: *mut Vcpu<Intel>) -> ! {
    let Some(vcpu) = vcpu.as_mut() else {
        panic!("vmresume failed without an owning processor");
    };

    let failure = match vcpu.hw().vmread(vmcs::ro::VM_INSTRUCTION_ERROR) {
        Ok(error) => VmxFailure::Valid(error as u32),
        Err(failure) => failure,
    };

    vcpu.abort(HypervisorError::VmxInstruction {
        instruction: "vmresume",
        failure,
    })
}
