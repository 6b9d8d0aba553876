use crate::{
    config::HypervisorConfig,
    error::{HypervisorError, Result},
    vmx::{
        hw::Hardware,
        vcpu::Vcpu,
        vmexit::{VmExitHandler, VmExitHandlers, VmExitReason},
    },
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};

pub mod capability;
pub mod descriptors;
pub mod events;
pub mod guest;
pub mod hw;
pub mod interrupts;
pub mod msr_bitmap;
pub mod rollback;
pub mod support;
pub mod vcpu;
pub mod vmcs;
pub mod vmexit;
pub mod vmlaunch;

#[cfg(test)]
pub mod mock;

#[derive(Hash, Ord, PartialOrd, Eq, PartialEq, Debug, Copy, Clone)]
pub enum VmExitType {
    /// Any exit with this basic reason.
    Reason(VmExitReason),

    /// Cpuid instruction with eax = {0}
    Cpuid(u32),

    /// Rdmsr/Wrmsr with msr = {0}
    Msr(u32),
    Rdmsr(u32),
    Wrmsr(u32),
}

/// Paging structures owned by the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExternalStructures {
    /// Host CR3, must map the direct physical-memory window.
    pub host_cr3: u64,
    /// EPT pointer. EPT stays disabled without one.
    pub eptp: Option<u64>,
}

pub struct HypervisorBuilder {
    config: HypervisorConfig,
    handlers: VmExitHandlers,
    msr_intercepts: Vec<u32>,
}

impl Default for HypervisorBuilder {
    fn default() -> Self {
        Self {
            config: HypervisorConfig::default(),
            handlers: VmExitHandlers::with_defaults(),
            msr_intercepts: Vec::new(),
        }
    }
}

impl HypervisorBuilder {
    /// Adds the specified handler.
    ///
    /// Note: If a handler is already registered for the specified type, it will
    /// be replaced.
    #[must_use]
    pub fn with_handler(self, vmexit_type: VmExitType, handler: VmExitHandler) -> Self {
        if self.handlers.insert(vmexit_type, handler).is_some() {
            log::warn!(
                "Handler for {:?} was overwritten. Was this on purpose?",
                vmexit_type
            );
        }

        self
    }

    /// Adds multiple handlers at once.
    #[must_use]
    pub fn with_handlers<const N: usize>(self, handlers: [(VmExitType, VmExitHandler); N]) -> Self {
        let mut instance = self;

        for (exit_type, handler) in handlers {
            instance = instance.with_handler(exit_type, handler)
        }

        instance
    }

    /// Makes reads and writes of `msr` exit, without registering a handler.
    #[must_use]
    pub fn with_msr_intercept(mut self, msr: u32) -> Self {
        self.msr_intercepts.push(msr);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: HypervisorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Hypervisor> {
        let config = self.config.leak()?;

        Ok(Hypervisor {
            config,
            handlers: Arc::new(self.handlers),
            msr_intercepts: self.msr_intercepts,
        })
    }
}

pub struct Hypervisor {
    config: &'static HypervisorConfig,
    handlers: Arc<VmExitHandlers>,
    msr_intercepts: Vec<u32>,
}

impl Hypervisor {
    pub fn builder() -> HypervisorBuilder {
        HypervisorBuilder::default()
    }

    pub fn config(&self) -> &'static HypervisorConfig {
        self.config
    }

    pub fn handlers(&self) -> &Arc<VmExitHandlers> {
        &self.handlers
    }

    /// Creates the vCPU for processor `index`, with the MSR bitmap set up for
    /// every registered MSR handler and intercept.
    ///
    /// Must be called and virtualized on the processor it is created for.
    pub fn create_vcpu<H: Hardware>(
        &self, index: u32, hw: H, external: ExternalStructures,
    ) -> Result<Box<Vcpu<H>>> {
        let mut vcpu = Vcpu::new(index, hw, self.config, self.handlers.clone(), external)?;

        // Set the msr permissions in the msr bitmap
        //
        for exit_type in self.handlers.keys() {
            let bitmap = vcpu.msr_bitmap_mut();
            let result = match exit_type {
                VmExitType::Msr(msr) => bitmap.toggle(msr, true),
                VmExitType::Rdmsr(msr) => bitmap.toggle_read(msr, true),
                VmExitType::Wrmsr(msr) => bitmap.toggle_write(msr, true),
                _ => Ok(()),
            };

            match result {
                // Accesses outside of the bitmap exit unconditionally.
                Err(HypervisorError::MsrOutOfRange { .. }) | Ok(()) => {}
                Err(error) => return Err(error),
            }
        }

        for &msr in &self.msr_intercepts {
            vcpu.toggle_exiting_for_msr(msr, true)?;
        }

        Ok(vcpu)
    }
}
