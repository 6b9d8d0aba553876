//! Host GDT, IDT, TSS and stack used while the processor is in VMX root
//! operation.

use crate::config::{
    HypervisorConfig, HOST_GDT_DESCRIPTOR_COUNT, HOST_IDT_DESCRIPTOR_COUNT, HOST_STACK_SIZE,
};
use bitfield::bitfield;
use core::mem::size_of;
use x86::{
    bits64::paging::BASE_PAGE_SIZE,
    segmentation::{
        BuildDescriptor, CodeSegmentType, Descriptor, DescriptorBuilder,
        SegmentDescriptorBuilder, SegmentSelector,
    },
    Ring,
};
use x86_64::{structures::tss::TaskStateSegment, VirtAddr};

pub type HostGdt = [u64; HOST_GDT_DESCRIPTOR_COUNT];
pub type HostIdt = [InterruptGate; HOST_IDT_DESCRIPTOR_COUNT];

const INTERRUPT_GATE: u64 = 0xE;
const AVAILABLE_TSS: u64 = 0x9;

bitfield! {
    /// Lower half of a 64-bit system segment descriptor.
    ///
    /// See: Figure 8-4. Format of TSS and LDT Descriptors in 64-bit Mode
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct SystemDescriptorLow(u64);
    impl Debug;
    u64;

    pub limit_low, set_limit_low: 15, 0;
    pub base_low, set_base_low: 39, 16;
    pub segment_type, set_segment_type: 43, 40;
    pub dpl, set_dpl: 46, 45;
    pub present, set_present: 47;
    pub limit_high, set_limit_high: 51, 48;
    pub granularity, set_granularity: 55;
    pub base_middle, set_base_middle: 63, 56;
}

bitfield! {
    /// Lower half of a 64-bit interrupt gate.
    ///
    /// See: Figure 7-8. 64-Bit IDT Gate Descriptors
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct GateLow(u64);
    impl Debug;
    u64;

    pub offset_low, set_offset_low: 15, 0;
    pub selector, set_selector: 31, 16;
    pub ist, set_ist: 34, 32;
    pub gate_type, set_gate_type: 43, 40;
    pub dpl, set_dpl: 46, 45;
    pub present, set_present: 47;
    pub offset_middle, set_offset_middle: 63, 48;
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptGate {
    low: GateLow,
    /// Bits 63:32 of the handler, upper half reserved.
    high: u64,
}
const_assert_eq!(size_of::<InterruptGate>(), 16);
const_assert_eq!(size_of::<HostIdt>(), BASE_PAGE_SIZE);

impl InterruptGate {
    /// Present, ring 0, 64-bit interrupt gate without IST.
    pub fn new(selector: SegmentSelector, handler: u64) -> Self {
        let mut low = GateLow(0);
        low.set_offset_low(handler & 0xFFFF);
        low.set_selector(selector.bits() as u64);
        low.set_gate_type(INTERRUPT_GATE);
        low.set_dpl(0);
        low.set_present(true);
        low.set_offset_middle((handler >> 16) & 0xFFFF);

        Self {
            low,
            high: handler >> 32,
        }
    }

    pub fn handler(&self) -> u64 {
        self.low.offset_low() | self.low.offset_middle() << 16 | (self.high & 0xFFFF_FFFF) << 32
    }

    pub fn selector(&self) -> u16 {
        self.low.selector() as u16
    }

    pub fn is_present(&self) -> bool {
        self.low.present()
    }
}

/// The TSS the host runs with. Only `rsp0` and the I/O map base are used.
#[repr(C, align(4096))]
pub struct HostTss {
    pub tss: TaskStateSegment,
}

impl HostTss {
    pub fn base(&self) -> u64 {
        &self.tss as *const TaskStateSegment as u64
    }

    pub fn limit(&self) -> u32 {
        size_of::<TaskStateSegment>() as u32 - 1
    }

    pub fn prepare(&mut self, stack_top: u64) {
        self.tss = TaskStateSegment::new();
        self.tss.privilege_stack_table[0] = VirtAddr::new_truncate(stack_top);
        self.tss.iomap_base = size_of::<TaskStateSegment>() as u16;
    }
}

#[repr(C, align(4096))]
pub struct HostStack {
    pub contents: [u8; HOST_STACK_SIZE],
}
const_assert_eq!(size_of::<HostStack>(), HOST_STACK_SIZE);

/// Bytes reserved at the top of the host stack. The highest slot holds the
/// owning processor, the one below keeps `HOST_RSP` 16 byte aligned.
pub const HOST_STACK_RESERVED: usize = 16;

impl HostStack {
    pub fn top(&self) -> u64 {
        self.contents.as_ptr() as u64 + HOST_STACK_SIZE as u64
    }

    /// Initial `HOST_RSP`.
    pub fn host_rsp(&self) -> u64 {
        self.top() - HOST_STACK_RESERVED as u64
    }

    pub fn set_owner(&mut self, owner: u64) {
        let offset = HOST_STACK_SIZE - size_of::<u64>();
        self.contents[offset..].copy_from_slice(&owner.to_ne_bytes());
    }

    pub fn owner(&self) -> u64 {
        let offset = HOST_STACK_SIZE - size_of::<u64>();
        let mut bytes = [0; size_of::<u64>()];
        bytes.copy_from_slice(&self.contents[offset..]);

        u64::from_ne_bytes(bytes)
    }
}

/// 64-bit ring 0 code segment.
pub fn code_segment_descriptor() -> u64 {
    let descriptor: Descriptor =
        DescriptorBuilder::code_descriptor(0, u32::MAX, CodeSegmentType::ExecuteReadAccessed)
            .present()
            .dpl(Ring::Ring0)
            .limit_granularity_4kb()
            .l()
            .finish();

    unsafe { core::mem::transmute::<Descriptor, u64>(descriptor) }
}

/// Available 64-bit TSS descriptor, spanning two GDT slots.
pub fn tss_descriptor(base: u64, limit: u32) -> [u64; 2] {
    let mut low = SystemDescriptorLow(0);
    low.set_limit_low(limit as u64 & 0xFFFF);
    low.set_base_low(base & 0xFF_FFFF);
    low.set_segment_type(AVAILABLE_TSS);
    low.set_dpl(0);
    low.set_present(true);
    low.set_limit_high((limit as u64 >> 16) & 0xF);
    low.set_granularity(false);
    low.set_base_middle((base >> 24) & 0xFF);

    [low.0, base >> 32]
}

pub fn build_gdt(gdt: &mut HostGdt, config: &HypervisorConfig, tss: &HostTss) {
    let cs = config.host_cs_selector.index() as usize;
    let tr = config.host_tr_selector.index() as usize;

    gdt.fill(0);
    gdt[cs] = code_segment_descriptor();

    let [low, high] = tss_descriptor(tss.base(), tss.limit());
    gdt[tr] = low;
    gdt[tr + 1] = high;
}

pub fn build_idt(idt: &mut HostIdt, cs: SegmentSelector, isr_address: impl Fn(u8) -> u64) {
    for (vector, gate) in idt.iter_mut().enumerate() {
        *gate = InterruptGate::new(cs, isr_address(vector as u8));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{utils::alloc::zeroed_box, vmx::guest::SegmentState};

    #[test]
    fn gdt_has_code_and_tss_at_configured_slots() {
        let config = HypervisorConfig::default();
        let mut tss = unsafe { zeroed_box::<HostTss>() }.unwrap();
        tss.prepare(0xFFFF_8000_0000_6000);
        let mut gdt = [0xFFFF_FFFF_FFFF_FFFF; HOST_GDT_DESCRIPTOR_COUNT];

        build_gdt(&mut gdt, &config, &tss);

        assert_eq!(gdt.len(), 4);
        assert_eq!(gdt[0], 0);

        let cs = SegmentState::from_gdt(&gdt, config.host_cs_selector.bits());
        assert_eq!(cs.access_rights & 0x80, 0x80, "present");
        assert_eq!(cs.access_rights & 0x18, 0x18, "code segment");
        assert_ne!(cs.access_rights & (1 << 13), 0, "long mode");

        let tr = SegmentState::from_gdt(&gdt, config.host_tr_selector.bits());
        assert_eq!(tr.base, tss.base());
        assert_eq!(tr.limit, tss.limit());
        assert_eq!(tr.access_rights, 0x8B);
    }

    #[test]
    fn tss_descriptor_splits_base() {
        let [low, high] = tss_descriptor(0xFFFF_A000_1234_5678, 0x67);
        let low = SystemDescriptorLow(low);

        assert_eq!(low.base_low(), 0x34_5678);
        assert_eq!(low.base_middle(), 0x12);
        assert_eq!(high, 0xFFFF_A000);
        assert_eq!(low.limit_low(), 0x67);
        assert_eq!(low.segment_type(), AVAILABLE_TSS);
        assert!(low.present());
    }

    #[test]
    fn tss_points_at_host_stack() {
        let mut tss = unsafe { zeroed_box::<HostTss>() }.unwrap();

        tss.prepare(0x7000);

        let privilege_stacks = { tss.tss.privilege_stack_table };
        assert_eq!(privilege_stacks[0].as_u64(), 0x7000);
        assert_eq!(tss.tss.iomap_base as usize, size_of::<TaskStateSegment>());
        assert_eq!(tss.base() % BASE_PAGE_SIZE as u64, 0);
    }

    #[test]
    fn idt_has_a_gate_per_vector() {
        let cs = SegmentSelector::new(1, Ring::Ring0);
        let mut idt = [InterruptGate::default(); HOST_IDT_DESCRIPTOR_COUNT];

        build_idt(&mut idt, cs, |vector| 0xFFFF_8000_0000_0000 + vector as u64 * 16);

        assert_eq!(idt.len(), 256);
        for (vector, gate) in idt.iter().enumerate() {
            assert!(gate.is_present());
            assert_eq!(gate.selector(), cs.bits());
            assert_eq!(gate.handler(), 0xFFFF_8000_0000_0000 + vector as u64 * 16);
        }
    }

    #[test]
    fn gate_encodes_type_and_offset() {
        let gate = InterruptGate::new(SegmentSelector::new(1, Ring::Ring0), 0x1234_5678_9ABC_DEF0);

        assert_eq!(gate.low.gate_type(), INTERRUPT_GATE);
        assert_eq!(gate.low.dpl(), 0);
        assert_eq!(gate.low.ist(), 0);
        assert_eq!(gate.low.offset_low(), 0xDEF0);
        assert_eq!(gate.low.offset_middle(), 0x9ABC);
        assert_eq!(gate.high, 0x1234_5678);
    }

    #[test]
    fn stack_owner_slot_is_above_host_rsp() {
        let mut stack = unsafe { zeroed_box::<HostStack>() }.unwrap();

        stack.set_owner(0xDEAD_BEEF);

        assert_eq!(stack.owner(), 0xDEAD_BEEF);
        assert_eq!(stack.top() % BASE_PAGE_SIZE as u64, 0);
        assert_eq!(stack.host_rsp(), stack.top() - 16);
        assert_eq!(stack.host_rsp() % 16, 0);
    }
}
