use crate::error::{MsrOutOfRangeSnafu, Result};
use core::ops::RangeInclusive;
use x86::bits64::paging::BASE_PAGE_SIZE;

const RANGE_BYTES: usize = 1024;

/// MSRs are split into two ranges, each with its own read and write bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsrRange {
    /// 0000_0000 to 0000_1FFF
    Low,
    /// C000_0000 to C000_1FFF
    High,
}

impl MsrRange {
    pub const LOW: RangeInclusive<u32> = 0x0000_0000..=0x0000_1FFF;
    pub const HIGH: RangeInclusive<u32> = 0xC000_0000..=0xC000_1FFF;

    pub fn classify(msr: u32) -> Option<Self> {
        if Self::LOW.contains(&msr) {
            Some(Self::Low)
        } else if Self::HIGH.contains(&msr) {
            Some(Self::High)
        } else {
            None
        }
    }

    fn base(self) -> u32 {
        match self {
            Self::Low => *Self::LOW.start(),
            Self::High => *Self::HIGH.start(),
        }
    }
}

/// Which accesses of an MSR cause a VM-exit.
///
/// See: 25.6.9 MSR-Bitmap Address
#[repr(C, align(4096))]
pub struct MsrBitmap {
    pub read_low: [u8; RANGE_BYTES],
    pub read_high: [u8; RANGE_BYTES],
    pub write_low: [u8; RANGE_BYTES],
    pub write_high: [u8; RANGE_BYTES],
}
const_assert_eq!(core::mem::size_of::<MsrBitmap>(), BASE_PAGE_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

impl MsrBitmap {
    /// Enables or disables exiting for both reads and writes of `msr`.
    ///
    /// MSRs outside of [`MsrRange::LOW`] and [`MsrRange::HIGH`] always exit and
    /// cannot be represented; they are rejected and leave the bitmap as is.
    pub fn toggle(&mut self, msr: u32, enabled: bool) -> Result<()> {
        self.set(msr, Access::Read, enabled)?;
        self.set(msr, Access::Write, enabled)
    }

    pub fn toggle_read(&mut self, msr: u32, enabled: bool) -> Result<()> {
        self.set(msr, Access::Read, enabled)
    }

    pub fn toggle_write(&mut self, msr: u32, enabled: bool) -> Result<()> {
        self.set(msr, Access::Write, enabled)
    }

    pub fn intercepts_read(&self, msr: u32) -> bool {
        self.get(msr, Access::Read)
    }

    pub fn intercepts_write(&self, msr: u32) -> bool {
        self.get(msr, Access::Write)
    }

    pub fn is_intercepted(&self, msr: u32) -> bool {
        self.intercepts_read(msr) && self.intercepts_write(msr)
    }

    fn region(&self, range: MsrRange, access: Access) -> &[u8; RANGE_BYTES] {
        match (range, access) {
            (MsrRange::Low, Access::Read) => &self.read_low,
            (MsrRange::High, Access::Read) => &self.read_high,
            (MsrRange::Low, Access::Write) => &self.write_low,
            (MsrRange::High, Access::Write) => &self.write_high,
        }
    }

    fn region_mut(&mut self, range: MsrRange, access: Access) -> &mut [u8; RANGE_BYTES] {
        match (range, access) {
            (MsrRange::Low, Access::Read) => &mut self.read_low,
            (MsrRange::High, Access::Read) => &mut self.read_high,
            (MsrRange::Low, Access::Write) => &mut self.write_low,
            (MsrRange::High, Access::Write) => &mut self.write_high,
        }
    }

    fn set(&mut self, msr: u32, access: Access, enabled: bool) -> Result<()> {
        let Some(range) = MsrRange::classify(msr) else {
            log::warn!("Ignoring exiting request for MSR {:#x} outside of the bitmap", msr);
            return MsrOutOfRangeSnafu { msr }.fail();
        };

        let bit = (msr - range.base()) as usize;
        let (byte, mask) = (bit / 8, 1u8 << (bit % 8));

        let region = self.region_mut(range, access);
        if enabled {
            region[byte] |= mask;
        } else {
            region[byte] &= !mask;
        }

        Ok(())
    }

    fn get(&self, msr: u32, access: Access) -> bool {
        let Some(range) = MsrRange::classify(msr) else { return false };

        let bit = (msr - range.base()) as usize;
        self.region(range, access)[bit / 8] & (1 << (bit % 8)) != 0
    }
}
