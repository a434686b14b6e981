// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Hardware syncpoint index.
pub type SyncpointId = u32;

/// Hardware channel index.
pub type ChannelId = u32;

/// Hardware unit class id, as selected by `SETCLASS`.
pub type ClassId = u32;

/// Address as seen by a device (IOVA or physical when no IOMMU).
pub type DmaAddr = u64;

/// Physical address in system memory.
pub type PAddr = u64;

/// Process ID of a memory-context owner.
pub type ProcessId = u64;

/// Page size (4 KiB, matching the SMMU granule).
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Syncpoints covered by one interrupt status line.
pub const SYNCPOINTS_PER_LINE: u32 = 32;

/// Known hardware classes.
pub mod class {
    use super::ClassId;

    pub const HOST1X: ClassId = 0x01;
    pub const NVENC: ClassId = 0x21;
    pub const GR2D: ClassId = 0x51;
    pub const GR2D_SB: ClassId = 0x52;
    pub const VIC: ClassId = 0x5D;
    pub const GR3D: ClassId = 0x60;
    pub const NVJPG: ClassId = 0xC0;
    pub const NVDEC: ClassId = 0xF0;
}

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// Number of pages needed to hold `size` bytes.
#[inline]
pub const fn pages_for(size: u64) -> u64 {
    align_up(size, PAGE_SIZE_U64) >> PAGE_SHIFT
}

/// Interrupt line that reports syncpoint `id`.
#[inline]
pub const fn interrupt_line(id: SyncpointId) -> u32 {
    id / SYNCPOINTS_PER_LINE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 0x1000), 0);
        assert_eq!(align_up(1, 0x1000), 0x1000);
        assert_eq!(align_up(0x1000, 0x1000), 0x1000);
        assert_eq!(align_down(0x1FFF, 0x1000), 0x1000);
        assert!(is_page_aligned(0x3000));
        assert!(!is_page_aligned(0x3004));
    }

    #[test]
    fn test_pages_for() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(0x1000), 1);
        assert_eq!(pages_for(0x1001), 2);
    }

    #[test]
    fn test_interrupt_line() {
        assert_eq!(interrupt_line(0), 0);
        assert_eq!(interrupt_line(31), 0);
        assert_eq!(interrupt_line(32), 1);
        assert_eq!(interrupt_line(191), 5);
    }
}
