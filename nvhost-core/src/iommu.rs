// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! IOMMU address spaces.
//!
//! Maps device virtual addresses (IOVA, up to 40 bits) to physical pages
//! using a 2-level page table with 4 KB pages, plus a first-fit allocator
//! over the IOVA window the domain hands out.
//!
//! Layout: `[L0: 14 bits][L1: 14 bits][Offset: 12 bits]` = 40 bits total.

use std::collections::BTreeMap;

use nvhost_common::{align_up, DmaAddr, HostError, PAddr, Result};

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
const L1_BITS: u32 = 14;
const L0_BITS: u32 = 14;
const L1_SIZE: usize = 1 << L1_BITS;

/// Sentinel for unmapped pages.
const INVALID_ENTRY: u64 = u64::MAX;

/// Widest IOVA the page table can describe.
pub const IOVA_BITS: u32 = L0_BITS + L1_BITS + PAGE_BITS;

/// One IOMMU domain.
pub struct AddressSpace {
    /// L0 table: each entry is an optional L1 page table.
    page_table: Vec<Option<Box<[u64; L1_SIZE]>>>,
    base: DmaAddr,
    size: u64,
    /// Free IOVA ranges, start -> length.
    free: BTreeMap<DmaAddr, u64>,
    mapped_pages: usize,
}

impl AddressSpace {
    /// Create a domain that allocates from `[base, base + size)`.
    pub fn new(base: DmaAddr, size: u64) -> Self {
        let l0_size = 1 << L0_BITS;
        let mut page_table = Vec::with_capacity(l0_size);
        for _ in 0..l0_size {
            page_table.push(None);
        }
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(base, size);
        }
        Self {
            page_table,
            base,
            size,
            free,
            mapped_pages: 0,
        }
    }

    pub fn base(&self) -> DmaAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mapped_pages(&self) -> usize {
        self.mapped_pages
    }

    /// Reserve an IOVA range of at least `size` bytes (first fit).
    pub fn alloc(&mut self, size: u64) -> Result<DmaAddr> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let (start, len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(&start, &len)| (start, len))
            .ok_or(HostError::ResourceExhausted("IOVA space"))?;

        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        log::trace!("iommu: alloc IOVA 0x{:X}..0x{:X}", start, start + size);
        Ok(start)
    }

    /// Return an IOVA range to the allocator, merging with its neighbours.
    pub fn free(&mut self, iova: DmaAddr, size: u64) {
        let mut start = iova;
        let mut len = align_up(size.max(1), PAGE_SIZE);

        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
        log::trace!("iommu: free IOVA 0x{:X}..0x{:X}", iova, iova + size);
    }

    /// Map consecutive IOVA pages starting at `iova` to `pages`.
    pub fn map(&mut self, iova: DmaAddr, pages: impl IntoIterator<Item = PAddr>) {
        let mut va = iova;
        for page in pages {
            self.set_entry(va, page);
            va += PAGE_SIZE;
        }
        log::trace!("iommu: map IOVA 0x{:X}..0x{:X}", iova, va);
    }

    /// Unmap a contiguous IOVA range.
    pub fn unmap(&mut self, iova: DmaAddr, size: u64) {
        let mut offset = 0u64;
        while offset < size {
            self.set_entry(iova + offset, INVALID_ENTRY);
            offset += PAGE_SIZE;
        }
        log::trace!("iommu: unmap IOVA 0x{:X}..0x{:X}", iova, iova + size);
    }

    /// Translate an IOVA to a physical address.
    /// Returns `None` if the page is not mapped.
    pub fn translate(&self, iova: DmaAddr) -> Option<PAddr> {
        let page_offset = iova & (PAGE_SIZE - 1);
        let entry = self.get_entry(iova);
        if entry == INVALID_ENTRY {
            None
        } else {
            Some(entry + page_offset)
        }
    }

    /// Read through the domain. Faults on unmapped pages.
    pub fn read(
        &self,
        iova: DmaAddr,
        dst: &mut [u8],
        read_phys: &dyn Fn(PAddr, &mut [u8]) -> Result<()>,
    ) -> Result<()> {
        let mut offset = 0usize;
        while offset < dst.len() {
            let va = iova + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk_size = std::cmp::min(dst.len() - offset, PAGE_SIZE as usize - page_off);
            let pa = self.translate(va).ok_or_else(|| fault(va))?;
            read_phys(pa, &mut dst[offset..offset + chunk_size])?;
            offset += chunk_size;
        }
        Ok(())
    }

    /// Write through the domain. Faults on unmapped pages.
    pub fn write(
        &self,
        iova: DmaAddr,
        src: &[u8],
        write_phys: &dyn Fn(PAddr, &[u8]) -> Result<()>,
    ) -> Result<()> {
        let mut offset = 0usize;
        while offset < src.len() {
            let va = iova + offset as u64;
            let page_off = (va & (PAGE_SIZE - 1)) as usize;
            let chunk_size = std::cmp::min(src.len() - offset, PAGE_SIZE as usize - page_off);
            let pa = self.translate(va).ok_or_else(|| fault(va))?;
            write_phys(pa, &src[offset..offset + chunk_size])?;
            offset += chunk_size;
        }
        Ok(())
    }

    // ── Internal helpers ─────────────────────────────────────────────────

    fn l0_index(iova: DmaAddr) -> usize {
        ((iova >> (L1_BITS + PAGE_BITS)) & ((1 << L0_BITS) - 1)) as usize
    }

    fn l1_index(iova: DmaAddr) -> usize {
        ((iova >> PAGE_BITS) & ((1 << L1_BITS) - 1)) as usize
    }

    fn set_entry(&mut self, iova: DmaAddr, page_addr: u64) {
        let l0 = Self::l0_index(iova);
        let l1 = Self::l1_index(iova);

        let table = match &mut self.page_table[l0] {
            Some(table) => table,
            None if page_addr == INVALID_ENTRY => return,
            slot => slot.insert(Box::new([INVALID_ENTRY; L1_SIZE])),
        };

        let entry = if page_addr == INVALID_ENTRY {
            INVALID_ENTRY
        } else {
            page_addr & !(PAGE_SIZE - 1)
        };
        match (table[l1] == INVALID_ENTRY, entry == INVALID_ENTRY) {
            (true, false) => self.mapped_pages += 1,
            (false, true) => self.mapped_pages -= 1,
            _ => {}
        }
        table[l1] = entry;
    }

    fn get_entry(&self, iova: DmaAddr) -> u64 {
        let l0 = Self::l0_index(iova);
        let l1 = Self::l1_index(iova);

        match &self.page_table[l0] {
            Some(table) => table[l1],
            None => INVALID_ENTRY,
        }
    }
}

fn fault(iova: DmaAddr) -> HostError {
    HostError::MappingFailed(format!("IOMMU fault at IOVA 0x{:X}", iova))
}
