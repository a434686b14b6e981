// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! System memory backing buffer objects and DMA.
//!
//! Memory is handed out in 4 KiB frames. Freed frames are reused first, so a
//! non-contiguous allocation made after some churn really is scattered, which
//! is what the IOMMU and no-IOMMU mapping paths need to be exercised against.

use std::collections::HashMap;

use nvhost_common::{HostError, PAddr, Result, PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_U64};
use parking_lot::Mutex;

/// Default DRAM window (Tegra X1 maps DRAM at 2 GiB).
pub const DRAM_BASE: PAddr = 0x8000_0000;
pub const DRAM_SIZE: u64 = 0x4000_0000;

struct Frames {
    /// Allocated frames, keyed by page frame number.
    pages: HashMap<u64, Box<[u8]>>,
    /// Freed frame numbers, reused LIFO.
    free: Vec<u64>,
    /// Next never-used frame number.
    next: u64,
}

/// Page-granular physical memory.
pub struct PhysicalMemory {
    base: PAddr,
    size: u64,
    frames: Mutex<Frames>,
}

impl PhysicalMemory {
    pub fn new(base: PAddr, size: u64) -> Self {
        Self {
            base,
            size,
            frames: Mutex::new(Frames {
                pages: HashMap::new(),
                free: Vec::new(),
                next: base >> PAGE_SHIFT,
            }),
        }
    }

    pub fn base(&self) -> PAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Allocate `count` zeroed frames. Contiguous requests never reuse freed
    /// frames.
    pub fn alloc_pages(&self, count: usize, contiguous: bool) -> Result<Vec<PAddr>> {
        if count == 0 {
            return Err(HostError::InvalidParameter("zero-page allocation".into()));
        }
        let limit = (self.base + self.size) >> PAGE_SHIFT;
        let mut frames = self.frames.lock();

        let reusable = if contiguous { 0 } else { frames.free.len().min(count) };
        let fresh = (count - reusable) as u64;
        if frames.next + fresh > limit {
            return Err(HostError::ResourceExhausted("system memory"));
        }

        let mut out = Vec::with_capacity(count);
        for _ in 0..reusable {
            if let Some(pfn) = frames.free.pop() {
                out.push(pfn);
            }
        }
        for _ in 0..fresh {
            let pfn = frames.next;
            frames.next += 1;
            out.push(pfn);
        }
        for &pfn in &out {
            frames
                .pages
                .insert(pfn, vec![0u8; PAGE_SIZE].into_boxed_slice());
        }

        log::trace!(
            "physmem: alloc {} pages (contiguous={}) first=0x{:X}",
            count,
            contiguous,
            out[0] << PAGE_SHIFT
        );
        Ok(out.into_iter().map(|pfn| pfn << PAGE_SHIFT).collect())
    }

    pub fn free_pages(&self, pages: &[PAddr]) {
        let mut frames = self.frames.lock();
        for &addr in pages {
            let pfn = addr >> PAGE_SHIFT;
            if frames.pages.remove(&pfn).is_some() {
                frames.free.push(pfn);
            } else {
                log::warn!("physmem: free of unallocated page 0x{:X}", addr);
            }
        }
    }

    pub fn read(&self, addr: PAddr, dst: &mut [u8]) -> Result<()> {
        let frames = self.frames.lock();
        let mut offset = 0usize;
        while offset < dst.len() {
            let pa = addr + offset as u64;
            let page_off = (pa & (PAGE_SIZE_U64 - 1)) as usize;
            let chunk = (dst.len() - offset).min(PAGE_SIZE - page_off);
            let page = frames
                .pages
                .get(&(pa >> PAGE_SHIFT))
                .ok_or_else(|| unbacked(pa))?;
            dst[offset..offset + chunk].copy_from_slice(&page[page_off..page_off + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    pub fn write(&self, addr: PAddr, src: &[u8]) -> Result<()> {
        let mut frames = self.frames.lock();
        let mut offset = 0usize;
        while offset < src.len() {
            let pa = addr + offset as u64;
            let page_off = (pa & (PAGE_SIZE_U64 - 1)) as usize;
            let chunk = (src.len() - offset).min(PAGE_SIZE - page_off);
            let page = frames
                .pages
                .get_mut(&(pa >> PAGE_SHIFT))
                .ok_or_else(|| unbacked(pa))?;
            page[page_off..page_off + chunk].copy_from_slice(&src[offset..offset + chunk]);
            offset += chunk;
        }
        Ok(())
    }

    /// Number of frames currently allocated.
    pub fn allocated_pages(&self) -> usize {
        self.frames.lock().pages.len()
    }
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new(DRAM_BASE, DRAM_SIZE)
    }
}

fn unbacked(addr: PAddr) -> HostError {
    HostError::MappingFailed(format!("physical address 0x{:X} is not backed", addr))
}

/// One physically contiguous run of a scatter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgSegment {
    pub addr: PAddr,
    pub len: u64,
}

/// Scatter list describing the physical pages behind a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgTable {
    segments: Vec<SgSegment>,
}

impl SgTable {
    /// Build from page addresses, coalescing adjacent frames.
    pub fn from_pages(pages: &[PAddr]) -> Self {
        let mut segments: Vec<SgSegment> = Vec::new();
        for &addr in pages {
            match segments.last_mut() {
                Some(last) if last.addr + last.len == addr => last.len += PAGE_SIZE_U64,
                _ => segments.push(SgSegment {
                    addr,
                    len: PAGE_SIZE_U64,
                }),
            }
        }
        Self { segments }
    }

    pub fn segments(&self) -> &[SgSegment] {
        &self.segments
    }

    pub fn is_contiguous(&self) -> bool {
        self.segments.len() <= 1
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Every page address in order.
    pub fn pages(&self) -> impl Iterator<Item = PAddr> + '_ {
        self.segments
            .iter()
            .flat_map(|s| (0..s.len / PAGE_SIZE_U64).map(move |i| s.addr + i * PAGE_SIZE_U64))
    }
}
