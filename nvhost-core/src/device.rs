// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! DMA-capable devices.
//!
//! A device either sits behind an IOMMU domain, in which case any scatter
//! list can be mapped into its IOVA window, or it addresses physical memory
//! directly and can only reach contiguous buffers inside its DMA mask.

use std::fmt;
use std::sync::Arc;

use nvhost_common::{DmaAddr, HostError, PAddr, Result};
use parking_lot::Mutex;

use crate::iommu::AddressSpace;
use crate::memory::{PhysicalMemory, SgTable};

pub type DeviceId = u32;

/// Direction of the data flow a mapping is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

pub struct DmaDevice {
    id: DeviceId,
    name: String,
    dma_bits: u32,
    stream_id: Option<u32>,
    memory: Arc<PhysicalMemory>,
    domain: Option<Mutex<AddressSpace>>,
}

impl DmaDevice {
    /// A device without an IOMMU.
    pub fn new(id: DeviceId, name: &str, memory: Arc<PhysicalMemory>, dma_bits: u32) -> Self {
        Self {
            id,
            name: name.to_string(),
            dma_bits,
            stream_id: None,
            memory,
            domain: None,
        }
    }

    /// A device translated by its own IOMMU domain.
    pub fn with_iommu(
        id: DeviceId,
        name: &str,
        memory: Arc<PhysicalMemory>,
        dma_bits: u32,
        domain: AddressSpace,
        stream_id: u32,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            dma_bits,
            stream_id: Some(stream_id),
            memory,
            domain: Some(Mutex::new(domain)),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dma_bits(&self) -> u32 {
        self.dma_bits
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    pub fn has_iommu(&self) -> bool {
        self.domain.is_some()
    }

    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    /// Highest address the device can generate.
    pub fn dma_mask(&self) -> u64 {
        if self.dma_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.dma_bits) - 1
        }
    }

    /// Make a scatter list visible to the device and return its address.
    pub fn map_sg(&self, sgt: &SgTable, direction: DmaDirection) -> Result<DmaAddr> {
        let size = sgt.len();
        if size == 0 {
            return Err(HostError::InvalidParameter("empty scatter list".into()));
        }

        let addr = match &self.domain {
            Some(domain) => {
                let mut domain = domain.lock();
                let iova = domain.alloc(size).map_err(|_| {
                    HostError::MappingFailed(format!("{}: IOVA space exhausted", self.name))
                })?;
                if iova + size - 1 > self.dma_mask() {
                    domain.free(iova, size);
                    return Err(HostError::MappingFailed(format!(
                        "{}: IOVA 0x{:X} beyond {}-bit DMA mask",
                        self.name, iova, self.dma_bits
                    )));
                }
                domain.map(iova, sgt.pages());
                iova
            }
            None => {
                if !sgt.is_contiguous() {
                    return Err(HostError::MappingFailed(format!(
                        "{}: buffer is not physically contiguous and device has no IOMMU",
                        self.name
                    )));
                }
                let addr = sgt.segments()[0].addr;
                if addr + size - 1 > self.dma_mask() {
                    return Err(HostError::MappingFailed(format!(
                        "{}: 0x{:X} beyond {}-bit DMA mask",
                        self.name, addr, self.dma_bits
                    )));
                }
                addr
            }
        };

        log::trace!(
            "{}: map {:?} 0x{:X} bytes at 0x{:X}",
            self.name,
            direction,
            size,
            addr
        );
        Ok(addr)
    }

    /// Tear down a mapping created by `map_sg`.
    pub fn unmap(&self, addr: DmaAddr, size: u64) {
        if let Some(domain) = &self.domain {
            let mut domain = domain.lock();
            domain.unmap(addr, size);
            domain.free(addr, size);
        }
        log::trace!("{}: unmap 0x{:X} bytes at 0x{:X}", self.name, size, addr);
    }

    /// Physical address the device reaches at `addr`.
    pub fn translate(&self, addr: DmaAddr) -> Option<PAddr> {
        match &self.domain {
            Some(domain) => domain.lock().translate(addr),
            None if addr <= self.dma_mask() => Some(addr),
            None => None,
        }
    }

    /// DMA read as performed by the device.
    pub fn read(&self, addr: DmaAddr, dst: &mut [u8]) -> Result<()> {
        match &self.domain {
            Some(domain) => domain
                .lock()
                .read(addr, dst, &|pa, buf| self.memory.read(pa, buf)),
            None => self.memory.read(addr, dst),
        }
    }

    /// DMA write as performed by the device.
    pub fn write(&self, addr: DmaAddr, src: &[u8]) -> Result<()> {
        match &self.domain {
            Some(domain) => domain
                .lock()
                .write(addr, src, &|pa, buf| self.memory.write(pa, buf)),
            None => self.memory.write(addr, src),
        }
    }

    /// Pages currently mapped in the device's domain (0 without an IOMMU).
    pub fn mapped_pages(&self) -> usize {
        self.domain
            .as_ref()
            .map_or(0, |domain| domain.lock().mapped_pages())
    }
}

impl fmt::Debug for DmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dma_bits", &self.dma_bits)
            .field("iommu", &self.has_iommu())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DRAM_BASE;

    fn memory() -> Arc<PhysicalMemory> {
        Arc::new(PhysicalMemory::default())
    }

    #[test]
    fn test_direct_mapping_is_physical() {
        let mem = memory();
        let dev = DmaDevice::new(1, "gr2d", mem.clone(), 32);
        let pages = mem.alloc_pages(2, true).unwrap();
        let sgt = SgTable::from_pages(&pages);

        let addr = dev.map_sg(&sgt, DmaDirection::ToDevice).unwrap();
        assert_eq!(addr, DRAM_BASE);
        assert_eq!(dev.translate(addr + 0x10), Some(DRAM_BASE + 0x10));
    }

    #[test]
    fn test_direct_mapping_rejects_scattered() {
        let mem = memory();
        let dev = DmaDevice::new(1, "gr2d", mem.clone(), 32);
        let a = mem.alloc_pages(1, true).unwrap();
        let _hole = mem.alloc_pages(1, true).unwrap();
        mem.free_pages(&a);
        let pages = mem.alloc_pages(2, false).unwrap();

        let result = dev.map_sg(&SgTable::from_pages(&pages), DmaDirection::ToDevice);
        assert!(matches!(result, Err(HostError::MappingFailed(_))));
    }

    #[test]
    fn test_direct_mapping_respects_mask() {
        let mem = Arc::new(PhysicalMemory::new(0x1_0000_0000, 0x10_0000));
        let dev = DmaDevice::new(1, "legacy", mem.clone(), 32);
        let pages = mem.alloc_pages(1, true).unwrap();
        let result = dev.map_sg(&SgTable::from_pages(&pages), DmaDirection::FromDevice);
        assert!(matches!(result, Err(HostError::MappingFailed(_))));
    }

    #[test]
    fn test_iommu_mapping_round_trip() {
        let mem = memory();
        let dev = DmaDevice::with_iommu(
            2,
            "vic",
            mem.clone(),
            34,
            AddressSpace::new(0x10_0000, 0x1000_0000),
            0x14,
        );
        let a = mem.alloc_pages(1, true).unwrap();
        let _hole = mem.alloc_pages(1, true).unwrap();
        mem.free_pages(&a);
        let pages = mem.alloc_pages(2, false).unwrap();
        mem.write(pages[1], &[0xAB; 4]).unwrap();

        let iova = dev
            .map_sg(&SgTable::from_pages(&pages), DmaDirection::Bidirectional)
            .unwrap();
        assert_eq!(iova, 0x10_0000);
        assert_eq!(dev.mapped_pages(), 2);

        let mut buf = [0u8; 4];
        dev.read(iova + 0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xAB; 4]);

        dev.unmap(iova, 0x2000);
        assert_eq!(dev.mapped_pages(), 0);
        assert_eq!(dev.translate(iova), None);
    }
}
