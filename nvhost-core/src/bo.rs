// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Buffer objects and the pin/mapping cache.
//!
//! Pinning makes a buffer visible to a device. With a cache, at most one
//! mapping exists per `(device, buffer, direction)` and repeated pins share
//! it through its refcount. The slow DMA mapping runs outside the cache lock;
//! if two pins race, the second to insert discards its own mapping and takes
//! a reference on the winner's.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use byteorder::{ByteOrder, LittleEndian};
use nvhost_common::{
    align_up, DmaAddr, HostError, PAddr, Result, PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_U64,
};
use parking_lot::Mutex;

use crate::device::{DeviceId, DmaDevice, DmaDirection};
use crate::memory::{PhysicalMemory, SgTable};

pub type BoId = u64;

static NEXT_BO_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh buffer identity for `HostBo` implementations.
pub fn next_bo_id() -> BoId {
    NEXT_BO_ID.fetch_add(1, Ordering::Relaxed)
}

/// A buffer the engine can pin, patch and fetch commands from.
pub trait HostBo: Send + Sync + fmt::Debug {
    fn id(&self) -> BoId;
    fn size(&self) -> u64;
    /// Physical pages backing the buffer.
    fn sg_table(&self) -> Result<SgTable>;
    /// CPU read at a byte offset.
    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()>;
    /// CPU write at a byte offset.
    fn write(&self, offset: u64, src: &[u8]) -> Result<()>;

    fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        let mut buf = [0u8; 4];
        LittleEndian::write_u32(&mut buf, value);
        self.write(offset, &buf)
    }

    fn read_words(&self, offset: u64, count: usize) -> Result<Vec<u32>> {
        let mut bytes = vec![0u8; count * 4];
        self.read(offset, &mut bytes)?;
        let mut words = vec![0u32; count];
        LittleEndian::read_u32_into(&bytes, &mut words);
        Ok(words)
    }

    fn write_words(&self, offset: u64, words: &[u32]) -> Result<()> {
        let mut bytes = vec![0u8; words.len() * 4];
        LittleEndian::write_u32_into(words, &mut bytes);
        self.write(offset, &bytes)
    }
}

// ── System memory buffers ────────────────────────────────────────────────

/// Buffer backed by `PhysicalMemory` frames.
pub struct SysmemBo {
    id: BoId,
    size: u64,
    pages: Vec<PAddr>,
    memory: Arc<PhysicalMemory>,
}

impl SysmemBo {
    /// Allocate a buffer whose pages may be scattered.
    pub fn new(memory: &Arc<PhysicalMemory>, size: u64) -> Result<Arc<Self>> {
        Self::alloc(memory, size, false)
    }

    /// Allocate a physically contiguous buffer.
    pub fn new_contiguous(memory: &Arc<PhysicalMemory>, size: u64) -> Result<Arc<Self>> {
        Self::alloc(memory, size, true)
    }

    /// Allocate a buffer holding `words`.
    pub fn with_words(memory: &Arc<PhysicalMemory>, words: &[u32]) -> Result<Arc<Self>> {
        let bo = Self::new(memory, (words.len() as u64 * 4).max(4))?;
        bo.write_words(0, words)?;
        Ok(bo)
    }

    fn alloc(memory: &Arc<PhysicalMemory>, size: u64, contiguous: bool) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(HostError::InvalidParameter("zero-sized buffer".into()));
        }
        let count = (align_up(size, PAGE_SIZE_U64) >> PAGE_SHIFT) as usize;
        let pages = memory.alloc_pages(count, contiguous)?;
        let bo = Self {
            id: next_bo_id(),
            size,
            pages,
            memory: memory.clone(),
        };
        log::debug!("bo[{}]: alloc 0x{:X} bytes ({} pages)", bo.id, size, count);
        Ok(Arc::new(bo))
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(HostError::InvalidParameter(format!(
                "bo[{}]: access 0x{:X}+0x{:X} beyond size 0x{:X}",
                self.id, offset, len, self.size
            ))),
        }
    }
}

impl HostBo for SysmemBo {
    fn id(&self) -> BoId {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sg_table(&self) -> Result<SgTable> {
        Ok(SgTable::from_pages(&self.pages))
    }

    fn read(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, dst.len())?;
        let mut done = 0usize;
        while done < dst.len() {
            let pos = offset + done as u64;
            let page_off = (pos & (PAGE_SIZE_U64 - 1)) as usize;
            let chunk = (dst.len() - done).min(PAGE_SIZE - page_off);
            let page = self.pages[(pos >> PAGE_SHIFT) as usize];
            self.memory
                .read(page + page_off as u64, &mut dst[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len())?;
        let mut done = 0usize;
        while done < src.len() {
            let pos = offset + done as u64;
            let page_off = (pos & (PAGE_SIZE_U64 - 1)) as usize;
            let chunk = (src.len() - done).min(PAGE_SIZE - page_off);
            let page = self.pages[(pos >> PAGE_SHIFT) as usize];
            self.memory
                .write(page + page_off as u64, &src[done..done + chunk])?;
            done += chunk;
        }
        Ok(())
    }
}

impl fmt::Debug for SysmemBo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysmemBo")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("pages", &self.pages.len())
            .finish()
    }
}

impl Drop for SysmemBo {
    fn drop(&mut self) {
        self.memory.free_pages(&self.pages);
    }
}

// ── Mappings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub device: DeviceId,
    pub bo: BoId,
    pub direction: DmaDirection,
}

/// A buffer pinned for one device.
pub struct BoMapping {
    key: MappingKey,
    bo: Arc<dyn HostBo>,
    device: Arc<DmaDevice>,
    addr: DmaAddr,
    size: u64,
    refs: AtomicU32,
    unmapped: AtomicBool,
    cache: Option<Weak<BoCache>>,
}

impl BoMapping {
    pub fn key(&self) -> MappingKey {
        self.key
    }

    pub fn bo(&self) -> &Arc<dyn HostBo> {
        &self.bo
    }

    pub fn device(&self) -> &Arc<DmaDevice> {
        &self.device
    }

    /// Address of the buffer's first byte as seen by the device.
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn direction(&self) -> DmaDirection {
        self.key.direction
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_mapped(&self) -> bool {
        !self.unmapped.load(Ordering::Acquire)
    }

    fn teardown(&self) {
        if !self.unmapped.swap(true, Ordering::AcqRel) {
            self.device.unmap(self.addr, self.size);
            log::trace!(
                "bo[{}]: unmapped from {} at 0x{:X}",
                self.key.bo,
                self.device.name(),
                self.addr
            );
        }
    }
}

impl fmt::Debug for BoMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoMapping")
            .field("key", &self.key)
            .field("addr", &format_args!("0x{:X}", self.addr))
            .field("size", &self.size)
            .field("refs", &self.refcount())
            .finish()
    }
}

impl Drop for BoMapping {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Per-device (or per-context) cache of live mappings. Entries leave only
/// when their last pin is released.
#[derive(Default)]
pub struct BoCache {
    mappings: Mutex<HashMap<MappingKey, Arc<BoMapping>>>,
}

impl BoCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.lock().is_empty()
    }

    pub fn lookup(&self, key: &MappingKey) -> Option<Arc<BoMapping>> {
        self.mappings.lock().get(key).cloned()
    }

    /// Snapshot of every live mapping.
    pub fn mappings(&self) -> Vec<Arc<BoMapping>> {
        self.mappings.lock().values().cloned().collect()
    }

    /// Take a reference on the cached mapping for `key`, if any.
    fn get(&self, key: &MappingKey) -> Option<Arc<BoMapping>> {
        let mappings = self.mappings.lock();
        let mapping = mappings.get(key)?;
        mapping.refs.fetch_add(1, Ordering::AcqRel);
        Some(mapping.clone())
    }
}

/// Pin `bo` for `device`, reusing a cached mapping when one exists.
pub fn pin(
    device: &Arc<DmaDevice>,
    bo: &Arc<dyn HostBo>,
    direction: DmaDirection,
    cache: Option<&Arc<BoCache>>,
) -> Result<Arc<BoMapping>> {
    let key = MappingKey {
        device: device.id(),
        bo: bo.id(),
        direction,
    };

    if let Some(mapping) = cache.and_then(|c| c.get(&key)) {
        log::trace!(
            "bo[{}]: cache hit on {} refs={}",
            key.bo,
            device.name(),
            mapping.refcount()
        );
        return Ok(mapping);
    }

    let sgt = bo.sg_table()?;
    let addr = device.map_sg(&sgt, direction)?;
    let mapping = Arc::new(BoMapping {
        key,
        bo: bo.clone(),
        device: device.clone(),
        addr,
        size: sgt.len(),
        refs: AtomicU32::new(1),
        unmapped: AtomicBool::new(false),
        cache: cache.map(Arc::downgrade),
    });

    let Some(cache) = cache else {
        return Ok(mapping);
    };

    let mut mappings = cache.mappings.lock();
    if let Some(existing) = mappings.get(&key) {
        existing.refs.fetch_add(1, Ordering::AcqRel);
        let existing = existing.clone();
        drop(mappings);
        log::trace!("bo[{}]: lost pin race on {}", key.bo, device.name());
        mapping.teardown();
        return Ok(existing);
    }
    mappings.insert(key, mapping.clone());
    drop(mappings);

    log::debug!(
        "bo[{}]: pinned to {} at 0x{:X} ({:?})",
        key.bo,
        device.name(),
        addr,
        direction
    );
    Ok(mapping)
}

/// Drop one pin. Returns `true` when this released the mapping.
pub fn unpin(mapping: &Arc<BoMapping>) -> bool {
    let cache = mapping.cache.as_ref().and_then(Weak::upgrade);
    let mut mappings = cache.as_ref().map(|c| c.mappings.lock());

    let released = mapping
        .refs
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| refs.checked_sub(1))
        .map(|prev| prev == 1);
    match released {
        Ok(true) => {
            if let Some(mappings) = mappings.as_mut() {
                if mappings
                    .get(&mapping.key)
                    .map_or(false, |m| Arc::ptr_eq(m, mapping))
                {
                    mappings.remove(&mapping.key);
                }
            }
            drop(mappings);
            mapping.teardown();
            true
        }
        Ok(false) => false,
        Err(_) => {
            log::warn!("bo[{}]: unpin of released mapping", mapping.key.bo);
            false
        }
    }
}

/// Unmap regardless of outstanding pins. Later `unpin` calls become no-ops.
pub fn force_unmap(mapping: &Arc<BoMapping>) {
    if let Some(cache) = mapping.cache.as_ref().and_then(Weak::upgrade) {
        let mut mappings = cache.mappings.lock();
        if mappings
            .get(&mapping.key)
            .map_or(false, |m| Arc::ptr_eq(m, mapping))
        {
            mappings.remove(&mapping.key);
        }
    }
    mapping.refs.store(0, Ordering::Release);
    mapping.teardown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::AddressSpace;
    use std::thread;

    fn setup() -> (Arc<PhysicalMemory>, Arc<DmaDevice>) {
        let mem = Arc::new(PhysicalMemory::default());
        let dev = Arc::new(DmaDevice::with_iommu(
            1,
            "gr2d",
            mem.clone(),
            34,
            AddressSpace::new(0x10_0000, 0x1000_0000),
            0x10,
        ));
        (mem, dev)
    }

    #[test]
    fn test_sysmem_bo_words() {
        let (mem, _) = setup();
        let bo = SysmemBo::new(&mem, 0x2000).unwrap();
        bo.write_words(0xFFC, &[0x1111_1111, 0x2222_2222]).unwrap();
        assert_eq!(bo.read_u32(0x1000).unwrap(), 0x2222_2222);
        assert_eq!(
            bo.read_words(0xFFC, 2).unwrap(),
            vec![0x1111_1111, 0x2222_2222]
        );
        assert!(bo.read_u32(0x1FFE).is_err());
    }

    #[test]
    fn test_sysmem_bo_frees_pages() {
        let (mem, _) = setup();
        let bo = SysmemBo::new(&mem, 0x3000).unwrap();
        assert_eq!(mem.allocated_pages(), 3);
        drop(bo);
        assert_eq!(mem.allocated_pages(), 0);
    }

    #[test]
    fn test_cached_pin_shares_mapping() {
        let (mem, dev) = setup();
        let cache = BoCache::new();
        let bo: Arc<dyn HostBo> = SysmemBo::new(&mem, 0x1000).unwrap();

        let a = pin(&dev, &bo, DmaDirection::ToDevice, Some(&cache)).unwrap();
        let b = pin(&dev, &bo, DmaDirection::ToDevice, Some(&cache)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.refcount(), 2);
        assert_eq!(cache.len(), 1);

        assert!(!unpin(&a));
        assert_eq!(cache.len(), 1);
        assert!(unpin(&b));
        assert!(cache.is_empty());
        assert!(!b.is_mapped());
        assert_eq!(dev.mapped_pages(), 0);
    }

    #[test]
    fn test_direction_is_part_of_key() {
        let (mem, dev) = setup();
        let cache = BoCache::new();
        let bo: Arc<dyn HostBo> = SysmemBo::new(&mem, 0x1000).unwrap();

        let a = pin(&dev, &bo, DmaDirection::ToDevice, Some(&cache)).unwrap();
        let b = pin(&dev, &bo, DmaDirection::FromDevice, Some(&cache)).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_uncached_pin_is_private() {
        let (mem, dev) = setup();
        let bo: Arc<dyn HostBo> = SysmemBo::new(&mem, 0x1000).unwrap();

        let a = pin(&dev, &bo, DmaDirection::ToDevice, None).unwrap();
        let b = pin(&dev, &bo, DmaDirection::ToDevice, None).unwrap();
        assert_ne!(a.addr(), b.addr());
        assert_eq!(a.refcount(), 1);
        assert!(unpin(&a));
        assert!(unpin(&b));
        assert!(!unpin(&b));
    }

    #[test]
    fn test_concurrent_pins_create_one_mapping() {
        let (mem, dev) = setup();
        let cache = BoCache::new();
        let bo: Arc<dyn HostBo> = SysmemBo::new(&mem, 0x4000).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (dev, bo, cache) = (dev.clone(), bo.clone(), cache.clone());
                thread::spawn(move || {
                    pin(&dev, &bo, DmaDirection::Bidirectional, Some(&cache)).unwrap()
                })
            })
            .collect();
        let mappings: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(cache.len(), 1);
        assert!(mappings.iter().all(|m| Arc::ptr_eq(m, &mappings[0])));
        assert_eq!(mappings[0].refcount(), 8);
        // Losers tore their mappings down again.
        assert_eq!(dev.mapped_pages(), 4);
    }

    #[test]
    fn test_force_unmap_makes_unpin_noop() {
        let (mem, dev) = setup();
        let cache = BoCache::new();
        let bo: Arc<dyn HostBo> = SysmemBo::new(&mem, 0x1000).unwrap();
        let a = pin(&dev, &bo, DmaDirection::ToDevice, Some(&cache)).unwrap();
        let _b = pin(&dev, &bo, DmaDirection::ToDevice, Some(&cache)).unwrap();

        force_unmap(&a);
        assert!(cache.is_empty());
        assert!(!a.is_mapped());
        assert!(!unpin(&a));
        assert_eq!(dev.mapped_pages(), 0);
    }
}
