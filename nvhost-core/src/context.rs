// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-process memory contexts.
//!
//! Each context device owns a private IOMMU domain and stream id. A client
//! that enables isolation gets one context per `(process, engine)` pair and
//! maps the buffers its jobs reference into that domain only.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvhost_common::settings::Settings;
use nvhost_common::{HostError, ProcessId, Result};
use parking_lot::Mutex;

use crate::bo::{self, BoCache, BoMapping, HostBo};
use crate::channel::Channel;
use crate::device::{DeviceId, DmaDevice, DmaDirection};
use crate::hw::HostHardware;
use crate::iommu::AddressSpace;
use crate::memory::PhysicalMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    pid: ProcessId,
    engine: DeviceId,
}

pub struct MemoryContext {
    index: usize,
    device: Arc<DmaDevice>,
    cache: Arc<BoCache>,
    refs: AtomicU32,
    owner: Mutex<Option<Owner>>,
}

impl MemoryContext {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &Arc<DmaDevice> {
        &self.device
    }

    pub fn stream_id(&self) -> Option<u32> {
        self.device.stream_id()
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Process that allocated the context.
    pub fn pid(&self) -> Option<ProcessId> {
        self.owner.lock().map(|o| o.pid)
    }

    pub fn engine(&self) -> Option<DeviceId> {
        self.owner.lock().map(|o| o.engine)
    }

    /// Live mappings in the context's address space.
    pub fn num_mappings(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn cache(&self) -> &Arc<BoCache> {
        &self.cache
    }
}

pub struct MemoryContextManager {
    hw: Arc<dyn HostHardware>,
    contexts: Vec<Arc<MemoryContext>>,
    lock: Mutex<()>,
}

impl MemoryContextManager {
    /// Create `num_memory_contexts` context devices with ids starting at
    /// `first_device`. Nothing is created when the IOMMU is disabled.
    pub fn new(
        hw: Arc<dyn HostHardware>,
        settings: &Settings,
        memory: &Arc<PhysicalMemory>,
        first_device: DeviceId,
    ) -> Self {
        let count = if settings.iommu {
            settings.num_memory_contexts as usize
        } else {
            0
        };
        let contexts = (0..count)
            .map(|index| {
                let device = DmaDevice::with_iommu(
                    first_device + index as DeviceId,
                    &format!("context{}", index),
                    memory.clone(),
                    settings.dma_address_bits,
                    AddressSpace::new(settings.iova_base, settings.iova_size),
                    index as u32 + 1,
                );
                Arc::new(MemoryContext {
                    index,
                    device: Arc::new(device),
                    cache: BoCache::new(),
                    refs: AtomicU32::new(0),
                    owner: Mutex::new(None),
                })
            })
            .collect::<Vec<_>>();
        log::info!("context: {} memory context devices", contexts.len());
        Self {
            hw,
            contexts,
            lock: Mutex::new(()),
        }
    }

    pub fn is_supported(&self) -> bool {
        !self.contexts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Contexts currently handed out.
    pub fn allocated(&self) -> usize {
        self.contexts.iter().filter(|c| c.refcount() > 0).count()
    }

    /// Context for `pid` on `engine`, shared with earlier allocations by the
    /// same pair.
    pub fn alloc(&self, engine: &DmaDevice, pid: ProcessId) -> Result<Arc<MemoryContext>> {
        if self.contexts.is_empty() {
            return Err(HostError::NotSupported("memory context isolation"));
        }
        if !engine.has_iommu() {
            return Err(HostError::NotSupported("engine is not behind an IOMMU"));
        }
        let owner = Owner {
            pid,
            engine: engine.id(),
        };

        let _guard = self.lock.lock();
        if let Some(ctx) = self
            .contexts
            .iter()
            .find(|c| c.refcount() > 0 && *c.owner.lock() == Some(owner))
        {
            ctx.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(ctx.clone());
        }
        let Some(ctx) = self.contexts.iter().find(|c| c.refcount() == 0) else {
            log::warn!("context: none free for pid {} on {}", pid, engine.name());
            return Err(HostError::ResourceExhausted("memory context"));
        };
        *ctx.owner.lock() = Some(owner);
        ctx.refs.store(1, Ordering::Release);
        log::debug!(
            "context[{}]: allocated to pid {} on {} stream={:?}",
            ctx.index,
            pid,
            engine.name(),
            ctx.stream_id()
        );
        Ok(ctx.clone())
    }

    pub fn get(&self, ctx: &Arc<MemoryContext>) -> Result<Arc<MemoryContext>> {
        let _guard = self.lock.lock();
        if ctx.refcount() == 0 {
            return Err(HostError::InvalidState("memory context not allocated"));
        }
        ctx.refs.fetch_add(1, Ordering::AcqRel);
        Ok(ctx.clone())
    }

    /// Drop a reference. The last one unmaps everything still mapped.
    pub fn put(&self, ctx: &Arc<MemoryContext>) {
        let _guard = self.lock.lock();
        let refs = ctx.refcount();
        if refs == 0 {
            log::warn!("context[{}]: put on free context", ctx.index);
            return;
        }
        ctx.refs.store(refs - 1, Ordering::Release);
        if refs > 1 {
            return;
        }

        let mappings = ctx.cache.mappings();
        if !mappings.is_empty() {
            log::debug!(
                "context[{}]: tearing down {} live mappings",
                ctx.index,
                mappings.len()
            );
        }
        for mapping in &mappings {
            bo::force_unmap(mapping);
        }
        *ctx.owner.lock() = None;
        log::debug!("context[{}]: freed", ctx.index);
    }

    /// Pin `bo` into the context's address space.
    pub fn map_buffer(
        &self,
        ctx: &MemoryContext,
        bo: &Arc<dyn HostBo>,
        direction: DmaDirection,
    ) -> Result<Arc<BoMapping>> {
        if ctx.refcount() == 0 {
            return Err(HostError::InvalidState("memory context not allocated"));
        }
        bo::pin(&ctx.device, bo, direction, Some(&ctx.cache))
    }

    /// Returns `true` when the mapping was released.
    pub fn unmap(&self, mapping: &Arc<BoMapping>) -> bool {
        bo::unpin(mapping)
    }

    /// Route `channel`'s engine accesses through `ctx`.
    pub fn activate(&self, ctx: &Arc<MemoryContext>, channel: &Channel) -> Result<()> {
        if ctx.refcount() == 0 {
            return Err(HostError::InvalidState("memory context not allocated"));
        }
        self.hw.set_stream_id(channel.id(), ctx.stream_id());
        channel.set_context(Some(ctx.clone()));
        log::trace!("context[{}]: active on channel {}", ctx.index, channel.id());
        Ok(())
    }

    pub fn deactivate(&self, channel: &Channel) {
        self.hw.set_stream_id(channel.id(), None);
        channel.set_context(None);
    }
}
