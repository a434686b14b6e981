// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Attach surface for client engines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nvhost_common::{ClassId, HostError, ProcessId, Result};
use parking_lot::Mutex;

use crate::bo::{self, BoCache, BoMapping, HostBo};
use crate::channel::Channel;
use crate::context::MemoryContext;
use crate::device::{DmaDevice, DmaDirection};
use crate::fence::Fence;
use crate::host::Host;
use crate::job::{Job, JobFlags, JobHandle};
use crate::syncpoint::{Syncpoint, SyncpointFlags};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub class: ClassId,
    pub num_syncpoints: u32,
    pub syncpoint_flags: SyncpointFlags,
    /// Reserved pool to draw syncpoints from instead of the general pool.
    pub syncpoint_pool: Option<String>,
    pub firewall: bool,
    /// Put the engine behind its own IOMMU domain when the host has one.
    pub iommu: bool,
}

impl ClientConfig {
    pub fn new(name: &str, class: ClassId) -> Self {
        Self {
            name: name.to_string(),
            class,
            num_syncpoints: 1,
            syncpoint_flags: SyncpointFlags::empty(),
            syncpoint_pool: None,
            firewall: false,
            iommu: true,
        }
    }
}

/// An attached engine: one channel, its syncpoints and its DMA device.
pub struct Client {
    host: Arc<Host>,
    config: ClientConfig,
    device: Arc<DmaDevice>,
    cache: Arc<BoCache>,
    channel: Arc<Channel>,
    syncpoints: Vec<Arc<Syncpoint>>,
    context: Mutex<Option<Arc<MemoryContext>>>,
    detached: AtomicBool,
}

impl Client {
    pub fn attach(host: &Arc<Host>, config: ClientConfig) -> Result<Self> {
        let channel = host.channels().request(&config.name)?;
        let mut syncpoints = Vec::with_capacity(config.num_syncpoints as usize);
        for i in 0..config.num_syncpoints {
            let name = format!("{}_{}", config.name, i);
            let sp = match &config.syncpoint_pool {
                Some(pool) => host.syncpoints().allocate_in_pool(
                    pool,
                    &config.name,
                    config.syncpoint_flags,
                    &name,
                ),
                None => host
                    .syncpoints()
                    .allocate(&config.name, config.syncpoint_flags, &name),
            };
            match sp {
                Ok(sp) => syncpoints.push(sp),
                Err(e) => {
                    log::warn!("client {}: attach failed: {}", config.name, e);
                    for sp in &syncpoints {
                        if let Err(e) = host.syncpoints().release(sp) {
                            log::warn!(
                                "client {}: syncpoint[{}] not returned: {}",
                                config.name,
                                sp.id(),
                                e
                            );
                        }
                    }
                    host.channels().put(&channel);
                    return Err(e);
                }
            }
        }
        let device = host.create_device(&config.name, config.iommu);
        log::info!(
            "client {}: attached on channel {} with syncpoints {:?}",
            config.name,
            channel.id(),
            syncpoints.iter().map(|sp| sp.id()).collect::<Vec<_>>()
        );
        Ok(Self {
            host: host.clone(),
            config,
            device,
            cache: BoCache::new(),
            channel,
            syncpoints,
            context: Mutex::new(None),
            detached: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn class(&self) -> ClassId {
        self.config.class
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn device(&self) -> &Arc<DmaDevice> {
        &self.device
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn syncpoint(&self, index: usize) -> Result<&Arc<Syncpoint>> {
        self.syncpoints.get(index).ok_or_else(|| {
            HostError::InvalidParameter(format!(
                "client {} has {} syncpoints, not {}",
                self.config.name,
                self.syncpoints.len(),
                index + 1
            ))
        })
    }

    pub fn syncpoints(&self) -> &[Arc<Syncpoint>] {
        &self.syncpoints
    }

    /// A job on the client's channel incrementing syncpoint `index`
    /// `incrs` times.
    pub fn new_job(&self, index: usize, incrs: u32) -> Result<Job> {
        let sp = self.syncpoint(index)?.clone();
        let mut job = Job::new(self.channel.clone(), sp, self.config.class, incrs);
        if self.config.firewall || self.host.settings().firewall {
            job.set_flags(JobFlags::FIREWALL);
        }
        job.set_memory_context(self.context.lock().clone());
        job.set_cache(Some(self.cache.clone()));
        Ok(job)
    }

    /// Pin and submit.
    pub fn submit(&self, mut job: Job) -> Result<JobHandle> {
        job.pin(&self.host, &self.device)?;
        self.host.submit(job)
    }

    /// Refresh from hardware and return the counter value.
    pub fn read_syncpoint(&self, index: usize) -> Result<u32> {
        Ok(self.host.syncpoints().read(self.syncpoint(index)?))
    }

    pub fn wait(&self, index: usize, threshold: u32, timeout: Duration) -> Result<(u32, Instant)> {
        self.host
            .syncpoints()
            .wait(self.syncpoint(index)?, threshold, timeout)
    }

    /// Route the engine through a memory context owned by `pid`.
    pub fn enable_isolation(&self, pid: ProcessId) -> Result<Arc<MemoryContext>> {
        let mut current = self.context.lock();
        if let Some(ctx) = current.as_ref() {
            if ctx.pid() == Some(pid) {
                return Ok(ctx.clone());
            }
            return Err(HostError::InvalidState("isolation already enabled"));
        }
        let contexts = self.host.contexts();
        let ctx = contexts.alloc(&self.device, pid)?;
        if let Err(e) = contexts.activate(&ctx, &self.channel) {
            contexts.put(&ctx);
            return Err(e);
        }
        *current = Some(ctx.clone());
        Ok(ctx)
    }

    pub fn disable_isolation(&self) {
        if let Some(ctx) = self.context.lock().take() {
            let contexts = self.host.contexts();
            contexts.deactivate(&self.channel);
            contexts.put(&ctx);
        }
    }

    pub fn context(&self) -> Option<Arc<MemoryContext>> {
        self.context.lock().clone()
    }

    /// Map `bo` for the engine, into the memory context when one is active.
    pub fn map_buffer(&self, bo: &Arc<dyn HostBo>, direction: DmaDirection) -> Result<Arc<BoMapping>> {
        match self.context.lock().as_ref() {
            Some(ctx) => self.host.contexts().map_buffer(ctx, bo, direction),
            None => bo::pin(&self.device, bo, direction, Some(&self.cache)),
        }
    }

    pub fn unmap_buffer(&self, mapping: &Arc<BoMapping>) -> bool {
        bo::unpin(mapping)
    }

    /// Fence on syncpoint `index` reaching `threshold`, for consumers outside
    /// this client.
    pub fn export_fence(&self, index: usize, threshold: u32) -> Result<Fence> {
        self.host.create_fence(self.syncpoint(index)?, threshold)
    }

    /// Return the channel, syncpoints and memory context. Mappings still in
    /// the client cache are left to their holders.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disable_isolation();
        for sp in &self.syncpoints {
            if let Err(e) = self.host.syncpoints().release(sp) {
                log::warn!(
                    "client {}: syncpoint[{}] not returned: {}",
                    self.config.name,
                    sp.id(),
                    e
                );
            }
        }
        self.host.channels().put(&self.channel);
        log::info!("client {}: detached", self.config.name);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.detach();
    }
}
