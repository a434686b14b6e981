// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The host engine.
//!
//! `Host` owns every pool: syncpoints and their interrupts, the channel
//! table, memory-context devices, the gather mapping cache, the firewall
//! allow-list and the deferred-work thread. Client engines attach to it
//! through `Client`.

use std::fmt::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use nvhost_common::settings::{ChannelRange, Settings};
use nvhost_common::{ChannelId, HostError, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::bo::BoCache;
use crate::channel::ChannelManager;
use crate::context::MemoryContextManager;
use crate::device::{DeviceId, DmaDevice};
use crate::fence::Fence;
use crate::firewall::RegisterAllowList;
use crate::hw::HostHardware;
use crate::iommu::AddressSpace;
use crate::memory::PhysicalMemory;
use crate::syncpoint::{Syncpoint, SyncpointManager};
use crate::workqueue::Workqueue;

/// Host-side fetches use 32-bit addresses.
const HOST_DMA_BITS: u32 = 32;

/// Stream ids above the memory-context range are handed to engines.
const ENGINE_STREAM_BASE: u32 = 0x40;

/// What a client engine can expect from this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub dma_address_bits: u32,
    pub iommu: bool,
    pub memory_contexts: usize,
    pub num_syncpoints: u32,
    pub num_syncpoint_bases: u32,
    pub channels: ChannelRange,
    pub push_buffer_slots: u32,
    pub firewall_default: bool,
}

pub struct Host {
    settings: Settings,
    hw: Arc<dyn HostHardware>,
    memory: Arc<PhysicalMemory>,
    device: Arc<DmaDevice>,
    syncpoints: SyncpointManager,
    channels: ChannelManager,
    contexts: MemoryContextManager,
    gather_cache: Arc<BoCache>,
    allow_list: RwLock<RegisterAllowList>,
    workqueue: Workqueue,
    next_device: AtomicU32,
    suspended: AtomicBool,
    shut_down: AtomicBool,
    this: Weak<Host>,
}

impl Host {
    pub fn new(
        settings: Settings,
        hw: Arc<dyn HostHardware>,
        memory: Arc<PhysicalMemory>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;

        let device = Arc::new(if settings.iommu {
            DmaDevice::with_iommu(
                0,
                "host1x",
                memory.clone(),
                HOST_DMA_BITS,
                AddressSpace::new(settings.iova_base, settings.iova_size),
                0,
            )
        } else {
            DmaDevice::new(0, "host1x", memory.clone(), HOST_DMA_BITS)
        });
        hw.bind_dma(device.clone());

        let syncpoints = SyncpointManager::new(hw.clone(), &settings)?;
        let channels = ChannelManager::new(hw.clone(), &settings, memory.clone(), device.clone())?;
        let contexts = MemoryContextManager::new(hw.clone(), &settings, &memory, 1);
        let next_device = 1 + contexts.len() as DeviceId;
        let workqueue = Workqueue::new("nvhost-wq")?;

        log::info!(
            "host: {} up, iommu={} firewall={} dma_bits={}",
            hw.name(),
            settings.iommu,
            settings.firewall,
            settings.dma_address_bits
        );
        Ok(Arc::new_cyclic(|this| Self {
            settings,
            hw,
            memory,
            device,
            syncpoints,
            channels,
            contexts,
            gather_cache: BoCache::new(),
            allow_list: RwLock::new(RegisterAllowList::with_defaults()),
            workqueue,
            next_device: AtomicU32::new(next_device),
            suspended: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hardware(&self) -> &Arc<dyn HostHardware> {
        &self.hw
    }

    pub fn memory(&self) -> &Arc<PhysicalMemory> {
        &self.memory
    }

    /// The host's own DMA device; push buffers and gathers are mapped here.
    pub fn device(&self) -> &Arc<DmaDevice> {
        &self.device
    }

    pub fn syncpoints(&self) -> &SyncpointManager {
        &self.syncpoints
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn contexts(&self) -> &MemoryContextManager {
        &self.contexts
    }

    pub fn gather_cache(&self) -> &Arc<BoCache> {
        &self.gather_cache
    }

    pub fn workqueue(&self) -> &Workqueue {
        &self.workqueue
    }

    pub fn allow_list(&self) -> RwLockReadGuard<'_, RegisterAllowList> {
        self.allow_list.read()
    }

    /// For engines that register their own class tables.
    pub fn allow_list_mut(&self) -> RwLockWriteGuard<'_, RegisterAllowList> {
        self.allow_list.write()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// A DMA device for a client engine. The device gets its own IOMMU
    /// domain when `iommu` is requested and the host has one.
    pub fn create_device(&self, name: &str, iommu: bool) -> Arc<DmaDevice> {
        let id = self.next_device.fetch_add(1, Ordering::Relaxed);
        let bits = self.settings.dma_address_bits;
        let device = if iommu && self.settings.iommu {
            DmaDevice::with_iommu(
                id,
                name,
                self.memory.clone(),
                bits,
                AddressSpace::new(self.settings.iova_base, self.settings.iova_size),
                ENGINE_STREAM_BASE + id,
            )
        } else {
            if iommu {
                log::debug!("host: no IOMMU, {} gets direct DMA", name);
            }
            DmaDevice::new(id, name, self.memory.clone(), bits)
        };
        log::debug!("host: device {} '{}' stream={:?}", id, name, device.stream_id());
        Arc::new(device)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            dma_address_bits: self.settings.dma_address_bits,
            iommu: self.settings.iommu,
            memory_contexts: self.contexts.len(),
            num_syncpoints: self.syncpoints.num_syncpoints(),
            num_syncpoint_bases: self.syncpoints.num_bases(),
            channels: self.channels.range(),
            push_buffer_slots: self.settings.push_buffer_slots,
            firewall_default: self.settings.firewall,
        }
    }

    /// Fence that signals once `sp` reaches `threshold`.
    pub fn create_fence(&self, sp: &Syncpoint, threshold: u32) -> Result<Fence> {
        if !sp.is_allocated() {
            return Err(HostError::InvalidState("syncpoint not allocated"));
        }
        self.syncpoints.interrupts().create_fence(sp.id(), threshold)
    }

    /// Run completion processing for channel `ch` on the workqueue.
    pub(crate) fn schedule_update(&self, ch: ChannelId) {
        let weak = self.this.clone();
        self.workqueue.queue(move || {
            if let Some(host) = weak.upgrade() {
                if let Some(channel) = host.channels.lookup(ch) {
                    channel.cdma().update(&host);
                }
            }
        });
    }

    /// Stop every channel and save syncpoint state. Fails while any channel
    /// still has jobs in flight.
    pub fn suspend(&self) -> Result<()> {
        if self.suspended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels = self.channels.allocated();
        if let Some(busy) = channels.iter().find(|c| !c.cdma().is_idle()) {
            self.suspended.store(false, Ordering::Release);
            log::warn!(
                "host: suspend refused, channel {} has {} jobs in flight",
                busy.id(),
                busy.cdma().in_flight()
            );
            return Err(HostError::InvalidState("channel busy"));
        }
        for channel in &channels {
            self.channels.stop(channel);
        }
        self.syncpoints.save();
        log::info!("host: suspended");
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        if !self.suspended.load(Ordering::Acquire) {
            return Err(HostError::InvalidState("host not suspended"));
        }
        self.syncpoints.restore();
        for channel in self.channels.allocated() {
            channel.cdma().restart()?;
        }
        self.suspended.store(false, Ordering::Release);
        log::info!("host: resumed");
        Ok(())
    }

    /// Allocated syncpoints and channels, one per line.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        for sp in self.syncpoints.allocated() {
            let _ = writeln!(
                out,
                "syncpoint[{}] {} ({}): min={} max={} hw={} refs={} waiters={}",
                sp.id(),
                sp.name(),
                sp.client(),
                sp.min(),
                sp.max(),
                self.hw.syncpoint_read(sp.id()),
                sp.refcount(),
                self.syncpoints.interrupts().pending(sp.id())
            );
        }
        for channel in self.channels.allocated() {
            let cdma = channel.cdma();
            let _ = writeln!(
                out,
                "channel[{}] {}: refs={} in_flight={} free={}/{} running={} stalled={} context={:?}",
                channel.id(),
                channel.client(),
                channel.refcount(),
                cdma.in_flight(),
                cdma.free_slots(),
                cdma.capacity(),
                cdma.is_running(),
                cdma.is_stalled(),
                channel.context().map(|c| c.index())
            );
        }
        let _ = writeln!(
            out,
            "contexts: {}/{} allocated, gather cache: {} mappings",
            self.contexts.allocated(),
            self.contexts.len(),
            self.gather_cache.len()
        );
        for line in out.lines() {
            log::info!("host: {}", line);
        }
        out
    }

    /// Fail every in-flight job, detach from the interrupt line and stop the
    /// workqueue.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for channel in self.channels.allocated() {
            self.channels.stop(&channel);
            let jobs = channel.cdma().drain();
            if !jobs.is_empty() {
                log::warn!(
                    "host: channel {} shut down with {} jobs in flight",
                    channel.id(),
                    jobs.len()
                );
            }
            for job in jobs {
                job.abort(self, HostError::InvalidState("host shut down"));
            }
        }
        self.hw.set_interrupt_handler(None);
        self.workqueue.shutdown();
        log::info!("host: shut down");
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bo::{HostBo, SysmemBo};
    use crate::channel::Channel;
    use crate::hw::SimHardware;
    use crate::job::{Job, JobFlags, JobHandle, JobState};
    use crate::opcode::{host_reg, incr_syncpt, setclass, SyncptCond};
    use crate::syncpoint::SyncpointFlags;
    use nvhost_common::class;
    use std::thread;
    use std::time::{Duration, Instant};

    fn host(hw: &Arc<SimHardware>) -> Arc<Host> {
        let settings = Settings {
            num_syncpoints: 64,
            num_syncpoint_bases: 8,
            num_channels: 4,
            push_buffer_slots: 32,
            ..Settings::default()
        };
        Host::new(settings, hw.clone(), Arc::new(PhysicalMemory::default())).unwrap()
    }

    fn submit_incrs(
        host: &Arc<Host>,
        channel: &Arc<Channel>,
        sp: &Arc<Syncpoint>,
        n: u32,
        flags: JobFlags,
        timeout: Duration,
    ) -> JobHandle {
        let mut words = Vec::new();
        for _ in 0..n {
            words.push(setclass(class::HOST1X, host_reg::INCR_SYNCPT, 1));
            words.push(incr_syncpt(SyncptCond::Immediate, sp.id()));
        }
        let cmd: Arc<dyn HostBo> = SysmemBo::with_words(host.memory(), &words).unwrap();
        let mut job = Job::new(channel.clone(), sp.clone(), class::GR2D, n);
        job.add_gather(cmd, 0, n * 2).unwrap();
        job.set_flags(flags);
        job.set_timeout(timeout);
        job.pin(host, host.device()).unwrap();
        host.submit(job).unwrap()
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn test_capabilities() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let caps = host.capabilities();
        assert_eq!(caps.num_syncpoints, 64);
        assert_eq!(caps.channels, ChannelRange { base: 0, count: 4 });
        assert!(caps.iommu);
        assert_eq!(caps.memory_contexts, 8);

        let a = host.create_device("vic", true);
        let b = host.create_device("nvdec", false);
        assert!(a.has_iommu());
        assert!(!b.has_iommu());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_rejects_bad_settings() {
        let hw = Arc::new(SimHardware::new(8, 1, 1));
        let settings = Settings {
            num_syncpoints: 8,
            ..Settings::default()
        };
        assert!(matches!(
            Host::new(settings, hw, Arc::new(PhysicalMemory::default())),
            Err(HostError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_timeout_with_recovery() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let channel = host.channels().request("gr2d").unwrap();
        let sp = host
            .syncpoints()
            .allocate("gr2d", SyncpointFlags::empty(), "gr2d")
            .unwrap();

        // Nobody runs the channel: the hardware is dead.
        let handle = submit_incrs(
            &host,
            &channel,
            &sp,
            3,
            JobFlags::SYNCPT_RECOVERY,
            Duration::from_millis(10),
        );
        assert_eq!(handle.wait(Duration::from_secs(2)), Err(HostError::TimedOut));
        assert!(handle.is_cancelled());
        assert_eq!(handle.outcome(), Some(Err(HostError::TimedOut)));
        assert_eq!(handle.fence().error(), Some(HostError::TimedOut));
        assert_eq!(sp.min(), 3);
        assert_eq!(sp.max(), 3);
        assert_eq!(hw.syncpoint_read(sp.id()), 3);
        assert!(!hw.is_frozen(channel.id()));

        // The channel keeps working after recovery.
        let next = submit_incrs(&host, &channel, &sp, 2, JobFlags::empty(), Duration::from_secs(5));
        hw.run_all();
        assert_eq!(next.wait(Duration::from_secs(2)), Ok(()));
        assert_eq!(host.syncpoints().read_min(&sp), 5);
    }

    #[test]
    fn test_timeout_without_recovery_stalls() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let channel = host.channels().request("gr2d").unwrap();
        let sp = host
            .syncpoints()
            .allocate("gr2d", SyncpointFlags::empty(), "gr2d")
            .unwrap();

        let handle = submit_incrs(&host, &channel, &sp, 1, JobFlags::empty(), Duration::from_millis(10));
        assert!(wait_for(|| channel.cdma().is_stalled()));
        assert!(hw.is_frozen(channel.id()));
        assert_eq!(handle.state(), JobState::TimedOut);
        assert!(!handle.fence().is_signaled());

        let mut blocked = Job::new(channel.clone(), sp.clone(), class::GR2D, 0);
        blocked.pin(&host, host.device()).unwrap();
        assert_eq!(
            host.submit(blocked).err(),
            Some(HostError::InvalidState("channel stalled"))
        );

        // External recovery finishes the job and unstalls the channel.
        hw.syncpoint_write(sp.id(), handle.syncpt_end());
        assert_eq!(handle.wait(Duration::from_secs(2)), Ok(()));
        assert!(wait_for(|| !channel.cdma().is_stalled()));
        assert!(!hw.is_frozen(channel.id()));
    }

    #[test]
    fn test_suspend_resume() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let channel = host.channels().request("gr2d").unwrap();
        let sp = host
            .syncpoints()
            .allocate("gr2d", SyncpointFlags::empty(), "gr2d")
            .unwrap();

        let pending = submit_incrs(&host, &channel, &sp, 1, JobFlags::empty(), Duration::from_secs(5));
        assert_eq!(host.suspend(), Err(HostError::InvalidState("channel busy")));
        assert!(!host.is_suspended());
        hw.run_all();
        pending.wait(Duration::from_secs(2)).unwrap();

        host.suspend().unwrap();
        assert!(!hw.is_running(channel.id()));
        // Power loss.
        hw.syncpoint_write(sp.id(), 0);
        host.resume().unwrap();
        assert_eq!(hw.syncpoint_read(sp.id()), 1);
        assert!(hw.is_running(channel.id()));
        assert_eq!(host.resume(), Err(HostError::InvalidState("host not suspended")));

        let after = submit_incrs(&host, &channel, &sp, 1, JobFlags::empty(), Duration::from_secs(5));
        hw.run_all();
        assert_eq!(after.wait(Duration::from_secs(2)), Ok(()));
        assert_eq!(sp.min(), 2);
    }

    #[test]
    fn test_shutdown_fails_in_flight_jobs() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let channel = host.channels().request("gr2d").unwrap();
        let sp = host
            .syncpoints()
            .allocate("gr2d", SyncpointFlags::empty(), "gr2d")
            .unwrap();
        let handle = submit_incrs(&host, &channel, &sp, 1, JobFlags::empty(), Duration::from_secs(5));

        host.shutdown();
        let err = HostError::InvalidState("host shut down");
        assert_eq!(handle.wait(Duration::from_secs(1)), Err(err.clone()));
        assert_eq!(handle.fence().error(), Some(err));
        assert!(channel.cdma().is_idle());
    }

    #[test]
    fn test_dump_state() {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let host = host(&hw);
        let _channel = host.channels().request("vic").unwrap();
        let sp = host
            .syncpoints()
            .allocate("vic", SyncpointFlags::empty(), "vic_0")
            .unwrap();
        host.syncpoints().cpu_increment(&sp);
        host.syncpoints().read(&sp);
        let dump = host.dump_state();
        assert!(dump.contains(&format!("syncpoint[{}] vic_0 (vic): min=1 max=1", sp.id())));
        assert!(dump.contains("channel[0] vic"));
    }
}
