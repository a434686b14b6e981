// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel allocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use nvhost_common::settings::{ChannelRange, Settings};
use nvhost_common::{ChannelId, HostError, Result};
use parking_lot::{Mutex, MutexGuard};

use crate::cdma::Cdma;
use crate::context::MemoryContext;
use crate::device::DmaDevice;
use crate::hw::HostHardware;
use crate::memory::PhysicalMemory;

pub struct Channel {
    id: ChannelId,
    refs: AtomicU32,
    client: String,
    submit_lock: Mutex<()>,
    cdma: Cdma,
    context: Mutex<Option<Arc<MemoryContext>>>,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    /// Client the channel was handed to.
    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn cdma(&self) -> &Cdma {
        &self.cdma
    }

    /// Memory context currently routing the engine's accesses.
    pub fn context(&self) -> Option<Arc<MemoryContext>> {
        self.context.lock().clone()
    }

    pub(crate) fn set_context(&self, ctx: Option<Arc<MemoryContext>>) {
        *self.context.lock() = ctx;
    }

    /// Serializes submissions on this channel.
    pub(crate) fn lock_submit(&self) -> MutexGuard<'_, ()> {
        self.submit_lock.lock()
    }
}

pub struct ChannelManager {
    hw: Arc<dyn HostHardware>,
    memory: Arc<PhysicalMemory>,
    device: Arc<DmaDevice>,
    range: ChannelRange,
    push_buffer_slots: u32,
    table: Mutex<Vec<Option<Arc<Channel>>>>,
}

impl ChannelManager {
    pub fn new(
        hw: Arc<dyn HostHardware>,
        settings: &Settings,
        memory: Arc<PhysicalMemory>,
        device: Arc<DmaDevice>,
    ) -> Result<Self> {
        let range = settings.channels();
        if settings.num_channels > hw.num_channels() {
            return Err(HostError::InvalidParameter(format!(
                "{} channels configured, hardware has {}",
                settings.num_channels,
                hw.num_channels()
            )));
        }
        log::info!(
            "channel: {} channels, pool {}..{}",
            settings.num_channels,
            range.base,
            range.end()
        );
        Ok(Self {
            hw,
            memory,
            device,
            range,
            push_buffer_slots: settings.push_buffer_slots,
            table: Mutex::new(vec![None; settings.num_channels as usize]),
        })
    }

    pub fn range(&self) -> ChannelRange {
        self.range
    }

    /// First free channel in the pool, with its push buffer mapped and DMA
    /// started.
    pub fn request(&self, client: &str) -> Result<Arc<Channel>> {
        let mut table = self.table.lock();
        let Some(id) = (self.range.base..self.range.end()).find(|&id| table[id as usize].is_none())
        else {
            log::warn!("channel: pool exhausted for {}", client);
            return Err(HostError::ResourceExhausted("channel"));
        };
        let cdma = Cdma::new(
            id,
            self.hw.clone(),
            &self.memory,
            &self.device,
            self.push_buffer_slots,
        )?;
        let channel = Arc::new(Channel {
            id,
            refs: AtomicU32::new(1),
            client: client.to_string(),
            submit_lock: Mutex::new(()),
            cdma,
            context: Mutex::new(None),
        });
        table[id as usize] = Some(channel.clone());
        log::debug!("channel[{}]: allocated to {}", id, client);
        Ok(channel)
    }

    pub fn get(&self, channel: &Arc<Channel>) -> Result<Arc<Channel>> {
        let _table = self.table.lock();
        if channel.refcount() == 0 {
            return Err(HostError::InvalidState("channel not allocated"));
        }
        channel.refs.fetch_add(1, Ordering::AcqRel);
        Ok(channel.clone())
    }

    /// Take a reference on allocated channel `id`.
    pub fn get_index(&self, id: ChannelId) -> Result<Arc<Channel>> {
        let table = self.table.lock();
        let channel = table
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(HostError::InvalidState("channel not allocated"))?;
        channel.refs.fetch_add(1, Ordering::AcqRel);
        Ok(channel.clone())
    }

    /// Allocated channel `id` without taking a reference.
    pub fn lookup(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.table.lock().get(id as usize).and_then(Option::clone)
    }

    /// Drop a reference; the last one stops the channel and frees its slot.
    pub fn put(&self, channel: &Arc<Channel>) {
        let mut table = self.table.lock();
        let refs = channel.refcount();
        if refs == 0 {
            log::warn!("channel[{}]: put on free channel", channel.id);
            return;
        }
        channel.refs.store(refs - 1, Ordering::Release);
        if refs > 1 {
            return;
        }
        if let Some(slot) = table.get_mut(channel.id as usize) {
            if slot.as_ref().map_or(false, |c| Arc::ptr_eq(c, channel)) {
                *slot = None;
            }
        }
        drop(table);
        channel.set_context(None);
        channel.cdma.teardown();
        log::debug!("channel[{}]: released by {}", channel.id, channel.client);
    }

    /// Halt the channel's command DMA at once. In-flight jobs are not
    /// retired and syncpoints are not touched.
    pub fn stop(&self, channel: &Channel) {
        log::info!("channel[{}]: stop", channel.id);
        channel.cdma.stop();
    }

    pub fn allocated(&self) -> Vec<Arc<Channel>> {
        self.table.lock().iter().flatten().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::SimHardware;
    use nvhost_common::settings::ChannelRange;

    fn manager(range: Option<ChannelRange>) -> (Arc<SimHardware>, Arc<PhysicalMemory>, ChannelManager) {
        let hw = Arc::new(SimHardware::new(32, 0, 4));
        let mem = Arc::new(PhysicalMemory::default());
        let device = Arc::new(DmaDevice::new(0, "host1x", mem.clone(), 32));
        let settings = Settings {
            num_channels: 4,
            channel_range: range,
            push_buffer_slots: 16,
            ..Settings::default()
        };
        let mgr = ChannelManager::new(hw.clone(), &settings, mem.clone(), device).unwrap();
        (hw, mem, mgr)
    }

    #[test]
    fn test_first_fit_and_exhaustion() {
        let (hw, _mem, mgr) = manager(None);
        let channels: Vec<_> = (0..4).map(|_| mgr.request("c").unwrap()).collect();
        let ids: Vec<_> = channels.iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(hw.is_running(2));
        assert_eq!(
            mgr.request("c").err(),
            Some(HostError::ResourceExhausted("channel"))
        );

        mgr.put(&channels[2]);
        assert!(!hw.is_running(2));
        assert!(mgr.lookup(2).is_none());
        assert_eq!(mgr.request("c").unwrap().id(), 2);
    }

    #[test]
    fn test_partitioned_range() {
        let (_hw, _mem, mgr) = manager(Some(ChannelRange { base: 2, count: 2 }));
        assert_eq!(mgr.request("a").unwrap().id(), 2);
        assert_eq!(mgr.request("b").unwrap().id(), 3);
        assert!(mgr.request("c").is_err());
    }

    #[test]
    fn test_refcounting() {
        let (_hw, mem, mgr) = manager(None);
        let pages = mem.allocated_pages();
        let ch = mgr.request("c").unwrap();
        assert!(mem.allocated_pages() > pages);
        let extra = mgr.get_index(ch.id()).unwrap();
        assert_eq!(ch.refcount(), 2);
        mgr.put(&extra);
        assert!(mgr.lookup(ch.id()).is_some());
        mgr.put(&ch);
        assert!(mgr.lookup(ch.id()).is_none());
        assert!(mgr.get(&ch).is_err());
        assert!(mgr.get_index(ch.id()).is_err());
        drop((ch, extra));
        assert_eq!(mem.allocated_pages(), pages);
    }

    #[test]
    fn test_stop_halts_without_release() {
        let (hw, _mem, mgr) = manager(None);
        let ch = mgr.request("c").unwrap();
        mgr.stop(&ch);
        assert!(!hw.is_running(ch.id()));
        assert!(!ch.cdma().is_running());
        assert_eq!(ch.refcount(), 1);
    }
}
