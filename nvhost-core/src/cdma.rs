// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Channel command DMA.
//!
//! Every channel owns a ring of two-word slots that the host fetches from,
//! and a sync queue of the jobs whose slots are still in the ring. Jobs
//! retire in order once their syncpoint threshold is reached. The head job
//! carries the channel's only timeout timer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nvhost_common::{class, ChannelId, DmaAddr, HostError, Result, SyncpointId};
use parking_lot::{Condvar, Mutex};

use crate::bo::{self, BoMapping, HostBo, SysmemBo};
use crate::device::{DmaDevice, DmaDirection};
use crate::fence::Fence;
use crate::host::Host;
use crate::hw::HostHardware;
use crate::job::{JobFlags, SubmittedJob};
use crate::memory::PhysicalMemory;
use crate::opcode::{self, host_reg};
use crate::syncpoint::{syncpoint_reached, Syncpoint};
use crate::workqueue::DelayedWorkId;

/// One ring entry: an opcode and its data or address word.
pub type Slot = [u32; 2];

pub const SLOT_BYTES: u32 = 8;

/// Slots waiting until `id >= threshold` with the 32-bit wait registers.
pub fn wait_slots(id: SyncpointId, threshold: u32) -> [Slot; 2] {
    [
        [
            opcode::setclass(class::HOST1X, host_reg::LOAD_SYNCPT_PAYLOAD_32, 1),
            threshold,
        ],
        [opcode::setclass(class::HOST1X, host_reg::WAIT_SYNCPT_32, 1), id],
    ]
}

struct PushBuffer {
    bo: Arc<dyn HostBo>,
    mapping: Arc<BoMapping>,
    slots: u32,
    put: u32,
    free: u32,
}

impl PushBuffer {
    fn new(memory: &Arc<PhysicalMemory>, device: &Arc<DmaDevice>, slots: u32) -> Result<Self> {
        let size = u64::from(slots * SLOT_BYTES);
        let bo: Arc<dyn HostBo> = if device.has_iommu() {
            SysmemBo::new(memory, size)?
        } else {
            SysmemBo::new_contiguous(memory, size)?
        };
        let mapping = bo::pin(device, &bo, DmaDirection::ToDevice, None)?;
        if mapping.addr() + size > 1 << 32 {
            bo::unpin(&mapping);
            return Err(HostError::MappingFailed(format!(
                "push buffer at 0x{:X} beyond 32-bit reach",
                mapping.addr()
            )));
        }
        Ok(Self {
            bo,
            mapping,
            slots,
            put: 0,
            free: slots - 1,
        })
    }

    fn addr(&self) -> DmaAddr {
        self.mapping.addr()
    }

    fn size(&self) -> u32 {
        self.slots * SLOT_BYTES
    }

    /// Usable slots; one stays empty so a full ring differs from an empty one.
    fn capacity(&self) -> u32 {
        self.slots - 1
    }

    fn reset(&mut self) {
        self.put = 0;
        self.free = self.capacity();
    }

    fn push(&mut self, slot: Slot) -> Result<()> {
        self.bo
            .write_words(u64::from(self.put * SLOT_BYTES), &slot)?;
        self.put = (self.put + 1) % self.slots;
        self.free -= 1;
        Ok(())
    }

    fn pop(&mut self, count: u32) {
        self.free = (self.free + count).min(self.capacity());
    }

    fn read_slot(&self, index: u32) -> Option<Slot> {
        let words = self
            .bo
            .read_words(u64::from((index % self.slots) * SLOT_BYTES), 2)
            .ok()?;
        Some([words[0], words[1]])
    }

    fn offset_of(&self, slot: u32) -> u32 {
        (slot % self.slots) * SLOT_BYTES
    }
}

struct CdmaState {
    push_buffer: PushBuffer,
    sync_queue: VecDeque<Arc<SubmittedJob>>,
    running: bool,
    stalled: bool,
    timeout: Option<(DelayedWorkId, u64)>,
    last: Option<(SyncpointId, u32)>,
}

/// What a submission asks the ring for.
pub(crate) struct CdmaRequest<'a> {
    pub syncpoint: &'a Arc<Syncpoint>,
    pub incrs: u32,
    pub class: u32,
    pub serialize: bool,
    pub timeout: Duration,
    pub body: &'a [Slot],
}

/// Where a submission landed.
pub(crate) struct CdmaPlacement {
    pub syncpt_end: u32,
    pub fence: Fence,
    pub first_slot: u32,
    pub slots: Vec<Slot>,
}

pub struct Cdma {
    channel: ChannelId,
    hw: Arc<dyn HostHardware>,
    state: Mutex<CdmaState>,
    space: Condvar,
}

impl Cdma {
    pub(crate) fn new(
        channel: ChannelId,
        hw: Arc<dyn HostHardware>,
        memory: &Arc<PhysicalMemory>,
        device: &Arc<DmaDevice>,
        slots: u32,
    ) -> Result<Self> {
        let push_buffer = PushBuffer::new(memory, device, slots)?;
        hw.cdma_start(channel, push_buffer.addr(), push_buffer.size());
        log::debug!(
            "cdma[{}]: push buffer {} slots at 0x{:X}",
            channel,
            slots,
            push_buffer.addr()
        );
        Ok(Self {
            channel,
            hw,
            state: Mutex::new(CdmaState {
                push_buffer,
                sync_queue: VecDeque::new(),
                running: true,
                stalled: false,
                timeout: None,
                last: None,
            }),
            space: Condvar::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// A timed-out job without recovery is holding the channel.
    pub fn is_stalled(&self) -> bool {
        self.state.lock().stalled
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().sync_queue.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().sync_queue.len()
    }

    pub fn free_slots(&self) -> u32 {
        self.state.lock().push_buffer.free
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().push_buffer.capacity()
    }

    /// Device address of the ring.
    pub fn ring_addr(&self) -> DmaAddr {
        self.state.lock().push_buffer.addr()
    }

    /// Reserve increments, push the job's slots and start its timer if it is
    /// the only job in flight. Waits up to `req.timeout` for ring space.
    pub(crate) fn submit(
        &self,
        host: &Arc<Host>,
        req: CdmaRequest<'_>,
        make_job: impl FnOnce(CdmaPlacement) -> Arc<SubmittedJob>,
    ) -> Result<Arc<SubmittedJob>> {
        let sp_id = req.syncpoint.id();
        let mut state = self.state.lock();
        self.check_usable(&state)?;

        let foreign_last = state.last.filter(|&(id, _)| req.serialize && id != sp_id);
        let serialize_slots = match (req.serialize, foreign_last) {
            (false, _) => 0,
            (true, None) => 2,
            (true, Some(_)) => 4,
        };
        let needed = (req.body.len() + serialize_slots) as u32;
        if needed > state.push_buffer.capacity() {
            return Err(HostError::InvalidParameter(format!(
                "job needs {} push buffer slots, channel has {}",
                needed,
                state.push_buffer.capacity()
            )));
        }

        let deadline = Instant::now() + req.timeout;
        while state.push_buffer.free < needed {
            log::trace!(
                "cdma[{}]: waiting for {} slots, {} free",
                self.channel,
                needed,
                state.push_buffer.free
            );
            if self.space.wait_until(&mut state, deadline).timed_out()
                && state.push_buffer.free < needed
            {
                log::warn!("cdma[{}]: timed out waiting for push buffer space", self.channel);
                return Err(HostError::TimedOut);
            }
            self.check_usable(&state)?;
        }

        let syncpt_end = req.syncpoint.increment_max(req.incrs);
        let pre = syncpt_end.wrapping_sub(req.incrs);

        let mut slots = Vec::with_capacity(needed as usize);
        // The waits leave the channel in the host class; the body opens with
        // its own SETCLASS so they must come first.
        if req.serialize {
            slots.extend(wait_slots(sp_id, pre));
            if let Some((id, threshold)) = foreign_last {
                slots.extend(wait_slots(id, threshold));
            }
        }
        slots.extend_from_slice(req.body);

        let fence = host.syncpoints().interrupts().create_fence(sp_id, syncpt_end)?;
        let first_slot = state.push_buffer.put;
        for &slot in &slots {
            state.push_buffer.push(slot)?;
        }

        let job = make_job(CdmaPlacement {
            syncpt_end,
            fence,
            first_slot,
            slots,
        });
        state.sync_queue.push_back(job.clone());
        state.last = Some((sp_id, syncpt_end));
        let put = state.push_buffer.offset_of(state.push_buffer.put);
        self.hw.cdma_kick(self.channel, put);
        log::debug!(
            "cdma[{}]: job {} class=0x{:X} slots {}+{} syncpoint[{}] -> {}",
            self.channel,
            job.id(),
            req.class,
            first_slot,
            job.num_slots(),
            sp_id,
            syncpt_end
        );

        if state.sync_queue.len() == 1 {
            self.arm_timer(host, &mut state, &job);
        }
        Ok(job)
    }

    fn check_usable(&self, state: &CdmaState) -> Result<()> {
        if !state.running {
            return Err(HostError::InvalidState("channel stopped"));
        }
        if state.stalled {
            return Err(HostError::InvalidState("channel stalled"));
        }
        Ok(())
    }

    fn arm_timer(&self, host: &Arc<Host>, state: &mut CdmaState, job: &Arc<SubmittedJob>) {
        let weak: Weak<Host> = Arc::downgrade(host);
        let (channel, job_id) = (self.channel, job.id());
        let id = host.workqueue().queue_delayed(job.timeout(), move || {
            if let Some(host) = weak.upgrade() {
                if let Some(ch) = host.channels().lookup(channel) {
                    ch.cdma().handle_timeout(&host, job_id);
                }
            }
        });
        state.timeout = Some((id, job_id));
    }

    /// Retire finished jobs from the head of the sync queue.
    pub(crate) fn update(&self, host: &Arc<Host>) {
        let retired = {
            let mut state = self.state.lock();
            let mut retired = Vec::new();
            let mut resume_at = None;
            while let Some(job) = state.sync_queue.front() {
                let reached = syncpoint_reached(job.syncpoint().load(self.hw.as_ref()), job.syncpt_end());
                if !reached {
                    break;
                }
                let Some(job) = state.sync_queue.pop_front() else {
                    break;
                };
                state.push_buffer.pop(job.num_slots());
                if job.is_cancelled() && !job.is_recovered() {
                    resume_at = Some(job.first_slot() + job.num_slots());
                }
                retired.push(job);
            }
            if retired.is_empty() {
                return;
            }

            if let Some((id, _)) = state.timeout.take() {
                host.workqueue().cancel_delayed(id);
            }
            if let Some(head) = state.sync_queue.front().cloned() {
                if !head.is_cancelled() {
                    self.arm_timer(host, &mut state, &head);
                }
            }
            if let (true, Some(slot)) = (state.stalled, resume_at) {
                // Somebody completed the stalled job for us.
                let get = state.push_buffer.offset_of(slot);
                state.stalled = false;
                self.hw.cdma_resume(self.channel, get);
                log::info!("cdma[{}]: stalled job retired, channel resumed", self.channel);
            }
            self.space.notify_all();
            retired
        };

        for job in retired {
            job.complete(host);
        }
    }

    pub(crate) fn handle_timeout(&self, host: &Arc<Host>, job_id: u64) {
        let mut state = self.state.lock();
        match state.timeout {
            Some((_, id)) if id == job_id => state.timeout = None,
            _ => return,
        }
        let Some(job) = state.sync_queue.front().cloned() else {
            return;
        };
        if job.id() != job_id {
            return;
        }
        let sp = job.syncpoint().clone();
        if syncpoint_reached(sp.load(self.hw.as_ref()), job.syncpt_end()) {
            drop(state);
            self.update(host);
            return;
        }

        log::error!(
            "cdma[{}]: job {} timed out after {:?} waiting for syncpoint[{}] >= {} (min={} max={})",
            self.channel,
            job.id(),
            job.timeout(),
            sp.id(),
            job.syncpt_end(),
            sp.min(),
            sp.max()
        );
        for n in 0..job.num_slots() {
            let index = job.first_slot() + n;
            if let Some([op, data]) = state.push_buffer.read_slot(index) {
                log::error!(
                    "cdma[{}]: slot {:4}: {:08X} {:08X}",
                    self.channel,
                    index % state.push_buffer.slots,
                    op,
                    data
                );
            }
        }

        self.hw.cdma_freeze(self.channel);
        let recover = job.flags().contains(JobFlags::SYNCPT_RECOVERY);
        job.mark_timed_out(recover);

        if !recover {
            state.stalled = true;
            self.space.notify_all();
            log::warn!(
                "cdma[{}]: no recovery requested, channel left stalled",
                self.channel
            );
            return;
        }

        job.fence().cancel(HostError::TimedOut);
        if !syncpoint_reached(self.hw.syncpoint_read(sp.id()), job.syncpt_end()) {
            self.hw.syncpoint_write(sp.id(), job.syncpt_end());
        }
        sp.load(self.hw.as_ref());
        let get = state
            .push_buffer
            .offset_of(job.first_slot() + job.num_slots());
        self.hw.cdma_resume(self.channel, get);
        log::warn!(
            "cdma[{}]: syncpoint[{}] fast-forwarded to {}, channel resumed",
            self.channel,
            sp.id(),
            job.syncpt_end()
        );
        drop(state);

        host.syncpoints().interrupts().handle_syncpoint(sp.id());
        self.update(host);
    }

    /// Halt fetching immediately. Counters are left alone.
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        self.hw.cdma_stop(self.channel);
        self.space.notify_all();
    }

    /// Restart an idle channel from the beginning of its ring.
    pub(crate) fn restart(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sync_queue.is_empty() {
            return Err(HostError::InvalidState("channel busy"));
        }
        state.push_buffer.reset();
        state.running = true;
        state.stalled = false;
        state.last = None;
        self.hw
            .cdma_start(self.channel, state.push_buffer.addr(), state.push_buffer.size());
        Ok(())
    }

    /// Jobs still in the sync queue, oldest first.
    pub(crate) fn drain(&self) -> Vec<Arc<SubmittedJob>> {
        let mut state = self.state.lock();
        state.timeout = None;
        let jobs: Vec<_> = state.sync_queue.drain(..).collect();
        state.push_buffer.reset();
        self.space.notify_all();
        jobs
    }

    pub(crate) fn teardown(&self) {
        let state = self.state.lock();
        self.hw.cdma_stop(self.channel);
        bo::unpin(&state.push_buffer.mapping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_slots_encoding() {
        let [load, wait] = wait_slots(5, 100);
        assert_eq!(
            opcode::Opcode::decode(load[0]),
            opcode::Opcode::SetClass {
                offset: host_reg::LOAD_SYNCPT_PAYLOAD_32,
                class: class::HOST1X,
                mask: 1
            }
        );
        assert_eq!(load[1], 100);
        assert_eq!(wait[1], 5);
    }

    #[test]
    fn test_push_buffer_ring_accounting() {
        let mem = Arc::new(PhysicalMemory::default());
        let dev = Arc::new(DmaDevice::new(0, "host1x", mem.clone(), 32));
        let mut pb = PushBuffer::new(&mem, &dev, 4).unwrap();
        assert_eq!(pb.capacity(), 3);
        for n in 0..3 {
            pb.push([n, n + 10]).unwrap();
        }
        assert_eq!(pb.free, 0);
        assert_eq!(pb.put, 3);
        assert_eq!(pb.read_slot(1), Some([1, 11]));
        pb.pop(2);
        pb.push([7, 8]).unwrap();
        assert_eq!(pb.put, 0);
        assert_eq!(pb.offset_of(5), 8);
        assert_eq!(pb.free, 1);
    }
}
