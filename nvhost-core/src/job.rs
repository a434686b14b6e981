// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Job submission.
//!
//! A `Job` is built and pinned by its client, then handed to
//! `Host::submit`, which turns it into push-buffer slots, validates and
//! patches the command stream, and queues it on the channel. From then on the
//! in-flight record (`SubmittedJob`) is owned by the channel's sync queue and
//! the client observes it through a `JobHandle`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use nvhost_common::{class, ClassId, ChannelId, DmaAddr, HostError, Result, SyncpointId};
use parking_lot::{Condvar, Mutex};

use crate::bo::{self, BoCache, BoMapping, HostBo, SysmemBo};
use crate::cdma::{wait_slots, CdmaPlacement, CdmaRequest, Slot};
use crate::channel::Channel;
use crate::context::MemoryContext;
use crate::device::{DmaDevice, DmaDirection};
use crate::fence::{Fence, FenceResult};
use crate::firewall::Firewall;
use crate::host::Host;
use crate::opcode::{self, MAX_GATHER_WORDS, NOP};
use crate::syncpoint::Syncpoint;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct JobFlags: u32 {
        /// Validate the command stream against the register allow-list.
        const FIREWALL = 1 << 0;
        /// Wait for earlier work on the channel before starting.
        const SERIALIZE = 1 << 1;
        /// On timeout, fast-forward the syncpoint and fail the fence.
        const SYNCPT_RECOVERY = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Building,
    Pinned,
    Submitted,
    Completed,
    TimedOut,
    Released,
}

pub type ReleaseCallback = Box<dyn FnOnce(&FenceResult) + Send + 'static>;

#[derive(Clone)]
pub enum CommandEntry {
    /// Fetch `words` command words from `bo` at byte `offset`.
    Gather {
        bo: Arc<dyn HostBo>,
        offset: u64,
        words: u32,
    },
    /// Wait for `syncpoint >= threshold`, or `>= base + threshold` when a
    /// base register is given.
    Wait {
        syncpoint: SyncpointId,
        threshold: u32,
        base: Option<u32>,
    },
    RegisterWrite {
        class: ClassId,
        offset: u32,
        value: u32,
    },
}

impl fmt::Debug for CommandEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gather { bo, offset, words } => write!(
                f,
                "Gather(bo={} offset=0x{:X} words={})",
                bo.id(),
                offset,
                words
            ),
            Self::Wait {
                syncpoint,
                threshold,
                base,
            } => write!(f, "Wait({} >= {} base={:?})", syncpoint, threshold, base),
            Self::RegisterWrite {
                class,
                offset,
                value,
            } => write!(f, "Write(0x{:X}:0x{:X} = 0x{:X})", class, offset, value),
        }
    }
}

/// Patch `(target address + target_offset) >> shift` into the word at
/// `cmdbuf_offset` of `cmdbuf`.
#[derive(Clone)]
pub struct Relocation {
    pub cmdbuf: Arc<dyn HostBo>,
    pub cmdbuf_offset: u64,
    pub target: Arc<dyn HostBo>,
    pub target_offset: u64,
    pub shift: u32,
    pub direction: DmaDirection,
}

pub struct Job {
    channel: Arc<Channel>,
    syncpoint: Arc<Syncpoint>,
    class: ClassId,
    syncpt_incrs: u32,
    entries: Vec<CommandEntry>,
    relocations: Vec<Relocation>,
    timeout: Option<Duration>,
    flags: JobFlags,
    context: Option<Arc<MemoryContext>>,
    cache: Option<Arc<BoCache>>,
    release: Option<ReleaseCallback>,
    state: JobState,
    pins: Vec<Arc<BoMapping>>,
    gather_addrs: Vec<DmaAddr>,
    reloc_addrs: Vec<DmaAddr>,
}

impl Job {
    /// A job on `channel` expecting `syncpt_incrs` increments of `syncpoint`.
    pub fn new(
        channel: Arc<Channel>,
        syncpoint: Arc<Syncpoint>,
        class: ClassId,
        syncpt_incrs: u32,
    ) -> Self {
        Self {
            channel,
            syncpoint,
            class,
            syncpt_incrs,
            entries: Vec::new(),
            relocations: Vec::new(),
            timeout: None,
            flags: JobFlags::empty(),
            context: None,
            cache: None,
            release: None,
            state: JobState::Building,
            pins: Vec::new(),
            gather_addrs: Vec::new(),
            reloc_addrs: Vec::new(),
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn syncpoint(&self) -> &Arc<Syncpoint> {
        &self.syncpoint
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn syncpt_incrs(&self) -> u32 {
        self.syncpt_incrs
    }

    pub fn entries(&self) -> &[CommandEntry] {
        &self.entries
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn building(&self) -> Result<()> {
        if self.state == JobState::Building {
            Ok(())
        } else {
            Err(HostError::InvalidState("job is no longer being built"))
        }
    }

    pub fn add_gather(&mut self, bo: Arc<dyn HostBo>, offset: u64, words: u32) -> Result<()> {
        self.building()?;
        if words == 0 || words > MAX_GATHER_WORDS {
            return Err(HostError::InvalidParameter(format!("gather of {} words", words)));
        }
        let end = offset.checked_add(u64::from(words) * 4);
        if offset % 4 != 0 || end.map_or(true, |end| end > bo.size()) {
            return Err(HostError::InvalidParameter(format!(
                "gather 0x{:X}+{} words outside bo[{}] of 0x{:X} bytes",
                offset,
                words,
                bo.id(),
                bo.size()
            )));
        }
        self.entries.push(CommandEntry::Gather { bo, offset, words });
        Ok(())
    }

    pub fn add_wait(&mut self, syncpoint: SyncpointId, threshold: u32, base: Option<u32>) -> Result<()> {
        self.building()?;
        if let Some(base) = base {
            if syncpoint > 0xFF || threshold > 0xFFFF || base > 0xFF {
                return Err(HostError::InvalidParameter(format!(
                    "base-relative wait {} >= base[{}]+{} out of encoding range",
                    syncpoint, base, threshold
                )));
            }
        }
        self.entries.push(CommandEntry::Wait {
            syncpoint,
            threshold,
            base,
        });
        Ok(())
    }

    pub fn add_register_write(&mut self, class: ClassId, offset: u32, value: u32) -> Result<()> {
        self.building()?;
        if offset > 0xFFF || class > 0x3FF {
            return Err(HostError::InvalidParameter(format!(
                "register 0x{:X}:0x{:X} out of encoding range",
                class, offset
            )));
        }
        self.entries.push(CommandEntry::RegisterWrite {
            class,
            offset,
            value,
        });
        Ok(())
    }

    pub fn add_relocation(&mut self, reloc: Relocation) -> Result<()> {
        self.building()?;
        let site_ok = reloc.cmdbuf_offset % 4 == 0
            && reloc
                .cmdbuf_offset
                .checked_add(4)
                .map_or(false, |end| end <= reloc.cmdbuf.size());
        if !site_ok || reloc.target_offset > reloc.target.size() || reloc.shift >= 32 {
            return Err(HostError::InvalidParameter(format!(
                "relocation at bo[{}]+0x{:X} to bo[{}]+0x{:X}",
                reloc.cmdbuf.id(),
                reloc.cmdbuf_offset,
                reloc.target.id(),
                reloc.target_offset
            )));
        }
        self.relocations.push(reloc);
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Flags are fixed once the job is pinned.
    pub fn set_flags(&mut self, flags: JobFlags) {
        if self.state != JobState::Building {
            log::warn!("job: flags changed after pin ignored");
            return;
        }
        self.flags = flags;
    }

    /// Map relocation targets through `ctx` instead of the engine device.
    pub fn set_memory_context(&mut self, ctx: Option<Arc<MemoryContext>>) {
        self.context = ctx;
    }

    /// Mapping cache for relocation targets on the engine device.
    pub fn set_cache(&mut self, cache: Option<Arc<BoCache>>) {
        self.cache = cache;
    }

    pub fn set_release_callback(&mut self, callback: impl FnOnce(&FenceResult) + Send + 'static) {
        self.release = Some(Box::new(callback));
    }

    /// Pin relocation targets for `device` (or the memory context) and
    /// gathers for the host. Everything pinned is released again on error.
    pub fn pin(&mut self, host: &Host, device: &Arc<DmaDevice>) -> Result<()> {
        self.building()?;
        match self.pin_all(host, device) {
            Ok(()) => {
                self.state = JobState::Pinned;
                log::trace!(
                    "job: pinned {} mappings for channel {}",
                    self.pins.len(),
                    self.channel.id()
                );
                Ok(())
            }
            Err(e) => {
                self.unpin_all();
                Err(e)
            }
        }
    }

    fn pin_all(&mut self, host: &Host, device: &Arc<DmaDevice>) -> Result<()> {
        for reloc in &self.relocations {
            let mapping = match &self.context {
                Some(ctx) => host.contexts().map_buffer(ctx, &reloc.target, reloc.direction)?,
                None => bo::pin(device, &reloc.target, reloc.direction, self.cache.as_ref())?,
            };
            self.reloc_addrs.push(mapping.addr() + reloc.target_offset);
            self.pins.push(mapping);
        }

        if self.flags.contains(JobFlags::FIREWALL) {
            return Ok(());
        }
        for entry in &self.entries {
            if let CommandEntry::Gather { bo, offset, .. } = entry {
                let mapping = bo::pin(
                    host.device(),
                    bo,
                    DmaDirection::ToDevice,
                    Some(host.gather_cache()),
                )?;
                let addr = mapping.addr() + offset;
                self.pins.push(mapping);
                if addr > u64::from(u32::MAX) {
                    return Err(HostError::MappingFailed(format!(
                        "gather at 0x{:X} beyond 32-bit reach",
                        addr
                    )));
                }
                self.gather_addrs.push(addr);
            }
        }
        Ok(())
    }

    fn unpin_all(&mut self) {
        for mapping in self.pins.drain(..) {
            bo::unpin(&mapping);
        }
        self.gather_addrs.clear();
        self.reloc_addrs.clear();
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if !self.pins.is_empty() {
            log::trace!("job: dropped with {} pins", self.pins.len());
            self.unpin_all();
        }
    }
}

// ── Command stream construction ──────────────────────────────────────────

/// Firewall copy of a job's gathers.
struct GatherCopy {
    bo: Arc<dyn HostBo>,
    mapping: Arc<BoMapping>,
}

struct Stream {
    slots: Vec<Slot>,
    copy: Option<GatherCopy>,
}

fn reloc_value(addr: DmaAddr, shift: u32) -> u32 {
    (addr >> shift) as u32
}

fn build_stream(host: &Host, job: &Job) -> Result<Stream> {
    let firewall = job.flags.contains(JobFlags::FIREWALL);
    let allow = host.allow_list();
    let mut fw = Firewall::new(&allow, job.class, job.syncpoint.id(), job.syncpt_incrs)
        .with_base(job.syncpoint.base());

    let mut slots = vec![[opcode::setclass(job.class, 0, 0), NOP]];
    let mut current = Some(job.class);
    let mut copy_words: Vec<u32> = Vec::new();
    let mut copy_slots: Vec<(usize, usize)> = Vec::new();
    let mut relocs_used = vec![false; job.relocations.len()];
    let mut gather_index = 0;
    let mut pos = 0usize;

    for entry in &job.entries {
        match entry {
            CommandEntry::Gather { bo, offset, words } => {
                if current != Some(job.class) {
                    slots.push([opcode::setclass(job.class, 0, 0), NOP]);
                    if firewall {
                        fw.set_class(job.class, pos)?;
                    }
                }
                if firewall {
                    let mut data = bo.read_words(*offset, *words as usize)?;
                    let end = offset + u64::from(*words) * 4;
                    let mut sites = HashSet::new();
                    for (i, reloc) in job.relocations.iter().enumerate() {
                        let inside = reloc.cmdbuf.id() == bo.id()
                            && reloc.cmdbuf_offset >= *offset
                            && reloc.cmdbuf_offset < end;
                        if inside {
                            let index = ((reloc.cmdbuf_offset - offset) / 4) as usize;
                            sites.insert(index);
                            relocs_used[i] = true;
                            data[index] = reloc_value(job.reloc_addrs[i], reloc.shift);
                        }
                    }
                    fw.validate_gather(&data, pos, &sites)?;
                    copy_slots.push((slots.len(), copy_words.len()));
                    copy_words.extend_from_slice(&data);
                    slots.push([opcode::gather(*words), 0]);
                } else {
                    slots.push([opcode::gather(*words), job.gather_addrs[gather_index] as u32]);
                }
                gather_index += 1;
                pos += *words as usize;
                current = None;
            }
            CommandEntry::Wait {
                syncpoint,
                threshold,
                base,
            } => {
                match base {
                    Some(base) => slots.push([
                        opcode::setclass(class::HOST1X, opcode::host_reg::WAIT_SYNCPT_BASE, 1),
                        opcode::wait_syncpt_base(*syncpoint, *base, *threshold),
                    ]),
                    None => slots.extend(wait_slots(*syncpoint, *threshold)),
                }
                if firewall {
                    fw.set_class(class::HOST1X, pos)?;
                }
                current = Some(class::HOST1X);
                pos += 2;
            }
            CommandEntry::RegisterWrite {
                class: write_class,
                offset,
                value,
            } => {
                if firewall {
                    fw.validate_write(*write_class, *offset, *value, pos)?;
                }
                slots.push([opcode::setclass(*write_class, *offset, 1), *value]);
                current = Some(*write_class);
                pos += 2;
            }
        }
    }

    if firewall {
        if let Some(i) = relocs_used.iter().position(|used| !used) {
            return Err(HostError::invalid_command(
                0,
                format!(
                    "relocation at bo[{}]+0x{:X} outside every gather",
                    job.relocations[i].cmdbuf.id(),
                    job.relocations[i].cmdbuf_offset
                ),
            ));
        }
    } else {
        for (reloc, &addr) in job.relocations.iter().zip(&job.reloc_addrs) {
            reloc
                .cmdbuf
                .write_u32(reloc.cmdbuf_offset, reloc_value(addr, reloc.shift))?;
        }
    }

    let copy = if copy_words.is_empty() {
        None
    } else {
        let bo: Arc<dyn HostBo> = SysmemBo::with_words(host.memory(), &copy_words)?;
        let mapping = bo::pin(host.device(), &bo, DmaDirection::ToDevice, None)?;
        let base = mapping.addr();
        if base + copy_words.len() as u64 * 4 > 1 << 32 {
            bo::unpin(&mapping);
            return Err(HostError::MappingFailed("gather copy beyond 32-bit reach".into()));
        }
        for &(slot, word) in &copy_slots {
            slots[slot][1] = (base + word as u64 * 4) as u32;
        }
        Some(GatherCopy { bo, mapping })
    };

    Ok(Stream { slots, copy })
}

// ── In-flight jobs ───────────────────────────────────────────────────────

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct JobResources {
    pins: Vec<Arc<BoMapping>>,
    copy: Option<GatherCopy>,
    context: Option<Arc<MemoryContext>>,
    release: Option<ReleaseCallback>,
}

struct JobStatus {
    state: JobState,
    outcome: Option<FenceResult>,
}

/// A job owned by a channel's sync queue.
pub struct SubmittedJob {
    id: u64,
    channel: Arc<Channel>,
    syncpoint: Arc<Syncpoint>,
    syncpt_incrs: u32,
    syncpt_end: u32,
    timeout: Duration,
    flags: JobFlags,
    fence: Fence,
    first_slot: u32,
    slots: Vec<Slot>,
    submitted_at: Instant,
    cancelled: AtomicBool,
    recovered: AtomicBool,
    status: Mutex<JobStatus>,
    done: Condvar,
    resources: Mutex<JobResources>,
}

impl SubmittedJob {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn syncpoint(&self) -> &Arc<Syncpoint> {
        &self.syncpoint
    }

    pub fn syncpt_incrs(&self) -> u32 {
        self.syncpt_incrs
    }

    pub fn syncpt_end(&self) -> u32 {
        self.syncpt_end
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn first_slot(&self) -> u32 {
        self.first_slot
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    pub fn state(&self) -> JobState {
        self.status.lock().state
    }

    pub fn outcome(&self) -> Option<FenceResult> {
        self.status.lock().outcome.clone()
    }

    pub(crate) fn mark_timed_out(&self, recovered: bool) {
        self.cancelled.store(true, Ordering::Release);
        self.recovered.store(recovered, Ordering::Release);
        self.status.lock().state = JobState::TimedOut;
    }

    /// Release everything the job holds and report its outcome.
    pub(crate) fn complete(&self, host: &Host) {
        let outcome: FenceResult = if self.is_recovered() {
            Err(HostError::TimedOut)
        } else {
            Ok(())
        };
        {
            let mut status = self.status.lock();
            if status.state == JobState::Released {
                return;
            }
            if status.state != JobState::TimedOut || !self.is_recovered() {
                status.state = if outcome.is_ok() {
                    JobState::Completed
                } else {
                    JobState::TimedOut
                };
            }
            status.outcome = Some(outcome.clone());
        }
        self.finish(host, outcome);
    }

    /// Fail the job without waiting for hardware.
    pub(crate) fn abort(&self, host: &Host, error: HostError) {
        self.cancelled.store(true, Ordering::Release);
        self.fence.cancel(error.clone());
        {
            let mut status = self.status.lock();
            if status.state == JobState::Released {
                return;
            }
            status.outcome = Some(Err(error.clone()));
        }
        self.finish(host, Err(error));
    }

    fn finish(&self, host: &Host, outcome: FenceResult) {
        let resources = std::mem::take(&mut *self.resources.lock());
        for mapping in &resources.pins {
            bo::unpin(mapping);
        }
        if let Some(copy) = &resources.copy {
            bo::unpin(&copy.mapping);
            log::trace!("job {}: gather copy bo[{}] freed", self.id, copy.bo.id());
        }
        drop(resources.context);

        if let Err(e) = host.syncpoints().release(&self.syncpoint) {
            log::warn!("job {}: syncpoint[{}] release: {}", self.id, self.syncpoint.id(), e);
        }
        host.channels().put(&self.channel);

        log::debug!(
            "job {}: {} after {:?}",
            self.id,
            if outcome.is_ok() { "completed" } else { "failed" },
            self.submitted_at.elapsed()
        );
        if let Some(callback) = resources.release {
            callback(&outcome);
        }
        self.status.lock().state = JobState::Released;
        self.done.notify_all();
    }
}

/// Client view of a submitted job.
#[derive(Clone)]
pub struct JobHandle(Arc<SubmittedJob>);

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> JobState {
        self.0.state()
    }

    /// `Ok(())` on completion, the error on failure, `None` while in flight.
    pub fn outcome(&self) -> Option<FenceResult> {
        self.0.outcome()
    }

    pub fn fence(&self) -> &Fence {
        &self.0.fence
    }

    pub fn syncpoint(&self) -> SyncpointId {
        self.0.syncpoint.id()
    }

    /// Syncpoint value at which the job is complete.
    pub fn syncpt_end(&self) -> u32 {
        self.0.syncpt_end
    }

    /// First ring slot and slot count.
    pub fn slots(&self) -> (u32, u32) {
        (self.0.first_slot, self.0.num_slots())
    }

    /// Slots pushed for the job, for diagnostics.
    pub fn commands(&self) -> &[Slot] {
        &self.0.slots
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Block until the job has been released. Returns its outcome.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut status = self.0.status.lock();
        while status.state != JobState::Released {
            if self.0.done.wait_until(&mut status, deadline).timed_out()
                && status.state != JobState::Released
            {
                return Err(HostError::TimedOut);
            }
        }
        status.outcome.clone().unwrap_or(Ok(()))
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.0.id)
            .field("channel", &self.0.channel())
            .field("syncpoint", &self.0.syncpoint.id())
            .field("syncpt_end", &self.0.syncpt_end)
            .field("state", &self.state())
            .finish()
    }
}

// ── Submission ───────────────────────────────────────────────────────────

impl Host {
    /// Validate, patch and queue a pinned job. The returned handle resolves
    /// once the job's syncpoint threshold is reached or the job times out.
    pub fn submit(self: &Arc<Self>, mut job: Job) -> Result<JobHandle> {
        match job.state {
            JobState::Pinned => {}
            JobState::Building => return Err(HostError::InvalidState("job not pinned")),
            _ => return Err(HostError::InvalidState("job already submitted")),
        }
        if self.is_suspended() {
            return Err(HostError::InvalidState("host suspended"));
        }
        let timeout = job.timeout.unwrap_or_else(|| self.settings().default_job_timeout());
        let stream = build_stream(self, &job)?;

        let channel = job.channel.clone();
        let _submit = channel.lock_submit();
        let syncpoint = self.syncpoints().get(&job.syncpoint)?;
        let channel_ref = match self.channels().get(&channel) {
            Ok(channel_ref) => channel_ref,
            Err(e) => {
                self.release_syncpoint(&syncpoint);
                return Err(e);
            }
        };

        let mut resources = JobResources {
            pins: std::mem::take(&mut job.pins),
            copy: stream.copy,
            context: job.context.clone(),
            release: job.release.take(),
        };
        let mut taken = None;
        let request = CdmaRequest {
            syncpoint: &syncpoint,
            incrs: job.syncpt_incrs,
            class: job.class,
            serialize: job.flags.contains(JobFlags::SERIALIZE),
            timeout,
            body: &stream.slots,
        };
        let result = channel.cdma().submit(self, request, |placement: CdmaPlacement| {
            let submitted = Arc::new(SubmittedJob {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                channel: channel_ref.clone(),
                syncpoint: syncpoint.clone(),
                syncpt_incrs: job.syncpt_incrs,
                syncpt_end: placement.syncpt_end,
                timeout,
                flags: job.flags,
                fence: placement.fence,
                first_slot: placement.first_slot,
                slots: placement.slots,
                submitted_at: Instant::now(),
                cancelled: AtomicBool::new(false),
                recovered: AtomicBool::new(false),
                status: Mutex::new(JobStatus {
                    state: JobState::Submitted,
                    outcome: None,
                }),
                done: Condvar::new(),
                resources: Mutex::new(std::mem::take(&mut resources)),
            });
            taken = Some(());
            submitted
        });

        let submitted = match result {
            Ok(submitted) => submitted,
            Err(e) => {
                if taken.is_none() {
                    // Hand the pins back so dropping the job releases them.
                    job.pins = std::mem::take(&mut resources.pins);
                    if let Some(copy) = resources.copy.take() {
                        bo::unpin(&copy.mapping);
                    }
                }
                self.release_syncpoint(&syncpoint);
                self.channels().put(&channel_ref);
                log::debug!("job: submit on channel {} failed: {}", channel.id(), e);
                return Err(e);
            }
        };
        job.state = JobState::Submitted;

        let weak = Arc::downgrade(self);
        let channel_id = channel.id();
        submitted.fence.add_callback(move |_| {
            if let Some(host) = weak.upgrade() {
                host.schedule_update(channel_id);
            }
        });
        Ok(JobHandle(submitted))
    }

    fn release_syncpoint(&self, sp: &Arc<Syncpoint>) {
        if let Err(e) = self.syncpoints().release(sp) {
            log::warn!("job: syncpoint[{}] release: {}", sp.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{HostHardware, SimHardware};
    use crate::memory::PhysicalMemory;
    use crate::opcode::{host_reg, incr_syncpt, setclass, SyncptCond};
    use crate::syncpoint::SyncpointFlags;
    use nvhost_common::settings::Settings;

    struct Fixture {
        hw: Arc<SimHardware>,
        mem: Arc<PhysicalMemory>,
        host: Arc<Host>,
        channel: Arc<Channel>,
        syncpoint: Arc<Syncpoint>,
        engine: Arc<DmaDevice>,
    }

    fn fixture(iommu: bool) -> Fixture {
        let hw = Arc::new(SimHardware::new(64, 8, 4));
        let mem = Arc::new(PhysicalMemory::default());
        let settings = Settings {
            num_syncpoints: 64,
            num_syncpoint_bases: 8,
            num_channels: 4,
            push_buffer_slots: 64,
            iommu,
            ..Settings::default()
        };
        let host = Host::new(settings, hw.clone(), mem.clone()).unwrap();
        let channel = host.channels().request("gr2d").unwrap();
        let syncpoint = host
            .syncpoints()
            .allocate("gr2d", SyncpointFlags::empty(), "gr2d_0")
            .unwrap();
        let engine = host.create_device("gr2d", iommu);
        Fixture {
            hw,
            mem,
            host,
            channel,
            syncpoint,
            engine,
        }
    }

    fn incr_words(id: SyncpointId, n: usize) -> Vec<u32> {
        let mut words = Vec::new();
        for _ in 0..n {
            words.push(setclass(class::HOST1X, host_reg::INCR_SYNCPT, 1));
            words.push(incr_syncpt(SyncptCond::OpDone, id));
        }
        words
    }

    fn job_with_incrs(f: &Fixture, n: u32) -> Job {
        let cmdbuf: Arc<dyn HostBo> =
            SysmemBo::with_words(&f.mem, &incr_words(f.syncpoint.id(), n as usize)).unwrap();
        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, n);
        job.add_gather(cmdbuf, 0, n * 2).unwrap();
        job
    }

    #[test]
    fn test_builder_validation() {
        let f = fixture(false);
        let bo: Arc<dyn HostBo> = SysmemBo::new(&f.mem, 64).unwrap();
        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 1);
        assert!(job.add_gather(bo.clone(), 0, 17).is_err());
        assert!(job.add_gather(bo.clone(), 2, 1).is_err());
        assert!(job.add_gather(bo.clone(), 0, 0).is_err());
        assert!(job.add_gather(bo.clone(), 60, 1).is_ok());
        assert!(job.add_wait(300, 1, Some(0)).is_err());
        assert!(job.add_wait(300, 1, None).is_ok());
        assert!(job.add_register_write(class::GR2D, 0x1000, 0).is_err());
        let reloc = Relocation {
            cmdbuf: bo.clone(),
            cmdbuf_offset: 62,
            target: bo.clone(),
            target_offset: 0,
            shift: 0,
            direction: DmaDirection::ToDevice,
        };
        assert!(job.add_relocation(reloc).is_err());
        let reloc = Relocation {
            cmdbuf: bo.clone(),
            cmdbuf_offset: u64::MAX - 3,
            target: bo.clone(),
            target_offset: 0,
            shift: 0,
            direction: DmaDirection::ToDevice,
        };
        assert!(matches!(
            job.add_relocation(reloc),
            Err(HostError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_submit_requires_pin() {
        let f = fixture(false);
        let job = job_with_incrs(&f, 1);
        assert_eq!(
            f.host.submit(job).err(),
            Some(HostError::InvalidState("job not pinned"))
        );
    }

    #[test]
    fn test_job_completes_and_releases() {
        let f = fixture(true);
        let released = Arc::new(Mutex::new(None));
        let seen = released.clone();
        let mut job = job_with_incrs(&f, 3);
        job.set_release_callback(move |outcome| *seen.lock() = Some(outcome.clone()));
        job.pin(&f.host, &f.engine).unwrap();
        assert_eq!(f.host.gather_cache().len(), 1);

        let handle = f.host.submit(job).unwrap();
        assert_eq!(handle.syncpt_end(), 3);
        assert_eq!(f.syncpoint.max(), 3);
        assert_eq!(handle.state(), JobState::Submitted);

        f.hw.run_all();
        handle.wait(Duration::from_secs(2)).unwrap();
        assert_eq!(handle.state(), JobState::Released);
        assert_eq!(handle.outcome(), Some(Ok(())));
        assert_eq!(*released.lock(), Some(Ok(())));
        assert_eq!(f.syncpoint.min(), 3);
        assert!(f.host.gather_cache().is_empty());
        assert!(f.channel.cdma().is_idle());
        assert_eq!(f.channel.cdma().free_slots(), f.channel.cdma().capacity());
    }

    #[test]
    fn test_relocation_is_patched() {
        let f = fixture(false);
        let target: Arc<dyn HostBo> = SysmemBo::new_contiguous(&f.mem, 0x1000).unwrap();
        let mut words = vec![opcode::incr(0x2b, 1), 0xDEAD_BEEF];
        words.extend(incr_words(f.syncpoint.id(), 1));
        let cmdbuf: Arc<dyn HostBo> = SysmemBo::with_words(&f.mem, &words).unwrap();

        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 1);
        job.add_gather(cmdbuf.clone(), 0, words.len() as u32).unwrap();
        job.add_relocation(Relocation {
            cmdbuf: cmdbuf.clone(),
            cmdbuf_offset: 4,
            target: target.clone(),
            target_offset: 0x100,
            shift: 8,
            direction: DmaDirection::Bidirectional,
        })
        .unwrap();
        job.pin(&f.host, &f.engine).unwrap();
        let handle = f.host.submit(job).unwrap();

        let phys = target.sg_table().unwrap().segments()[0].addr;
        assert_eq!(cmdbuf.read_u32(4).unwrap(), ((phys + 0x100) >> 8) as u32);
        f.hw.run_all();
        handle.wait(Duration::from_secs(2)).unwrap();
        let patched = f
            .hw
            .register_writes(f.channel.id())
            .into_iter()
            .find(|w| w.class == class::GR2D && w.offset == 0x2b)
            .unwrap();
        assert_eq!(patched.value, ((phys + 0x100) >> 8) as u32);
    }

    #[test]
    fn test_firewall_copies_and_rejects() {
        let f = fixture(false);
        let mut words = vec![opcode::incr(0x2b, 1), 0];
        words.extend(incr_words(f.syncpoint.id(), 1));
        let cmdbuf: Arc<dyn HostBo> = SysmemBo::with_words(&f.mem, &words).unwrap();
        let target: Arc<dyn HostBo> = SysmemBo::new_contiguous(&f.mem, 0x1000).unwrap();

        // Address register without a relocation.
        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 1);
        job.set_flags(JobFlags::FIREWALL);
        job.add_gather(cmdbuf.clone(), 0, words.len() as u32).unwrap();
        job.pin(&f.host, &f.engine).unwrap();
        assert!(matches!(
            f.host.submit(job),
            Err(HostError::InvalidCommand { .. })
        ));
        assert_eq!(f.syncpoint.max(), 0);

        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 1);
        job.set_flags(JobFlags::FIREWALL);
        job.add_gather(cmdbuf.clone(), 0, words.len() as u32).unwrap();
        job.add_relocation(Relocation {
            cmdbuf: cmdbuf.clone(),
            cmdbuf_offset: 4,
            target,
            target_offset: 0,
            shift: 0,
            direction: DmaDirection::FromDevice,
        })
        .unwrap();
        job.pin(&f.host, &f.engine).unwrap();
        let handle = f.host.submit(job).unwrap();
        // The client's buffer is left alone; the copy carries the patch.
        assert_eq!(cmdbuf.read_u32(4).unwrap(), 0);
        assert!(f.host.gather_cache().is_empty());
        f.hw.run_all();
        assert_eq!(handle.wait(Duration::from_secs(2)), Ok(()));
    }

    #[test]
    fn test_serialized_jobs_wait_for_predecessor() {
        let f = fixture(false);
        let other = f
            .host
            .syncpoints()
            .allocate("vic", SyncpointFlags::empty(), "vic_0")
            .unwrap();

        // Job A on another syncpoint: blocked until its syncpoint is bumped externally.
        let gate = f
            .host
            .syncpoints()
            .allocate("gate", SyncpointFlags::CLIENT_MANAGED, "gate")
            .unwrap();
        let mut a = Job::new(f.channel.clone(), other.clone(), class::GR2D, 1);
        a.add_wait(gate.id(), 1, None).unwrap();
        let cmd: Arc<dyn HostBo> = SysmemBo::with_words(&f.mem, &incr_words(other.id(), 1)).unwrap();
        a.add_gather(cmd, 0, 2).unwrap();
        a.pin(&f.host, &f.engine).unwrap();
        let a = f.host.submit(a).unwrap();

        let mut b = job_with_incrs(&f, 2);
        b.set_flags(JobFlags::SERIALIZE);
        b.pin(&f.host, &f.engine).unwrap();
        let b = f.host.submit(b).unwrap();
        // Own syncpoint at 0 plus the foreign predecessor.
        assert_eq!(b.commands().len(), 1 + 4 + 1);

        f.hw.run_all();
        assert!(!a.fence().is_signaled());
        assert!(!b.fence().is_signaled());

        f.host.syncpoints().cpu_increment(&gate);
        f.hw.run_all();
        a.wait(Duration::from_secs(2)).unwrap();
        b.wait(Duration::from_secs(2)).unwrap();
        assert!(a.fence().timestamp() <= b.fence().timestamp());
    }

    #[test]
    fn test_serialized_firewalled_gather_runs_in_engine_class() {
        let f = fixture(false);
        let mut words = vec![opcode::incr(0x0b, 1), opcode::load_syncpt_base(0, 0xDEAD)];
        words.extend(incr_words(f.syncpoint.id(), 1));
        let cmdbuf: Arc<dyn HostBo> = SysmemBo::with_words(&f.mem, &words).unwrap();

        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 1);
        job.set_flags(JobFlags::FIREWALL | JobFlags::SERIALIZE);
        job.add_gather(cmdbuf, 0, words.len() as u32).unwrap();
        job.pin(&f.host, &f.engine).unwrap();
        let handle = f.host.submit(job).unwrap();
        f.hw.run_all();
        handle.wait(Duration::from_secs(2)).unwrap();

        let writes: Vec<_> = f
            .hw
            .register_writes(f.channel.id())
            .into_iter()
            .filter(|w| w.offset == 0x0b)
            .collect();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].class, class::GR2D);
        assert_eq!(f.hw.syncpoint_base_read(0), 0);
    }

    #[test]
    fn test_serialized_job_on_shared_syncpoint() {
        let f = fixture(false);
        let second = f.host.channels().request("gr2d").unwrap();
        let gate = f
            .host
            .syncpoints()
            .allocate("gate", SyncpointFlags::CLIENT_MANAGED, "gate")
            .unwrap();
        let engine_job = |channel: &Arc<Channel>, value: u32, gate: Option<SyncpointId>| {
            let mut words = vec![opcode::incr(0x10, 1), value];
            words.extend(incr_words(f.syncpoint.id(), 5));
            let cmd: Arc<dyn HostBo> = SysmemBo::with_words(&f.mem, &words).unwrap();
            let mut job = Job::new(channel.clone(), f.syncpoint.clone(), class::GR2D, 5);
            if let Some(gate) = gate {
                job.add_wait(gate, 1, None).unwrap();
            }
            job.add_gather(cmd, 0, words.len() as u32).unwrap();
            job
        };

        // A ends at 5 but only starts once the gate opens.
        let mut a = engine_job(&f.channel, 0xA, Some(gate.id()));
        a.pin(&f.host, &f.engine).unwrap();
        let a = f.host.submit(a).unwrap();
        assert_eq!(a.syncpt_end(), 5);

        // B on another channel, serialized behind A, ends at 10.
        let mut b = engine_job(&second, 0xB, None);
        b.set_flags(JobFlags::SERIALIZE);
        b.pin(&f.host, &f.engine).unwrap();
        let b = f.host.submit(b).unwrap();
        assert_eq!(b.syncpt_end(), 10);

        let at5 = f.host.create_fence(&f.syncpoint, 5).unwrap();
        let at7 = f.host.create_fence(&f.syncpoint, 7).unwrap();

        f.hw.run_all();
        assert!(!at5.is_signaled());
        assert!(!at7.is_signaled());
        assert!(f
            .hw
            .register_writes(second.id())
            .iter()
            .all(|w| w.offset != 0x10));

        f.host.syncpoints().cpu_increment(&gate);
        f.hw.run_all();
        a.wait(Duration::from_secs(2)).unwrap();
        b.wait(Duration::from_secs(2)).unwrap();
        at5.wait(Duration::from_secs(2)).unwrap();
        at7.wait(Duration::from_secs(2)).unwrap();
        assert!(at5.timestamp() <= at7.timestamp());

        for (channel, value) in [(f.channel.id(), 0xA), (second.id(), 0xB)] {
            let engine_writes: Vec<_> = f
                .hw
                .register_writes(channel)
                .into_iter()
                .filter(|w| w.offset == 0x10)
                .collect();
            assert_eq!(
                engine_writes,
                vec![crate::hw::RegisterWrite {
                    class: class::GR2D,
                    offset: 0x10,
                    value,
                }]
            );
        }
        f.host.channels().put(&second);
    }

    #[test]
    fn test_oversized_job_rejected() {
        let f = fixture(false);
        let cmd: Arc<dyn HostBo> = SysmemBo::new(&f.mem, 0x1000).unwrap();
        let mut job = Job::new(f.channel.clone(), f.syncpoint.clone(), class::GR2D, 0);
        for _ in 0..70 {
            job.add_gather(cmd.clone(), 0, 1).unwrap();
        }
        job.pin(&f.host, &f.engine).unwrap();
        assert!(matches!(f.host.submit(job), Err(HostError::InvalidParameter(_))));
        assert!(f.host.gather_cache().is_empty());
        assert_eq!(f.syncpoint.max(), 0);
    }

    #[test]
    fn test_dropping_pinned_job_unpins() {
        let f = fixture(true);
        let target: Arc<dyn HostBo> = SysmemBo::new(&f.mem, 0x2000).unwrap();
        let mut job = job_with_incrs(&f, 1);
        let cmdbuf = match &job.entries()[0] {
            CommandEntry::Gather { bo, .. } => bo.clone(),
            _ => unreachable!(),
        };
        job.add_relocation(Relocation {
            cmdbuf,
            cmdbuf_offset: 0,
            target,
            target_offset: 0,
            shift: 0,
            direction: DmaDirection::ToDevice,
        })
        .unwrap();
        job.pin(&f.host, &f.engine).unwrap();
        assert_eq!(f.engine.mapped_pages(), 2);
        drop(job);
        assert_eq!(f.engine.mapped_pages(), 0);
        assert!(f.host.gather_cache().is_empty());
    }
}
