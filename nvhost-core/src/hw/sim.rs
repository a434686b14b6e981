// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Simulated host1x.
//!
//! Models the syncpoint register file, threshold interrupts and one command
//! processor per channel. Channels only execute when `run_channel` or
//! `run_all` is called (or a `SimExecutor` is running), which lets tests
//! stand in for a hung engine by simply not running it.
//!
//! Increments that cross an enabled threshold latch the status bit and call
//! the installed interrupt handler on the incrementing thread. Enabling an
//! interrupt whose threshold is already met only latches the status bit.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use nvhost_common::{class, ChannelId, ClassId, DmaAddr, SyncpointId, SYNCPOINTS_PER_LINE};
use parking_lot::{Mutex, RwLock};

use super::{HostHardware, InterruptHandler};
use crate::device::DmaDevice;
use crate::opcode::{self, host_reg, Opcode};
use crate::syncpoint::syncpoint_reached;

/// A register write executed by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub class: ClassId,
    pub offset: u32,
    pub value: u32,
}

/// Opcode whose data words are still being consumed.
#[derive(Debug, Clone, Copy)]
struct Pending {
    op: Opcode,
    index: u32,
}

#[derive(Debug, Clone, Copy)]
struct GatherCursor {
    addr: DmaAddr,
    remaining: u32,
}

#[derive(Default)]
struct SimChannel {
    base: DmaAddr,
    size: u32,
    get: u32,
    put: u32,
    running: bool,
    frozen: bool,
    class: ClassId,
    payload: u32,
    pending: Option<Pending>,
    gather: Option<GatherCursor>,
    blocked: Option<(SyncpointId, u32)>,
    stream_id: Option<u32>,
    writes: Vec<RegisterWrite>,
    fault: Option<String>,
}

impl SimChannel {
    fn reset_fetch(&mut self) {
        self.pending = None;
        self.gather = None;
        self.blocked = None;
    }
}

pub struct SimHardware {
    syncpoints: Box<[AtomicU32]>,
    thresholds: Box<[AtomicU32]>,
    int_enabled: Box<[AtomicBool]>,
    int_status: Box<[AtomicU32]>,
    bases: Box<[AtomicU32]>,
    channels: Box<[Mutex<SimChannel>]>,
    handler: RwLock<Option<InterruptHandler>>,
    dma: RwLock<Option<Arc<DmaDevice>>>,
}

fn atomics(count: u32) -> Box<[AtomicU32]> {
    (0..count).map(|_| AtomicU32::new(0)).collect()
}

impl SimHardware {
    pub fn new(num_syncpoints: u32, num_bases: u32, num_channels: u32) -> Self {
        let lines = num_syncpoints.div_ceil(SYNCPOINTS_PER_LINE);
        Self {
            syncpoints: atomics(num_syncpoints),
            thresholds: atomics(num_syncpoints),
            int_enabled: (0..num_syncpoints).map(|_| AtomicBool::new(false)).collect(),
            int_status: atomics(lines),
            bases: atomics(num_bases),
            channels: (0..num_channels)
                .map(|_| Mutex::new(SimChannel::default()))
                .collect(),
            handler: RwLock::new(None),
            dma: RwLock::new(None),
        }
    }

    /// Execute channel `ch` until its ring drains or it blocks.
    /// Returns the number of words consumed.
    pub fn run_channel(&self, ch: ChannelId) -> usize {
        let Some(slot) = self.channels.get(ch as usize) else {
            return 0;
        };
        let Some(dma) = self.dma.read().clone() else {
            return 0;
        };
        let mut chan = slot.lock();
        if !chan.running || chan.frozen || chan.fault.is_some() {
            return 0;
        }

        let mut executed = 0;
        loop {
            if let Some((id, threshold)) = chan.blocked {
                if !syncpoint_reached(self.syncpoint_read(id), threshold) {
                    break;
                }
                chan.blocked = None;
            }
            let Some(word) = self.fetch(ch, &mut chan, &dma) else {
                break;
            };
            executed += 1;
            self.execute(ch, &mut chan, word);
            if chan.fault.is_some() {
                break;
            }
        }
        executed
    }

    /// Run every channel until none makes progress.
    pub fn run_all(&self) -> usize {
        let mut total = 0;
        loop {
            let progress: usize = (0..self.channels.len() as u32)
                .map(|ch| self.run_channel(ch))
                .sum();
            if progress == 0 {
                return total;
            }
            total += progress;
        }
    }

    /// Run all channels on a background thread every `period`.
    pub fn spawn_executor(self: &Arc<Self>, period: Duration) -> SimExecutor {
        let stop = Arc::new(AtomicBool::new(false));
        let hw = self.clone();
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name("sim-host1x".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    hw.run_all();
                    thread::sleep(period);
                }
            })
            .ok();
        if thread.is_none() {
            log::error!("sim: failed to spawn executor thread");
        }
        SimExecutor { stop, thread }
    }

    /// Register writes channel `ch` has executed so far.
    pub fn register_writes(&self, ch: ChannelId) -> Vec<RegisterWrite> {
        self.channels
            .get(ch as usize)
            .map(|c| c.lock().writes.clone())
            .unwrap_or_default()
    }

    /// Whether channel `ch` is waiting on a syncpoint.
    pub fn is_blocked(&self, ch: ChannelId) -> bool {
        self.channels
            .get(ch as usize)
            .map_or(false, |c| c.lock().blocked.is_some())
    }

    pub fn is_running(&self, ch: ChannelId) -> bool {
        self.channels
            .get(ch as usize)
            .map_or(false, |c| c.lock().running)
    }

    pub fn is_frozen(&self, ch: ChannelId) -> bool {
        self.channels
            .get(ch as usize)
            .map_or(false, |c| c.lock().frozen)
    }

    /// Fetch error that stopped channel `ch`, if any.
    pub fn channel_fault(&self, ch: ChannelId) -> Option<String> {
        self.channels
            .get(ch as usize)
            .and_then(|c| c.lock().fault.clone())
    }

    pub fn stream_id(&self, ch: ChannelId) -> Option<u32> {
        self.channels
            .get(ch as usize)
            .and_then(|c| c.lock().stream_id)
    }

    pub fn threshold_interrupt_enabled(&self, id: SyncpointId) -> bool {
        self.int_enabled
            .get(id as usize)
            .map_or(false, |e| e.load(Ordering::Acquire))
    }

    // ── Command processor ────────────────────────────────────────────────

    fn fetch(&self, ch: ChannelId, chan: &mut SimChannel, dma: &DmaDevice) -> Option<u32> {
        if let Some(mut cursor) = chan.gather.take() {
            if cursor.remaining > 0 {
                let word = self.dma_read(ch, chan, dma, cursor.addr)?;
                cursor.addr += 4;
                cursor.remaining -= 1;
                if cursor.remaining > 0 {
                    chan.gather = Some(cursor);
                }
                return Some(word);
            }
        }

        if chan.get == chan.put || chan.size == 0 {
            return None;
        }
        let addr = chan.base + u64::from(chan.get);
        let word = self.dma_read(ch, chan, dma, addr)?;
        chan.get = (chan.get + 4) % chan.size;
        Some(word)
    }

    fn dma_read(
        &self,
        ch: ChannelId,
        chan: &mut SimChannel,
        dma: &DmaDevice,
        addr: DmaAddr,
    ) -> Option<u32> {
        let mut buf = [0u8; 4];
        match dma.read(addr, &mut buf) {
            Ok(()) => Some(LittleEndian::read_u32(&buf)),
            Err(e) => {
                log::error!("sim: channel {} fetch fault at 0x{:X}: {}", ch, addr, e);
                chan.fault = Some(e.to_string());
                None
            }
        }
    }

    fn execute(&self, ch: ChannelId, chan: &mut SimChannel, word: u32) {
        if let Some(pending) = chan.pending.take() {
            match pending.op {
                Opcode::Gather { count } => {
                    if count > 0 {
                        chan.gather = Some(GatherCursor {
                            addr: DmaAddr::from(word),
                            remaining: count,
                        });
                    }
                }
                op => {
                    if let Some(reg) = op.register_for(pending.index) {
                        self.write_register(ch, chan, reg, word);
                    }
                    if pending.index + 1 < op.data_words() {
                        chan.pending = Some(Pending {
                            op,
                            index: pending.index + 1,
                        });
                    }
                }
            }
            return;
        }

        let op = Opcode::decode(word);
        match op {
            Opcode::SetClass { class, .. } => chan.class = class,
            Opcode::Imm { offset, value } => self.write_register(ch, chan, offset, value),
            Opcode::Gather { .. } if chan.gather.is_some() => {
                chan.fault = Some("nested GATHER".into());
                log::error!("sim: channel {} nested GATHER", ch);
                return;
            }
            Opcode::Restart { .. } | Opcode::Extend { .. } | Opcode::Unknown(_) => {
                chan.fault = Some(format!("unsupported opcode 0x{:08X}", word));
                log::error!("sim: channel {} unsupported opcode 0x{:08X}", ch, word);
                return;
            }
            _ => {}
        }
        if op.data_words() > 0 {
            chan.pending = Some(Pending { op, index: 0 });
        }
    }

    fn write_register(&self, ch: ChannelId, chan: &mut SimChannel, offset: u32, value: u32) {
        log::trace!(
            "sim: channel {} write class=0x{:X} reg=0x{:X} value=0x{:X}",
            ch,
            chan.class,
            offset,
            value
        );
        chan.writes.push(RegisterWrite {
            class: chan.class,
            offset,
            value,
        });
        // Register 0 of every class is the syncpoint increment.
        if offset == host_reg::INCR_SYNCPT {
            self.syncpoint_increment(opcode::incr_syncpt_id(value));
            return;
        }
        if chan.class != class::HOST1X {
            return;
        }

        match offset {
            host_reg::LOAD_SYNCPT_PAYLOAD_32 => chan.payload = value,
            host_reg::WAIT_SYNCPT_32 => {
                let threshold = chan.payload;
                self.block_on(ch, chan, value, threshold);
            }
            host_reg::WAIT_SYNCPT_BASE => {
                let (id, base, offset) = opcode::decode_wait_syncpt_base(value);
                let threshold = self.syncpoint_base_read(base).wrapping_add(offset);
                self.block_on(ch, chan, id, threshold);
            }
            host_reg::LOAD_SYNCPT_BASE => {
                let (base, value) = opcode::decode_syncpt_base(value);
                self.syncpoint_base_write(base, value);
            }
            host_reg::INCR_SYNCPT_BASE => {
                let (base, offset) = opcode::decode_syncpt_base(value);
                let value = self.syncpoint_base_read(base).wrapping_add(offset);
                self.syncpoint_base_write(base, value);
            }
            _ => log::warn!("sim: channel {} unknown host register 0x{:X}", ch, offset),
        }
    }

    fn block_on(&self, ch: ChannelId, chan: &mut SimChannel, id: SyncpointId, threshold: u32) {
        if id as usize >= self.syncpoints.len() {
            chan.fault = Some(format!("wait on invalid syncpoint {}", id));
            return;
        }
        if !syncpoint_reached(self.syncpoint_read(id), threshold) {
            log::trace!("sim: channel {} waits syncpoint[{}] >= {}", ch, id, threshold);
            chan.blocked = Some((id, threshold));
        }
    }

    // ── Interrupt delivery ───────────────────────────────────────────────

    fn check_threshold(&self, id: SyncpointId, deliver: bool) {
        let idx = id as usize;
        if !self.int_enabled[idx].load(Ordering::Acquire) {
            return;
        }
        let value = self.syncpoints[idx].load(Ordering::Acquire);
        if !syncpoint_reached(value, self.thresholds[idx].load(Ordering::Acquire)) {
            return;
        }
        let line = id / SYNCPOINTS_PER_LINE;
        self.int_status[line as usize].fetch_or(1 << (id % SYNCPOINTS_PER_LINE), Ordering::AcqRel);
        if deliver {
            let handler = self.handler.read().clone();
            if let Some(handler) = handler {
                handler(line);
            }
        }
    }

    fn valid_syncpoint(&self, id: SyncpointId) -> bool {
        if (id as usize) < self.syncpoints.len() {
            true
        } else {
            log::warn!("sim: syncpoint out of range id={}", id);
            false
        }
    }

    fn with_channel(&self, ch: ChannelId, f: impl FnOnce(&mut SimChannel)) {
        match self.channels.get(ch as usize) {
            Some(chan) => f(&mut chan.lock()),
            None => log::warn!("sim: channel out of range id={}", ch),
        }
    }
}

impl HostHardware for SimHardware {
    fn name(&self) -> &str {
        "sim-host1x"
    }

    fn num_syncpoints(&self) -> u32 {
        self.syncpoints.len() as u32
    }

    fn num_syncpoint_bases(&self) -> u32 {
        self.bases.len() as u32
    }

    fn num_channels(&self) -> u32 {
        self.channels.len() as u32
    }

    fn syncpoint_read(&self, id: SyncpointId) -> u32 {
        self.syncpoints
            .get(id as usize)
            .map_or(0, |v| v.load(Ordering::Acquire))
    }

    fn syncpoint_write(&self, id: SyncpointId, value: u32) {
        if self.valid_syncpoint(id) {
            self.syncpoints[id as usize].store(value, Ordering::Release);
            self.check_threshold(id, true);
        }
    }

    fn syncpoint_increment(&self, id: SyncpointId) {
        if self.valid_syncpoint(id) {
            let new_val = self.syncpoints[id as usize].fetch_add(1, Ordering::AcqRel) + 1;
            log::trace!("sim: syncpoint[{}] incremented to {}", id, new_val);
            self.check_threshold(id, true);
        }
    }

    fn syncpoint_base_read(&self, base: u32) -> u32 {
        self.bases
            .get(base as usize)
            .map_or(0, |v| v.load(Ordering::Acquire))
    }

    fn syncpoint_base_write(&self, base: u32, value: u32) {
        if let Some(reg) = self.bases.get(base as usize) {
            reg.store(value, Ordering::Release);
        }
    }

    fn set_threshold(&self, id: SyncpointId, threshold: u32) {
        if self.valid_syncpoint(id) {
            self.thresholds[id as usize].store(threshold, Ordering::Release);
        }
    }

    fn enable_threshold_interrupt(&self, id: SyncpointId) {
        if self.valid_syncpoint(id) {
            self.int_enabled[id as usize].store(true, Ordering::Release);
            self.check_threshold(id, false);
        }
    }

    fn disable_threshold_interrupt(&self, id: SyncpointId) {
        if self.valid_syncpoint(id) {
            self.int_enabled[id as usize].store(false, Ordering::Release);
        }
    }

    fn interrupt_status(&self, line: u32) -> u32 {
        self.int_status
            .get(line as usize)
            .map_or(0, |s| s.load(Ordering::Acquire))
    }

    fn ack_interrupt(&self, line: u32, mask: u32) {
        if let Some(status) = self.int_status.get(line as usize) {
            status.fetch_and(!mask, Ordering::AcqRel);
        }
    }

    fn set_interrupt_handler(&self, handler: Option<InterruptHandler>) {
        *self.handler.write() = handler;
    }

    fn cdma_start(&self, channel: ChannelId, base: DmaAddr, size: u32) {
        self.with_channel(channel, |chan| {
            chan.base = base;
            chan.size = size;
            chan.get = 0;
            chan.put = 0;
            chan.running = true;
            chan.frozen = false;
            chan.fault = None;
            chan.reset_fetch();
        });
    }

    fn cdma_kick(&self, channel: ChannelId, put: u32) {
        self.with_channel(channel, |chan| chan.put = put);
    }

    fn cdma_get(&self, channel: ChannelId) -> u32 {
        self.channels
            .get(channel as usize)
            .map_or(0, |c| c.lock().get)
    }

    fn cdma_stop(&self, channel: ChannelId) {
        self.with_channel(channel, |chan| chan.running = false);
    }

    fn cdma_freeze(&self, channel: ChannelId) {
        self.with_channel(channel, |chan| chan.frozen = true);
    }

    fn cdma_resume(&self, channel: ChannelId, get: u32) {
        self.with_channel(channel, |chan| {
            chan.get = get;
            chan.frozen = false;
            chan.reset_fetch();
        });
    }

    fn set_stream_id(&self, channel: ChannelId, stream_id: Option<u32>) {
        self.with_channel(channel, |chan| chan.stream_id = stream_id);
    }

    fn bind_dma(&self, device: Arc<DmaDevice>) {
        *self.dma.write() = Some(device);
    }
}

/// Background thread driving `SimHardware::run_all`. Stops on drop.
pub struct SimExecutor {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimExecutor {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SimExecutor {
    fn drop(&mut self) {
        self.stop();
    }
}
