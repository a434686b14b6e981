// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware register abstraction.
//!
//! The core drives syncpoints, threshold interrupts and channel command DMA
//! through this trait. `SimHardware` is a software model of the register file
//! and command processor; a real register backend implements the same trait.

pub mod sim;

use std::sync::Arc;

use nvhost_common::{ChannelId, DmaAddr, SyncpointId};

use crate::device::DmaDevice;

pub use sim::{RegisterWrite, SimExecutor, SimHardware};

/// Called with the interrupt line index when a line asserts.
pub type InterruptHandler = Arc<dyn Fn(u32) + Send + Sync>;

pub trait HostHardware: Send + Sync {
    fn name(&self) -> &str;
    fn num_syncpoints(&self) -> u32;
    fn num_syncpoint_bases(&self) -> u32;
    fn num_channels(&self) -> u32;

    // ── Syncpoints ───────────────────────────────────────────────────────
    fn syncpoint_read(&self, id: SyncpointId) -> u32;
    fn syncpoint_write(&self, id: SyncpointId, value: u32);
    fn syncpoint_increment(&self, id: SyncpointId);
    fn syncpoint_base_read(&self, base: u32) -> u32;
    fn syncpoint_base_write(&self, base: u32, value: u32);

    // ── Threshold interrupts ─────────────────────────────────────────────
    fn set_threshold(&self, id: SyncpointId, threshold: u32);
    fn enable_threshold_interrupt(&self, id: SyncpointId);
    fn disable_threshold_interrupt(&self, id: SyncpointId);
    /// Status bits of one line; bit `n` is syncpoint `line * 32 + n`.
    fn interrupt_status(&self, line: u32) -> u32;
    fn ack_interrupt(&self, line: u32, mask: u32);
    fn set_interrupt_handler(&self, handler: Option<InterruptHandler>);

    // ── Channel command DMA ──────────────────────────────────────────────
    /// Point the channel at a ring of `size` bytes and reset GET/PUT.
    fn cdma_start(&self, channel: ChannelId, base: DmaAddr, size: u32);
    /// Publish a new PUT offset.
    fn cdma_kick(&self, channel: ChannelId, put: u32);
    /// Current GET offset.
    fn cdma_get(&self, channel: ChannelId) -> u32;
    fn cdma_stop(&self, channel: ChannelId);
    /// Halt fetching without losing position.
    fn cdma_freeze(&self, channel: ChannelId);
    /// Continue fetching from `get`, discarding any partially executed opcode.
    fn cdma_resume(&self, channel: ChannelId, get: u32);

    /// Select the memory-context stream used by the channel's engine.
    fn set_stream_id(&self, _channel: ChannelId, _stream_id: Option<u32>) {}

    /// Device through which the host fetches push buffers and gathers.
    /// Only needed by implementations that perform DMA in software.
    fn bind_dma(&self, _device: Arc<DmaDevice>) {}
}
