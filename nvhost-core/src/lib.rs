// SPDX-FileCopyrightText: 2025 nvhost contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Generic host1x-style command submission.
//!
//! Syncpoints, their interrupts and fences, channel command DMA, buffer
//! pinning, memory-context isolation and the job pipeline that ties them
//! together. Chip-specific engines sit on top of `Client`; register access
//! goes through `hw::HostHardware`.

pub mod bo;
pub mod cdma;
pub mod channel;
pub mod client;
pub mod context;
pub mod device;
pub mod fence;
pub mod firewall;
pub mod host;
pub mod hw;
pub mod intr;
pub mod iommu;
pub mod job;
pub mod memory;
pub mod opcode;
pub mod syncpoint;
pub mod workqueue;

pub use bo::{BoCache, BoMapping, HostBo, SysmemBo};
pub use channel::{Channel, ChannelManager};
pub use client::{Client, ClientConfig};
pub use context::{MemoryContext, MemoryContextManager};
pub use device::{DmaDevice, DmaDirection};
pub use fence::{Fence, FenceResult, WaitState};
pub use host::{Capabilities, Host};
pub use hw::{HostHardware, SimHardware};
pub use job::{CommandEntry, Job, JobFlags, JobHandle, JobState, Relocation};
pub use memory::PhysicalMemory;
pub use syncpoint::{Syncpoint, SyncpointFlags, SyncpointManager};
